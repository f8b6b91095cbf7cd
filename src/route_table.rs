//! Per-type classification into local, remote or unknown.
//!
//! Built once from [`RoutingConfig`] at startup and shared read-only.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::config::RoutingConfig;
use crate::message::TypeDescriptor;

/// Default behavior for types not listed explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    /// Everything is handled in-process unless listed as remote.
    #[default]
    ImplicitLocal,
    /// Everything goes over the transport unless listed as local.
    ImplicitRemote,
    /// Only listed types are routable.
    Explicit,
}

/// Classification of one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote,
    NotFound,
}

/// Immutable routing table keyed by qualified type name.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    mode: RouteMode,
    local_types: HashSet<String>,
    remote_types: HashSet<String>,
    queue_prefixes: HashMap<String, String>,
}

impl RouteTable {
    pub fn new(mode: RouteMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Build the table from configuration.
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            mode: config.mode,
            local_types: config.local_types.iter().cloned().collect(),
            remote_types: config.remote_types.iter().cloned().collect(),
            queue_prefixes: config.queue_prefixes.clone(),
        }
    }

    pub fn with_local(mut self, type_name: impl Into<String>) -> Self {
        self.local_types.insert(type_name.into());
        self
    }

    pub fn with_remote(mut self, type_name: impl Into<String>) -> Self {
        self.remote_types.insert(type_name.into());
        self
    }

    pub fn with_queue_prefix(mut self, type_name: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.queue_prefixes.insert(type_name.into(), prefix.into());
        self
    }

    pub fn mode(&self) -> RouteMode {
        self.mode
    }

    /// Classify a type by its qualified name.
    pub fn classify(&self, type_name: &str) -> Route {
        let local = self.local_types.contains(type_name);
        let remote = self.remote_types.contains(type_name);
        match self.mode {
            RouteMode::ImplicitLocal if remote => Route::Remote,
            RouteMode::ImplicitLocal => Route::Local,
            RouteMode::ImplicitRemote if local => Route::Local,
            RouteMode::ImplicitRemote => Route::Remote,
            RouteMode::Explicit if local => Route::Local,
            RouteMode::Explicit if remote => Route::Remote,
            RouteMode::Explicit => Route::NotFound,
        }
    }

    /// Queue prefix configured for a type.
    pub fn queue_prefix(&self, type_name: &str) -> Option<&str> {
        self.queue_prefixes.get(type_name).map(String::as_str)
    }

    /// Routing key for a type, including its configured prefix.
    pub fn routing_key(&self, descriptor: &TypeDescriptor) -> String {
        descriptor.routing_key(self.queue_prefix(&descriptor.qualified_name()))
    }
}
