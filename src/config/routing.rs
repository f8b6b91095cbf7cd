//! Routing, dedup and consumer configuration types.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::route_table::RouteMode;

/// Type classification and routing-key settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Behavior for types not listed explicitly.
    pub mode: RouteMode,
    /// Qualified type names handled in-process.
    pub local_types: Vec<String>,
    /// Qualified type names sent over the transport.
    pub remote_types: Vec<String>,
    /// Qualified type name -> routing key prefix.
    pub queue_prefixes: HashMap<String, String>,
    /// Per-request reply timeout. `None` waits until reply or cancellation.
    pub request_timeout_ms: Option<u64>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: RouteMode::ImplicitLocal,
            local_types: Vec::new(),
            remote_types: Vec::new(),
            queue_prefixes: HashMap::new(),
            request_timeout_ms: Some(30_000),
        }
    }
}

impl RoutingConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Notification dedup window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Seconds a notification digest is remembered.
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// How notification copies are spread across nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationDistribution {
    /// Every node gets its own queue and every notification.
    #[default]
    Dedicated,
    /// Nodes share one queue; each notification reaches one node.
    RoundRobin,
}

/// Inbound consumer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries allowed in flight per subscription.
    pub prefetch: u16,
    pub notification_distribution: NotificationDistribution,
    /// Names this node's dedicated queues. Random when unset.
    pub node_id: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 16,
            notification_distribution: NotificationDistribution::Dedicated,
            node_id: None,
        }
    }
}

impl ConsumerConfig {
    /// Configured node id, or a fresh UUID.
    pub fn resolve_node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}
