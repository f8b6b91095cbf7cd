//! Outbound dispatch of requests and notifications to remote peers.
//!
//! An [`OutboundDispatcher`] wraps one transport. Several may be configured;
//! a [`DispatcherSet`] tries them in precedence order and uses the first
//! that declares itself able to carry the type.
//!
//! Implementations:
//! - [`BrokerDispatcher`]: broker queues, caller-side correlation
//! - [`RpcDispatcher`]: RPC channel, native correlation

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::envelope::{CodecError, Envelope, ResponseEnvelope};
use crate::handler::HandlerError;
use crate::transport::TransportError;

mod broker;
mod rpc;

pub use broker::BrokerDispatcher;
pub use rpc::RpcDispatcher;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur dispatching to a remote peer.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No configured dispatcher can route {0}")]
    NoDispatcher(String),

    #[error("Unroutable: nothing is listening on {0}")]
    Unroutable(String),

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The remote handler failed; carries its error unchanged.
    #[error("{0}")]
    Remote(HandlerError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Where a message is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Qualified type name, matched against dispatcher scopes.
    pub type_name: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(type_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Types a dispatcher is willing to carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DispatchScope {
    #[default]
    All,
    Only(HashSet<String>),
}

impl DispatchScope {
    /// `None` means every type.
    pub fn from_types(types: Option<&[String]>) -> Self {
        match types {
            Some(types) => Self::Only(types.iter().cloned().collect()),
            None => Self::All,
        }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(types) => types.contains(type_name),
        }
    }
}

/// Sends requests and notifications over one transport.
#[async_trait]
pub trait OutboundDispatcher: Send + Sync {
    /// Dispatcher name for logs.
    fn name(&self) -> &str;

    /// Whether this dispatcher will carry `destination`.
    fn can_dispatch(&self, destination: &Destination) -> bool;

    /// Send a serialized request and wait for the serialized response.
    ///
    /// A remote `Exception` comes back as [`DispatchError::Remote`], never as
    /// a value. Cancelling `cancel` stops the wait and releases the call's
    /// correlation state; it does not stop the remote handler.
    async fn dispatch_request(
        &self,
        destination: &Destination,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    /// Send a serialized notification without waiting for anything.
    async fn notify(&self, destination: &Destination, body: Vec<u8>) -> Result<()>;
}

/// Dispatchers in precedence order.
#[derive(Clone, Default)]
pub struct DispatcherSet {
    dispatchers: Vec<Arc<dyn OutboundDispatcher>>,
}

impl DispatcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a dispatcher at the lowest precedence.
    pub fn push(&mut self, dispatcher: Arc<dyn OutboundDispatcher>) {
        self.dispatchers.push(dispatcher);
    }

    pub fn with(mut self, dispatcher: Arc<dyn OutboundDispatcher>) -> Self {
        self.push(dispatcher);
        self
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    /// Dispatchers in precedence order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn OutboundDispatcher>> {
        self.dispatchers.iter()
    }

    /// First dispatcher able to carry `destination`.
    pub fn select(&self, destination: &Destination) -> Result<&Arc<dyn OutboundDispatcher>> {
        self.dispatchers
            .iter()
            .find(|d| d.can_dispatch(destination))
            .ok_or_else(|| DispatchError::NoDispatcher(destination.type_name.clone()))
    }

    pub async fn dispatch_request(
        &self,
        destination: &Destination,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let dispatcher = self.select(destination)?;
        debug!(
            dispatcher = dispatcher.name(),
            routing_key = %destination.routing_key,
            "Dispatching request"
        );
        dispatcher.dispatch_request(destination, body, cancel).await
    }

    pub async fn notify(&self, destination: &Destination, body: Vec<u8>) -> Result<()> {
        let dispatcher = self.select(destination)?;
        debug!(
            dispatcher = dispatcher.name(),
            routing_key = %destination.routing_key,
            "Dispatching notification"
        );
        dispatcher.notify(destination, body).await
    }
}

impl fmt::Debug for DispatcherSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.dispatchers.iter().map(|d| d.name()))
            .finish()
    }
}

/// Wrap a serialized message in its wire envelope.
pub(crate) fn seal(destination: &Destination, body: Vec<u8>) -> Result<Vec<u8>> {
    Ok(Envelope::new(destination.routing_key.clone(), body).encode()?)
}

/// Unwrap reply bytes into the response body, re-raising a remote failure.
pub(crate) fn open_response(reply: &[u8]) -> Result<Vec<u8>> {
    ResponseEnvelope::decode(reply)?
        .into_result()?
        .map_err(DispatchError::Remote)
}

/// Bound `fut` by an optional time limit.
pub(crate) async fn within<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DispatchError::Timeout(limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests;
