//! Route-aware mediator.
//!
//! Classifies each message type against the [`RouteTable`] and either
//! handles it in-process or hands it to the dispatcher set.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Mediator, MediatorError};
use crate::dispatch::{Destination, DispatchError, DispatcherSet};
use crate::envelope::CodecError;
use crate::fanout::PublishError;
use crate::handler::HandlerError;
use crate::message::{Message, Notification, Request};
use crate::route_table::{Route, RouteTable};

/// Result type for routed operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Caller-facing routing errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No route for {0}")]
    RouteNotFound(String),

    /// No dispatcher could carry the message, or nothing was listening.
    #[error("Unroutable request: {0}")]
    Unroutable(String),

    /// A handler failed, locally or on a remote peer.
    #[error(transparent)]
    Handler(HandlerError),

    #[error(transparent)]
    Publish(PublishError),

    #[error(transparent)]
    Dispatch(DispatchError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("No handler registered for {0}")]
    NoHandler(String),
}

impl RouterError {
    /// The handler failure behind this error, if any.
    pub fn handler_error(&self) -> Option<&HandlerError> {
        match self {
            Self::Handler(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DispatchError> for RouterError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Remote(e) => Self::Handler(e),
            DispatchError::Unroutable(key) => Self::Unroutable(key),
            DispatchError::NoDispatcher(type_name) => Self::Unroutable(type_name),
            DispatchError::Codec(e) => Self::Codec(e),
            other => Self::Dispatch(other),
        }
    }
}

impl From<MediatorError> for RouterError {
    fn from(e: MediatorError) -> Self {
        match e {
            MediatorError::NoHandler(type_name) => Self::NoHandler(type_name),
            MediatorError::Handler(e) => Self::Handler(e),
            MediatorError::Publish(e) => Self::Publish(e),
        }
    }
}

/// Origin of a publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PropagationScope {
    /// Published by application code on this node; may go to peers.
    #[default]
    Origin,
    /// Copy received from a peer; handled in-process only.
    RemoteOrigin,
}

/// Mediator that routes remote types over the transports.
pub struct RoutingMediator {
    local: Mediator,
    routes: Arc<RouteTable>,
    dispatchers: DispatcherSet,
}

impl RoutingMediator {
    pub fn new(local: Mediator, routes: Arc<RouteTable>, dispatchers: DispatcherSet) -> Self {
        Self {
            local,
            routes,
            dispatchers,
        }
    }

    /// The in-process mediator.
    pub fn local(&self) -> &Mediator {
        &self.local
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn dispatchers(&self) -> &DispatcherSet {
        &self.dispatchers
    }

    /// Destination of message type `M`.
    pub fn destination<M: Message>(&self) -> Destination {
        let descriptor = M::descriptor();
        Destination::new(descriptor.qualified_name(), self.routes.routing_key(&descriptor))
    }

    /// Send a request and wait for its response.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response> {
        self.send_with(request, &CancellationToken::new()).await
    }

    /// Send a request, giving up when `cancel` fires.
    ///
    /// Cancellation only affects remote requests; a local handler runs to
    /// completion.
    #[tracing::instrument(
        name = "router.send",
        skip_all,
        fields(message_type = tracing::field::Empty, route = tracing::field::Empty)
    )]
    pub async fn send_with<R: Request>(
        &self,
        request: R,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let destination = self.destination::<R>();
        let route = self.routes.classify(&destination.type_name);
        let span = tracing::Span::current();
        span.record("message_type", destination.type_name.as_str());
        span.record("route", tracing::field::debug(&route));

        match route {
            Route::Local => Ok(self.local.send(request).await?),
            Route::Remote => {
                let body = serde_json::to_vec(&request).map_err(CodecError::Encode)?;
                let reply = self
                    .dispatchers
                    .dispatch_request(&destination, body, cancel)
                    .await?;
                Ok(serde_json::from_slice(&reply).map_err(CodecError::Decode)?)
            }
            Route::NotFound => {
                warn!("Request type has no route");
                Err(RouterError::RouteNotFound(destination.type_name))
            }
        }
    }

    /// Publish a notification originating on this node.
    pub async fn publish<N: Notification>(&self, notification: N) -> Result<()> {
        self.publish_in(notification, PropagationScope::Origin).await
    }

    /// Publish a notification in the given propagation scope.
    ///
    /// Remote-origin copies always run the local handlers and never reach
    /// the dispatchers. Otherwise a remote type is handed to the dispatcher
    /// set and local handlers are left to the receiving side.
    #[tracing::instrument(
        name = "router.publish",
        skip_all,
        fields(message_type = tracing::field::Empty, scope = ?scope)
    )]
    pub async fn publish_in<N: Notification>(
        &self,
        notification: N,
        scope: PropagationScope,
    ) -> Result<()> {
        let destination = self.destination::<N>();
        tracing::Span::current().record("message_type", destination.type_name.as_str());

        if scope == PropagationScope::RemoteOrigin {
            return Ok(self.local.publish_shared(Arc::new(notification)).await?);
        }

        match self.routes.classify(&destination.type_name) {
            Route::Local => Ok(self.local.publish_shared(Arc::new(notification)).await?),
            Route::Remote => {
                let body = serde_json::to_vec(&notification).map_err(CodecError::Encode)?;
                self.dispatchers.notify(&destination, body).await?;
                debug!("Notification handed to dispatcher");
                Ok(())
            }
            Route::NotFound => {
                warn!("Notification type has no route");
                Err(RouterError::RouteNotFound(destination.type_name))
            }
        }
    }
}

impl std::fmt::Debug for RoutingMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingMediator")
            .field("local", &self.local)
            .field("routes", &self.routes)
            .field("dispatchers", &self.dispatchers)
            .finish()
    }
}
