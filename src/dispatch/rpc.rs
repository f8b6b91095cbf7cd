//! Dispatch over an RPC channel with native request/reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{open_response, seal, within, Destination, DispatchError, DispatchScope, OutboundDispatcher, Result};
use crate::transport::{CallOutcome, RpcChannel, SendOutcome};

/// RPC-channel dispatcher.
pub struct RpcDispatcher {
    name: String,
    channel: Arc<dyn RpcChannel>,
    scope: DispatchScope,
    request_timeout: Option<Duration>,
}

impl RpcDispatcher {
    pub fn new(
        channel: Arc<dyn RpcChannel>,
        scope: DispatchScope,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: format!("rpc:{}", channel.name()),
            channel,
            scope,
            request_timeout,
        }
    }
}

impl std::fmt::Debug for RpcDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcDispatcher")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish()
    }
}

#[async_trait]
impl OutboundDispatcher for RpcDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_dispatch(&self, destination: &Destination) -> bool {
        self.scope.contains(&destination.type_name)
    }

    #[tracing::instrument(name = "dispatch.request", skip_all, fields(routing_key = %destination.routing_key))]
    async fn dispatch_request(
        &self,
        destination: &Destination,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let envelope = seal(destination, body)?;
        let call = async {
            let outcome = self.channel.call(&destination.routing_key, envelope).await?;
            Ok::<_, DispatchError>(outcome)
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            outcome = within(self.request_timeout, call) => outcome?,
        };

        match outcome {
            CallOutcome::Reply(reply) => open_response(&reply),
            CallOutcome::Unroutable => {
                warn!("Request is unroutable");
                Err(DispatchError::Unroutable(destination.routing_key.clone()))
            }
        }
    }

    #[tracing::instrument(name = "dispatch.notify", skip_all, fields(routing_key = %destination.routing_key))]
    async fn notify(&self, destination: &Destination, body: Vec<u8>) -> Result<()> {
        let envelope = seal(destination, body)?;
        match self.channel.cast(&destination.routing_key, envelope).await? {
            SendOutcome::Delivered => debug!("Notification sent"),
            SendOutcome::Unroutable => warn!("Notification has no subscribers"),
        }
        Ok(())
    }
}
