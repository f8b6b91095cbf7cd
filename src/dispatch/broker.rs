//! Dispatch over a broker transport with caller-side correlation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{open_response, seal, within, Destination, DispatchError, DispatchScope, OutboundDispatcher, Result};
use crate::correlation::CorrelationTable;
use crate::transport::{self, DeliveryStream, OutboundMessage, SendOutcome, Transport, TransportError};

/// Broker-queue dispatcher.
///
/// Owns a private reply queue and a background task that matches replies
/// arriving on it to outstanding calls.
pub struct BrokerDispatcher {
    name: String,
    transport: Arc<dyn Transport>,
    correlations: Arc<CorrelationTable>,
    reply_address: String,
    scope: DispatchScope,
    request_timeout: Option<Duration>,
    reply_pump: JoinHandle<()>,
}

impl BrokerDispatcher {
    /// Open the reply queue and start the reply pump.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        scope: DispatchScope,
        request_timeout: Option<Duration>,
    ) -> transport::Result<Self> {
        let reply_queue = transport.open_reply_queue().await?;
        let correlations = CorrelationTable::new();
        let reply_pump = tokio::spawn(pump_replies(
            reply_queue.deliveries,
            Arc::clone(&correlations),
        ));

        info!(
            transport = transport.name(),
            reply_address = %reply_queue.address,
            "Broker dispatcher ready"
        );

        Ok(Self {
            name: format!("broker:{}", transport.name()),
            transport,
            correlations,
            reply_address: reply_queue.address,
            scope,
            request_timeout,
            reply_pump,
        })
    }

    /// Address replies are expected on.
    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    /// Calls currently awaiting a reply.
    pub fn pending(&self) -> usize {
        self.correlations.len()
    }
}

impl Drop for BrokerDispatcher {
    fn drop(&mut self) {
        self.reply_pump.abort();
    }
}

impl std::fmt::Debug for BrokerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerDispatcher")
            .field("name", &self.name)
            .field("reply_address", &self.reply_address)
            .field("pending", &self.pending())
            .finish()
    }
}

async fn pump_replies(mut deliveries: DeliveryStream, correlations: Arc<CorrelationTable>) {
    while let Some(delivery) = deliveries.next().await {
        match delivery.correlation_id.as_deref() {
            Some(id) => {
                if !correlations.resolve(id, delivery.body) {
                    debug!(correlation_id = %id, "Dropped reply for unknown or abandoned call");
                }
            }
            None => warn!("Dropped reply without correlation id"),
        }
    }

    let failed = correlations.fail_all(|| DispatchError::Transport(TransportError::Closed));
    warn!(failed, "Reply queue closed");
}

#[async_trait]
impl OutboundDispatcher for BrokerDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_dispatch(&self, destination: &Destination) -> bool {
        self.scope.contains(&destination.type_name)
    }

    #[tracing::instrument(
        name = "dispatch.request",
        skip_all,
        fields(routing_key = %destination.routing_key, correlation_id = tracing::field::Empty)
    )]
    async fn dispatch_request(
        &self,
        destination: &Destination,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let envelope = seal(destination, body)?;

        // Dropping `pending` on any early return removes the entry.
        let pending = self.correlations.register();
        let correlation_id = pending.correlation_id().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let message = OutboundMessage::new(destination.routing_key.clone(), envelope)
            .with_reply(correlation_id, self.reply_address.clone());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            outcome = self.transport.send(message) => outcome?,
        };
        if outcome == SendOutcome::Unroutable {
            warn!("Request is unroutable");
            return Err(DispatchError::Unroutable(destination.routing_key.clone()));
        }

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Request cancelled while awaiting reply");
                return Err(DispatchError::Cancelled);
            }
            reply = within(self.request_timeout, pending) => reply?,
        };

        open_response(&reply)
    }

    #[tracing::instrument(name = "dispatch.notify", skip_all, fields(routing_key = %destination.routing_key))]
    async fn notify(&self, destination: &Destination, body: Vec<u8>) -> Result<()> {
        let envelope = seal(destination, body)?;
        let message = OutboundMessage::new(destination.routing_key.clone(), envelope);
        match self.transport.send(message).await? {
            SendOutcome::Delivered => debug!("Notification sent"),
            SendOutcome::Unroutable => warn!("Notification has no subscribers"),
        }
        Ok(())
    }
}
