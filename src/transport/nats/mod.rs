//! NATS core request/reply as an RPC channel.
//!
//! Requests use the client's native request/reply: NATS correlates the
//! reply inbox itself, and "no responders" is the unroutable signal.
//! Competing consumers are queue groups; dedicated notification
//! subscriptions are plain subscriptions, so every node gets a copy.
//! Core NATS has no acknowledgements, so `ack` is a no-op.
//! Nor does it have prefetch: `Binding::prefetch` is enforced by the
//! inbound consumer, which caps the deliveries it has in flight.

use async_trait::async_trait;
use async_nats::client::RequestErrorKind;
use async_nats::Client;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info};

use super::{
    Binding, CallOutcome, Delivery, DeliveryControl, DeliveryStream, MessageKind, Result,
    RpcChannel, SendOutcome, Subscriber, TransportError,
};
use crate::config::NatsConfig;

/// NATS RPC channel.
#[derive(Clone, Debug)]
pub struct NatsRpcChannel {
    client: Client,
}

impl NatsRpcChannel {
    /// Connect to the configured server.
    ///
    /// The client's own request timeout is disabled; the dispatcher's
    /// timeout and cancellation govern how long a call waits.
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .request_timeout(None)
            .connect(config.url.as_str())
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!(url = %config.url, "Connected to NATS");
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

struct NatsControl {
    client: Client,
    reply: Option<async_nats::Subject>,
}

#[async_trait]
impl DeliveryControl for NatsControl {
    fn can_reply(&self) -> bool {
        self.reply.is_some()
    }

    async fn reply(&self, body: Vec<u8>) -> Result<()> {
        let subject = self
            .reply
            .clone()
            .ok_or_else(|| TransportError::Reply("message has no reply subject".to_string()))?;
        self.client
            .publish(subject, Bytes::from(body))
            .await
            .map_err(|e| TransportError::Reply(e.to_string()))
    }

    async fn ack(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Subscriber for NatsRpcChannel {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn subscribe(&self, binding: Binding) -> Result<DeliveryStream> {
        let subject = binding.routing_key.clone();
        let subscription = if binding.kind == MessageKind::Notification && binding.exclusive {
            self.client.subscribe(subject).await
        } else {
            self.client
                .queue_subscribe(subject, binding.queue.clone())
                .await
        };
        let subscription = subscription
            .map_err(|e| TransportError::Subscribe(format!("Failed to subscribe: {}", e)))?;

        info!(
            subject = %binding.routing_key,
            queue_group = %binding.queue,
            kind = %binding.kind,
            "NATS subscription started"
        );

        let client = self.client.clone();
        let routing_key = binding.routing_key;
        Ok(subscription
            .map(move |message| {
                let control = NatsControl {
                    client: client.clone(),
                    reply: message.reply.clone(),
                };
                Delivery::new(
                    routing_key.clone(),
                    message.payload.to_vec(),
                    None,
                    Box::new(control),
                )
            })
            .boxed())
    }
}

#[async_trait]
impl RpcChannel for NatsRpcChannel {
    #[tracing::instrument(name = "transport.call", skip_all, fields(subject = %routing_key))]
    async fn call(&self, routing_key: &str, body: Vec<u8>) -> Result<CallOutcome> {
        match self
            .client
            .request(routing_key.to_string(), Bytes::from(body))
            .await
        {
            Ok(message) => Ok(CallOutcome::Reply(message.payload.to_vec())),
            Err(e) if e.kind() == RequestErrorKind::NoResponders => {
                debug!("No responders");
                Ok(CallOutcome::Unroutable)
            }
            Err(e) => Err(TransportError::Publish(format!("Request failed: {}", e))),
        }
    }

    async fn cast(&self, routing_key: &str, body: Vec<u8>) -> Result<SendOutcome> {
        self.client
            .publish(routing_key.to_string(), Bytes::from(body))
            .await
            .map_err(|e| TransportError::Publish(format!("Failed to publish: {}", e)))?;
        // Core NATS publishes are fire-and-forget; absence of subscribers is invisible.
        Ok(SendOutcome::Delivered)
    }
}
