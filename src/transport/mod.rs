//! Message transports.
//!
//! Two transport shapes carry routed messages between nodes:
//!
//! - [`Transport`] (broker kind): fire a message at a routing key and learn
//!   whether anything could receive it; replies travel back through a
//!   private reply queue and are correlated by the caller.
//! - [`RpcChannel`] (RPC kind): native request/reply, correlation handled
//!   by the underlying client.
//!
//! Both are [`Subscriber`]s, which is all the inbound consumer needs.
//!
//! Implementations:
//! - `ChannelTransport`: in-memory hub (standalone mode and tests)
//! - `AmqpTransport`: RabbitMQ via lapin
//! - `NatsRpcChannel`: NATS core request/reply

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{MessagingConfig, NotificationDistribution, TransportKind};
use crate::dispatch::{BrokerDispatcher, DispatchScope, DispatcherSet, RpcDispatcher};

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;
#[cfg(feature = "nats")]
pub mod nats;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
#[cfg(feature = "channel")]
pub use channel::ChannelTransport;
#[cfg(feature = "nats")]
pub use nats::NatsRpcChannel;

// ============================================================================
// Errors
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur talking to a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Reply failed: {0}")]
    Reply(String),

    #[error("Transport '{0}' is not compiled in; rebuild with --features {0}")]
    Unsupported(&'static str),

    #[error("Transport closed")]
    Closed,
}

// ============================================================================
// Messages
// ============================================================================

/// Whether a subscription carries requests or notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Notification,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Notification => f.write_str("notification"),
        }
    }
}

/// Where a subscription listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Routing key the queue is bound to.
    pub routing_key: String,
    /// Queue (or queue group) name. Consumers sharing a name compete.
    pub queue: String,
    pub kind: MessageKind,
    /// Queue belongs to this node only and goes away with it.
    pub exclusive: bool,
    /// Unacknowledged deliveries allowed in flight.
    pub prefetch: u16,
}

impl Binding {
    /// Shared request queue: every node serving the type competes on it.
    pub fn request(routing_key: impl Into<String>, prefetch: u16) -> Self {
        let routing_key = routing_key.into();
        Self {
            queue: routing_key.clone(),
            routing_key,
            kind: MessageKind::Request,
            exclusive: false,
            prefetch,
        }
    }

    /// Notification queue named per the distribution policy.
    ///
    /// Dedicated queues are `routingKey.nodeId`, so every node receives every
    /// notification; round-robin queues share the bare routing key.
    pub fn notification(
        routing_key: impl Into<String>,
        distribution: NotificationDistribution,
        node_id: &str,
        prefetch: u16,
    ) -> Self {
        let routing_key = routing_key.into();
        let (queue, exclusive) = match distribution {
            NotificationDistribution::Dedicated => (format!("{}.{}", routing_key, node_id), true),
            NotificationDistribution::RoundRobin => (routing_key.clone(), false),
        };
        Self {
            routing_key,
            queue,
            kind: MessageKind::Notification,
            exclusive,
            prefetch,
        }
    }
}

/// Outbound message on the broker transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    /// Address replies must be sent to.
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    /// A one-way message.
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Expect a reply at `reply_to`, correlated by `correlation_id`.
    pub fn with_reply(mut self, correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Result of a broker send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by at least one queue.
    Delivered,
    /// Nothing is bound to the routing key.
    Unroutable,
}

/// Result of an RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Reply(Vec<u8>),
    /// No responder is listening on the routing key.
    Unroutable,
}

/// Transport-specific handling of one inbound delivery.
#[async_trait]
pub trait DeliveryControl: Send + Sync {
    /// Whether the delivery carries a reply path.
    fn can_reply(&self) -> bool;

    /// Send a reply to the delivery's origin.
    async fn reply(&self, body: Vec<u8>) -> Result<()>;

    /// Acknowledge the delivery.
    async fn ack(&self) -> Result<()>;
}

/// One message received from a subscription.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    control: Box<dyn DeliveryControl>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        correlation_id: Option<String>,
        control: Box<dyn DeliveryControl>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            correlation_id,
            control,
        }
    }

    pub fn can_reply(&self) -> bool {
        self.control.can_reply()
    }

    pub async fn reply(&self, body: Vec<u8>) -> Result<()> {
        self.control.reply(body).await
    }

    pub async fn ack(&self) -> Result<()> {
        self.control.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("correlation_id", &self.correlation_id)
            .field("can_reply", &self.can_reply())
            .finish()
    }
}

/// Stream of deliveries for one subscription. Ends when the transport closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Private queue a broker dispatcher receives replies on.
pub struct ReplyQueue {
    /// Address to put in `reply_to`.
    pub address: String,
    pub deliveries: DeliveryStream,
}

impl fmt::Debug for ReplyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyQueue")
            .field("address", &self.address)
            .finish()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Source of inbound deliveries.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &'static str;

    /// Bind a queue and start receiving from it.
    async fn subscribe(&self, binding: Binding) -> Result<DeliveryStream>;
}

/// Broker-queue transport.
#[async_trait]
pub trait Transport: Subscriber {
    /// Publish to a routing key, reporting whether any queue accepted it.
    async fn send(&self, message: OutboundMessage) -> Result<SendOutcome>;

    /// Open a private queue for correlated replies.
    async fn open_reply_queue(&self) -> Result<ReplyQueue>;
}

/// RPC-channel transport with native request/reply.
#[async_trait]
pub trait RpcChannel: Subscriber {
    /// Send a request and wait for the reply.
    async fn call(&self, routing_key: &str, body: Vec<u8>) -> Result<CallOutcome>;

    /// Send a one-way message.
    async fn cast(&self, routing_key: &str, body: Vec<u8>) -> Result<SendOutcome>;
}

// ============================================================================
// Factory
// ============================================================================

/// Dispatchers and subscribers for the configured transports.
pub struct Connected {
    /// Outbound dispatchers in precedence order.
    pub dispatchers: DispatcherSet,
    /// Inbound subscription sources, one per transport.
    pub subscribers: Vec<Arc<dyn Subscriber>>,
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected")
            .field("dispatchers", &self.dispatchers)
            .field(
                "subscribers",
                &self.subscribers.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Connect every configured transport, in precedence order.
///
/// Requires the corresponding feature for each listed transport:
/// - channel: `--features channel` (included in default)
/// - AMQP: `--features amqp`
/// - NATS: `--features nats`
pub async fn connect_dispatchers(
    config: &MessagingConfig,
    request_timeout: Option<Duration>,
) -> Result<Connected> {
    let mut dispatchers = DispatcherSet::new();
    let mut subscribers: Vec<Arc<dyn Subscriber>> = Vec::new();

    for kind in &config.transports {
        match kind {
            TransportKind::Channel => {
                #[cfg(feature = "channel")]
                {
                    let transport = Arc::new(match config.channel.hub.as_deref() {
                        Some(name) => ChannelTransport::named(name),
                        None => ChannelTransport::new(),
                    });
                    let dispatcher = BrokerDispatcher::connect(
                        transport.clone(),
                        DispatchScope::All,
                        request_timeout,
                    )
                    .await?;
                    dispatchers.push(Arc::new(dispatcher));
                    subscribers.push(transport);
                    info!(transport = "channel", "Transport connected");
                }

                #[cfg(not(feature = "channel"))]
                {
                    return Err(TransportError::Unsupported("channel"));
                }
            }
            TransportKind::Amqp => {
                #[cfg(feature = "amqp")]
                {
                    let transport = Arc::new(AmqpTransport::connect(&config.amqp).await?);
                    let dispatcher = BrokerDispatcher::connect(
                        transport.clone(),
                        DispatchScope::from_types(config.amqp.types.as_deref()),
                        request_timeout,
                    )
                    .await?;
                    dispatchers.push(Arc::new(dispatcher));
                    subscribers.push(transport);
                    info!(transport = "amqp", url = %config.amqp.url, "Transport connected");
                }

                #[cfg(not(feature = "amqp"))]
                {
                    return Err(TransportError::Unsupported("amqp"));
                }
            }
            TransportKind::Nats => {
                #[cfg(feature = "nats")]
                {
                    let channel = Arc::new(NatsRpcChannel::connect(&config.nats).await?);
                    let dispatcher = RpcDispatcher::new(
                        channel.clone(),
                        DispatchScope::from_types(config.nats.types.as_deref()),
                        request_timeout,
                    );
                    dispatchers.push(Arc::new(dispatcher));
                    subscribers.push(channel);
                    info!(transport = "nats", url = %config.nats.url, "Transport connected");
                }

                #[cfg(not(feature = "nats"))]
                {
                    return Err(TransportError::Unsupported("nats"));
                }
            }
        }
    }

    Ok(Connected {
        dispatchers,
        subscribers,
    })
}
