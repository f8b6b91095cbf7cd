//! Messaging transport configuration types.

use serde::Deserialize;

/// Transport discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process hub (no external broker).
    Channel,
    /// AMQP/RabbitMQ messaging.
    Amqp,
    /// NATS request/reply.
    Nats,
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Transports in dispatch precedence order.
    pub transports: Vec<TransportKind>,
    /// In-process channel configuration.
    pub channel: ChannelConfig,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
    /// NATS-specific configuration.
    pub nats: NatsConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            transports: vec![TransportKind::Channel],
            channel: ChannelConfig::default(),
            amqp: AmqpConfig::default(),
            nats: NatsConfig::default(),
        }
    }
}

/// In-process channel configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Name of a process-wide hub to join.
    /// - `None`: a private hub, reachable only by this router
    /// - `Some("bus")`: every router in the process naming "bus" shares it
    pub hub: Option<String>,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Direct exchange messages are published to.
    pub exchange: String,
    /// Types this transport carries. `None` carries every type.
    pub types: Option<Vec<String>>,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "courier".to_string(),
            types: None,
        }
    }
}

/// NATS-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Types this transport carries. `None` carries every type.
    pub types: Option<Vec<String>>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            types: None,
        }
    }
}
