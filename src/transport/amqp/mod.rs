//! AMQP (RabbitMQ) transport.
//!
//! Messages go to a durable direct exchange with the type's routing key.
//! Publishes are `mandatory` on a confirm channel, so a message no queue is
//! bound for comes back as a returned confirmation: that is the unroutable
//! signal. Replies travel through the default exchange straight to the
//! caller's exclusive reply queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use super::{
    Binding, Delivery, DeliveryControl, DeliveryStream, OutboundMessage, ReplyQueue, Result,
    SendOutcome, Subscriber, Transport, TransportError,
};
use crate::config::AmqpConfig;
use crate::utils::retry::reconnect_backoff;

/// Default exchange, used for replies addressed by queue name.
const DEFAULT_EXCHANGE: &str = "";

const CONSUMER_TAG: &str = "courier-consumer";

const CONTENT_TYPE: &str = "application/json";

/// Connections held by the pool.
const POOL_SIZE: usize = 10;

/// Buffered deliveries between the consumer task and the worker.
const DELIVERY_BUFFER: usize = 256;

struct Inner {
    pool: Pool,
    exchange: String,
    /// Confirm-mode channel reused across publishes; recreated when closed.
    publisher: Mutex<Option<Channel>>,
}

impl Inner {
    async fn channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            TransportError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to create channel: {}", e)))
    }

    async fn confirm_channel(&self) -> Result<Channel> {
        let mut cached = self.publisher.lock().await;
        if let Some(channel) = cached.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to enable confirms: {}", e)))?;
        *cached = Some(channel.clone());
        Ok(channel)
    }

    /// Publish and wait for the broker's confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<SendOutcome> {
        let channel = self.confirm_channel().await?;
        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..Default::default()
                },
                body,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(format!("Failed to publish: {}", e)))?;

        match confirm.await {
            Ok(Confirmation::Ack(None)) | Ok(Confirmation::NotRequested) => {
                Ok(SendOutcome::Delivered)
            }
            Ok(Confirmation::Ack(Some(returned))) => {
                debug!(
                    routing_key = %routing_key,
                    reply_code = returned.reply_code,
                    "Broker returned unroutable message"
                );
                Ok(SendOutcome::Unroutable)
            }
            Ok(Confirmation::Nack(_)) => Err(TransportError::Publish(
                "Broker rejected the message".to_string(),
            )),
            Err(e) => Err(TransportError::Publish(format!(
                "Publish confirmation failed: {}",
                e
            ))),
        }
    }
}

/// RabbitMQ transport.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct AmqpTransport {
    inner: Arc<Inner>,
}

impl AmqpTransport {
    /// Connect and declare the exchange.
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| TransportError::Connection(format!("Failed to create pool: {}", e)))?;

        let inner = Inner {
            pool,
            exchange: config.exchange.clone(),
            publisher: Mutex::new(None),
        };

        let channel = inner.channel().await?;
        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Connection(format!("Failed to declare exchange: {}", e))
            })?;

        info!(
            exchange = %config.exchange,
            url = %config.url,
            "Connected to AMQP"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Declare, bind and consume one queue.
    async fn setup_consumer(inner: &Inner, binding: &Binding) -> Result<lapin::Consumer> {
        let channel = inner.channel().await?;

        channel
            .basic_qos(binding.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: !binding.exclusive,
                    exclusive: binding.exclusive,
                    auto_delete: binding.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &binding.queue,
                &inner.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = %binding.queue,
            routing_key = %binding.routing_key,
            "Bound queue to exchange"
        );

        channel
            .basic_consume(
                &binding.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    ///
    /// Runs until the subscriber drops its stream.
    async fn consume_with_reconnect(
        inner: Arc<Inner>,
        binding: Binding,
        tx: mpsc::Sender<Delivery>,
        mut connected: Option<lapin::Consumer>,
    ) {
        let backoff_builder = reconnect_backoff();
        let mut backoff_iter = backoff_builder.build();

        while !tx.is_closed() {
            let consumer = match connected.take() {
                Some(consumer) => Ok(consumer),
                None => Self::setup_consumer(&inner, &binding).await,
            };
            match consumer {
                Ok(mut consumer) => {
                    info!(
                        queue = %binding.queue,
                        routing_key = %binding.routing_key,
                        "Consumer connected, processing messages"
                    );
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => {
                                let delivery = Self::wrap_delivery(&inner, &binding, delivery);
                                if tx.send(delivery).await.is_err() {
                                    info!(queue = %binding.queue, "Subscriber gone, stopping consumer");
                                    return;
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    info!(queue = %binding.queue, "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    error!(
                        error = %e,
                        queue = %binding.queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    fn wrap_delivery(inner: &Arc<Inner>, binding: &Binding, delivery: lapin::message::Delivery) -> Delivery {
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string());
        let reply_to = delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|addr| addr.as_str().to_string());

        let control = AmqpControl {
            inner: Arc::clone(inner),
            acker: delivery.acker,
            auto_acked: false,
            correlation_id: correlation_id.clone(),
            reply_to,
        };
        Delivery::new(
            binding.routing_key.clone(),
            delivery.data,
            correlation_id,
            Box::new(control),
        )
    }
}

impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("exchange", &self.inner.exchange)
            .finish()
    }
}

/// Ack/reply handle for an AMQP delivery.
struct AmqpControl {
    inner: Arc<Inner>,
    acker: Acker,
    /// Consumed with `no_ack`; acking again would close the channel.
    auto_acked: bool,
    correlation_id: Option<String>,
    reply_to: Option<String>,
}

#[async_trait]
impl DeliveryControl for AmqpControl {
    fn can_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    async fn reply(&self, body: Vec<u8>) -> Result<()> {
        let reply_to = self
            .reply_to
            .as_deref()
            .ok_or_else(|| TransportError::Reply("delivery has no reply_to".to_string()))?;

        let mut properties = BasicProperties::default().with_content_type(CONTENT_TYPE.into());
        if let Some(id) = &self.correlation_id {
            properties = properties.with_correlation_id(id.as_str().into());
        }

        match self
            .inner
            .publish(DEFAULT_EXCHANGE, reply_to, &body, properties, true)
            .await
        {
            Ok(SendOutcome::Delivered) => Ok(()),
            Ok(SendOutcome::Unroutable) => Err(TransportError::Reply(format!(
                "reply queue {} is gone",
                reply_to
            ))),
            Err(e) => Err(TransportError::Reply(e.to_string())),
        }
    }

    async fn ack(&self) -> Result<()> {
        if self.auto_acked {
            return Ok(());
        }
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Connection(format!("Failed to ack message: {}", e)))
    }
}

#[async_trait]
impl Subscriber for AmqpTransport {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn subscribe(&self, binding: Binding) -> Result<DeliveryStream> {
        // Fail fast on the first attempt; the background loop handles later drops.
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let first = Self::setup_consumer(&self.inner, &binding).await?;

        tokio::spawn(Self::consume_with_reconnect(
            Arc::clone(&self.inner),
            binding,
            tx,
            Some(first),
        ));

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    #[tracing::instrument(name = "transport.send", skip_all, fields(routing_key = %message.routing_key))]
    async fn send(&self, message: OutboundMessage) -> Result<SendOutcome> {
        let mut properties = BasicProperties::default().with_content_type(CONTENT_TYPE.into());
        if let Some(id) = &message.correlation_id {
            properties = properties.with_correlation_id(id.as_str().into());
        }
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }

        let outcome = self
            .inner
            .publish(
                &self.inner.exchange,
                &message.routing_key,
                &message.body,
                properties,
                true,
            )
            .await?;
        debug!(exchange = %self.inner.exchange, ?outcome, "Published message");
        Ok(outcome)
    }

    async fn open_reply_queue(&self) -> Result<ReplyQueue> {
        let channel = self.inner.channel().await?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to declare reply queue: {}", e)))?;
        let address = queue.name().as_str().to_string();

        let mut consumer = channel
            .basic_consume(
                &address,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to consume reply queue: {}", e)))?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let inner = Arc::clone(&self.inner);
        let queue_name = address.clone();
        tokio::spawn(async move {
            // The exclusive queue lives as long as this channel.
            let _channel = channel;
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let correlation_id = delivery
                            .properties
                            .correlation_id()
                            .as_ref()
                            .map(|id| id.as_str().to_string());
                        let control = AmqpControl {
                            inner: Arc::clone(&inner),
                            acker: delivery.acker,
                            auto_acked: true,
                            correlation_id: correlation_id.clone(),
                            reply_to: None,
                        };
                        let delivery = Delivery::new(
                            queue_name.clone(),
                            delivery.data,
                            correlation_id,
                            Box::new(control),
                        );
                        if tx.send(delivery).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, queue = %queue_name, "Reply queue consumer failed");
                        return;
                    }
                }
            }
        });

        info!(address = %address, "Opened reply queue");
        Ok(ReplyQueue {
            address,
            deliveries: ReceiverStream::new(rx).boxed(),
        })
    }
}
