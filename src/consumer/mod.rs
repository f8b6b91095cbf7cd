//! Inbound consumer.
//!
//! Subscribes every locally accepted message type on each transport and
//! turns deliveries back into mediator calls:
//!
//! - requests: decode, run the local handler, reply with a
//!   [`ResponseEnvelope`], then acknowledge;
//! - notifications: drop duplicates seen within the dedup window, publish to
//!   local handlers only, acknowledge regardless of the outcome.
//!
//! One worker task per subscription pulls from the transport stream; every
//! delivery is processed on its own task. A worker keeps at most the
//! binding's prefetch count of deliveries in flight, whether or not the
//! transport enforces prefetch itself.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{ConsumerConfig, DedupConfig};
use crate::dedup::{compute_digest, Deduplicator};
use crate::envelope::{Envelope, ResponseEnvelope};
use crate::handler::HandlerError;
use crate::mediator::RoutingMediator;
use crate::transport::{self, Binding, Delivery, DeliveryStream, MessageKind, Subscriber};

mod registry;

pub use registry::{
    InboundRegistry, InboundRoute, Registration, DECODE_ERROR_KIND, ENCODE_ERROR_KIND,
    NO_HANDLER_KIND,
};
use registry::{Invoker, NotificationInvoker, RequestInvoker};

/// State shared by every worker of one consumer.
struct Context {
    mediator: Arc<RoutingMediator>,
    registry: Arc<InboundRegistry>,
    dedup: Option<Deduplicator>,
}

/// Turns transport deliveries into mediator calls.
pub struct InboundConsumer {
    context: Arc<Context>,
    node_id: String,
    config: ConsumerConfig,
}

impl InboundConsumer {
    pub fn new(
        mediator: Arc<RoutingMediator>,
        registry: Arc<InboundRegistry>,
        config: ConsumerConfig,
        dedup: &DedupConfig,
    ) -> Self {
        let dedup = dedup.enabled.then(|| Deduplicator::new(dedup.ttl()));
        Self {
            context: Arc::new(Context {
                mediator,
                registry,
                dedup,
            }),
            node_id: config.resolve_node_id(),
            config,
        }
    }

    /// Node id naming this consumer's dedicated queues.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// One binding per registered type.
    pub fn bindings(&self) -> Vec<Binding> {
        self.context
            .registry
            .iter()
            .map(|route| match route.kind {
                MessageKind::Request => Binding::request(&route.routing_key, self.config.prefetch),
                MessageKind::Notification => Binding::notification(
                    &route.routing_key,
                    self.config.notification_distribution,
                    &self.node_id,
                    self.config.prefetch,
                ),
            })
            .collect()
    }

    /// Subscribe every binding on every subscriber and start the workers.
    ///
    /// A failed subscription stops the workers already started.
    pub async fn start(&self, subscribers: &[Arc<dyn Subscriber>]) -> transport::Result<ConsumerHandle> {
        let shutdown = CancellationToken::new();
        let mut workers = Vec::new();

        for subscriber in subscribers {
            for binding in self.bindings() {
                let stream = match subscriber.subscribe(binding.clone()).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(
                            transport = subscriber.name(),
                            routing_key = %binding.routing_key,
                            error = %e,
                            "Failed to subscribe"
                        );
                        shutdown.cancel();
                        return Err(e);
                    }
                };

                let span = tracing::info_span!(
                    "consumer",
                    transport = subscriber.name(),
                    routing_key = %binding.routing_key,
                    queue = %binding.queue
                );
                let in_flight = Arc::new(Semaphore::new(usize::from(binding.prefetch.max(1))));
                workers.push(tokio::spawn(
                    run_worker(stream, Arc::clone(&self.context), in_flight, shutdown.clone())
                        .instrument(span),
                ));
            }
        }

        info!(
            node_id = %self.node_id,
            subscriptions = workers.len(),
            "Inbound consumer started"
        );

        Ok(ConsumerHandle { shutdown, workers })
    }
}

/// Running consumer workers.
pub struct ConsumerHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Subscriptions being served.
    pub fn subscriptions(&self) -> usize {
        self.workers.len()
    }

    /// Stop pulling new deliveries and wait for the workers to exit.
    ///
    /// Deliveries already handed to their own task run to completion.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Consumer worker ended abnormally");
            }
        }
        info!("Inbound consumer stopped");
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("subscriptions", &self.workers.len())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn run_worker(
    mut stream: DeliveryStream,
    context: Arc<Context>,
    in_flight: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&in_flight).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(delivery) => delivery,
                None => {
                    warn!("Delivery stream ended");
                    break;
                }
            },
        };

        let context = Arc::clone(&context);
        tokio::spawn(
            async move {
                process(context, delivery).await;
                drop(permit);
            }
            .in_current_span(),
        );
    }
}

async fn process(context: Arc<Context>, delivery: Delivery) {
    let Some(route) = context.registry.get(&delivery.routing_key) else {
        warn!(routing_key = %delivery.routing_key, "No inbound route for delivery");
        acknowledge(&delivery).await;
        return;
    };

    match route.invoker() {
        Invoker::Request(invoke) => handle_request(&context, &delivery, invoke).await,
        Invoker::Notification(invoke) => handle_notification(&context, &delivery, invoke).await,
    }
}

#[tracing::instrument(
    name = "consumer.request",
    skip_all,
    fields(correlation_id = delivery.correlation_id.as_deref().unwrap_or(""))
)]
async fn handle_request(context: &Context, delivery: &Delivery, invoke: RequestInvoker) {
    let outcome = match Envelope::decode(&delivery.body) {
        Ok(envelope) => invoke(Arc::clone(&context.mediator), envelope.body).await,
        Err(e) => Err(HandlerError::new(registry::DECODE_ERROR_KIND, e.to_string())),
    };

    let response = match outcome {
        Ok(content) => {
            debug!("Request handled");
            ResponseEnvelope::ok(content)
        }
        Err(e) => {
            warn!(kind = %e.kind, error = %e.message, "Request failed");
            ResponseEnvelope::exception(e)
        }
    };

    if delivery.can_reply() {
        match response.encode() {
            Ok(bytes) => {
                if let Err(e) = delivery.reply(bytes).await {
                    error!(error = %e, "Failed to send reply");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode reply"),
        }
    } else {
        warn!("Request carries no reply address; response dropped");
    }

    acknowledge(delivery).await;
}

#[tracing::instrument(name = "consumer.notification", skip_all)]
async fn handle_notification(context: &Context, delivery: &Delivery, invoke: NotificationInvoker) {
    if let Some(dedup) = &context.dedup {
        let digest = compute_digest(&delivery.routing_key, &delivery.body);
        if !dedup.observe(digest).await {
            debug!("Duplicate notification dropped");
            acknowledge(delivery).await;
            return;
        }
    }

    match Envelope::decode(&delivery.body) {
        Ok(envelope) => {
            if let Err(e) = invoke(Arc::clone(&context.mediator), envelope.body).await {
                error!(error = %e, "Notification handling failed");
            }
        }
        Err(e) => error!(error = %e, "Failed to decode notification"),
    }

    acknowledge(delivery).await;
}

async fn acknowledge(delivery: &Delivery) {
    if let Err(e) = delivery.ack().await {
        error!(error = %e, "Failed to acknowledge delivery");
    }
}
