//! In-memory transport for standalone mode.
//!
//! A shared hub of named queues on tokio unbounded channels. Routing keys
//! bind to queues; consumers of one queue receive its messages round-robin,
//! so a shared queue gives competing consumers and per-node queues give
//! broadcast. Clones share the hub, which is how two routers in one process
//! talk to each other.
//!
//! Routers connected from configuration get a private hub unless they name
//! a shared one (`messaging.channel.hub`), see [`ChannelTransport::named`].
//!
//! A queue exists only while it has live consumers. Sending to a routing key
//! with no live consumer anywhere reports [`SendOutcome::Unroutable`], the
//! same signal a broker gives for a returned mandatory publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Binding, CallOutcome, Delivery, DeliveryControl, DeliveryStream, OutboundMessage, ReplyQueue,
    Result, RpcChannel, SendOutcome, Subscriber, Transport, TransportError,
};

/// Process-wide hubs joined by name.
static NAMED_HUBS: OnceLock<std::sync::Mutex<HashMap<String, ChannelTransport>>> = OnceLock::new();

/// Prefix of reply queue addresses.
const REPLY_QUEUE_PREFIX: &str = "courier.reply";

enum ReplyPath {
    None,
    /// Broker style: publish to a named reply queue.
    Queue(String),
    /// RPC style: answer the waiting caller directly.
    Direct(oneshot::Sender<Vec<u8>>),
}

#[derive(Default)]
struct Queue {
    consumers: Vec<mpsc::UnboundedSender<Delivery>>,
    next: usize,
}

#[derive(Default)]
struct Hub {
    /// Routing key -> bound queue names.
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, Queue>,
}

impl Hub {
    fn add_consumer(&mut self, binding: &Binding, tx: mpsc::UnboundedSender<Delivery>) {
        self.queues
            .entry(binding.queue.clone())
            .or_default()
            .consumers
            .push(tx);
        let bound = self.bindings.entry(binding.routing_key.clone()).or_default();
        if !bound.contains(&binding.queue) {
            bound.push(binding.queue.clone());
        }
    }

    fn has_live_consumer(&mut self, queue_name: &str) -> bool {
        self.queues.get_mut(queue_name).is_some_and(|queue| {
            queue.consumers.retain(|c| !c.is_closed());
            !queue.consumers.is_empty()
        })
    }

    /// Hand `delivery` to the next live consumer of `queue`.
    ///
    /// Dead consumers are pruned on the way. Gives the delivery back when
    /// the queue has none left.
    fn push(&mut self, queue_name: &str, mut delivery: Delivery) -> std::result::Result<(), Delivery> {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Err(delivery);
        };
        while !queue.consumers.is_empty() {
            let idx = queue.next % queue.consumers.len();
            match queue.consumers[idx].send(delivery) {
                Ok(()) => {
                    queue.next = idx + 1;
                    return Ok(());
                }
                Err(mpsc::error::SendError(returned)) => {
                    queue.consumers.swap_remove(idx);
                    delivery = returned;
                }
            }
        }
        self.queues.remove(queue_name);
        for bound in self.bindings.values_mut() {
            bound.retain(|q| q != queue_name);
        }
        Err(delivery)
    }
}

#[derive(Default)]
struct Shared {
    hub: Mutex<Hub>,
    acks: AtomicUsize,
}

impl Shared {
    fn delivery(
        self: &Arc<Self>,
        routing_key: &str,
        body: Vec<u8>,
        correlation_id: Option<String>,
        reply: ReplyPath,
    ) -> Delivery {
        let control = ChannelControl {
            shared: Arc::clone(self),
            correlation_id: correlation_id.clone(),
            reply: std::sync::Mutex::new(Some(reply)),
        };
        Delivery::new(routing_key, body, correlation_id, Box::new(control))
    }

    /// Copy a message to every queue bound to its routing key.
    async fn route(
        self: &Arc<Self>,
        routing_key: &str,
        body: Vec<u8>,
        correlation_id: Option<String>,
        reply_to: Option<String>,
    ) -> SendOutcome {
        let mut hub = self.hub.lock().await;
        let queues = hub.bindings.get(routing_key).cloned().unwrap_or_default();

        let mut delivered = 0usize;
        for queue in &queues {
            let reply = match &reply_to {
                Some(address) => ReplyPath::Queue(address.clone()),
                None => ReplyPath::None,
            };
            let delivery = self.delivery(routing_key, body.clone(), correlation_id.clone(), reply);
            if hub.push(queue, delivery).is_ok() {
                delivered += 1;
            }
        }
        outcome(delivered)
    }

    /// Hand a call to one consumer, which answers through `reply`.
    async fn route_call(
        self: &Arc<Self>,
        routing_key: &str,
        body: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    ) -> SendOutcome {
        let mut hub = self.hub.lock().await;
        let queues = hub.bindings.get(routing_key).cloned().unwrap_or_default();
        let Some(queue) = queues.into_iter().find(|q| hub.has_live_consumer(q)) else {
            return SendOutcome::Unroutable;
        };
        let delivery = self.delivery(routing_key, body, None, ReplyPath::Direct(reply));
        outcome(usize::from(hub.push(&queue, delivery).is_ok()))
    }
}

fn outcome(delivered: usize) -> SendOutcome {
    if delivered == 0 {
        SendOutcome::Unroutable
    } else {
        SendOutcome::Delivered
    }
}

/// Ack/reply handle for a channel delivery.
struct ChannelControl {
    shared: Arc<Shared>,
    correlation_id: Option<String>,
    reply: std::sync::Mutex<Option<ReplyPath>>,
}

#[async_trait]
impl DeliveryControl for ChannelControl {
    fn can_reply(&self) -> bool {
        self.reply
            .lock()
            .map(|path| matches!(path.as_ref(), Some(ReplyPath::Queue(_) | ReplyPath::Direct(_))))
            .unwrap_or(false)
    }

    async fn reply(&self, body: Vec<u8>) -> Result<()> {
        let path = self
            .reply
            .lock()
            .map_err(|_| TransportError::Reply("reply path poisoned".to_string()))?
            .take();
        match path {
            Some(ReplyPath::Direct(tx)) => tx
                .send(body)
                .map_err(|_| TransportError::Reply("caller is gone".to_string())),
            Some(ReplyPath::Queue(address)) => {
                let delivery = self
                    .shared
                    .delivery(&address, body, self.correlation_id.clone(), ReplyPath::None);
                let mut hub = self.shared.hub.lock().await;
                hub.push(&address, delivery)
                    .map_err(|_| TransportError::Reply(format!("reply queue {} is gone", address)))
            }
            Some(ReplyPath::None) | None => {
                Err(TransportError::Reply("delivery has no reply path".to_string()))
            }
        }
    }

    async fn ack(&self) -> Result<()> {
        self.shared.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory broker and RPC channel.
///
/// Cheap to clone; clones share one hub.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    shared: Arc<Shared>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        info!("Channel transport initialized");
        Self::default()
    }

    /// Join the process-wide hub called `name`, creating it on first use.
    ///
    /// Every router naming the same hub reaches the others; a hub from
    /// [`new`](Self::new) is reachable only through its clones.
    pub fn named(name: &str) -> Self {
        let hubs = NAMED_HUBS.get_or_init(Default::default);
        let mut hubs = hubs.lock().unwrap_or_else(PoisonError::into_inner);
        hubs.entry(name.to_string())
            .or_insert_with(|| {
                info!(hub = name, "Named channel hub created");
                Self::default()
            })
            .clone()
    }

    /// Number of deliveries acknowledged so far, across all clones.
    pub fn acked(&self) -> usize {
        self.shared.acks.load(Ordering::SeqCst)
    }

    /// Whether any live queue is bound to `routing_key`.
    pub async fn has_binding(&self, routing_key: &str) -> bool {
        let hub = self.shared.hub.lock().await;
        hub.bindings.get(routing_key).is_some_and(|queues| {
            queues.iter().any(|q| {
                hub.queues
                    .get(q)
                    .is_some_and(|queue| queue.consumers.iter().any(|c| !c.is_closed()))
            })
        })
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("acked", &self.acked())
            .finish()
    }
}

#[async_trait]
impl Subscriber for ChannelTransport {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn subscribe(&self, binding: Binding) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.hub.lock().await.add_consumer(&binding, tx);
        info!(
            routing_key = %binding.routing_key,
            queue = %binding.queue,
            kind = %binding.kind,
            "Channel consumer bound"
        );
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    #[tracing::instrument(name = "transport.send", skip_all, fields(routing_key = %message.routing_key))]
    async fn send(&self, message: OutboundMessage) -> Result<SendOutcome> {
        let outcome = self
            .shared
            .route(
                &message.routing_key,
                message.body,
                message.correlation_id,
                message.reply_to,
            )
            .await;
        debug!(?outcome, "Sent via channel");
        Ok(outcome)
    }

    async fn open_reply_queue(&self) -> Result<ReplyQueue> {
        let address = format!("{}.{}", REPLY_QUEUE_PREFIX, Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .hub
            .lock()
            .await
            .queues
            .entry(address.clone())
            .or_default()
            .consumers
            .push(tx);
        debug!(address = %address, "Opened reply queue");
        Ok(ReplyQueue {
            address,
            deliveries: UnboundedReceiverStream::new(rx).boxed(),
        })
    }
}

#[async_trait]
impl RpcChannel for ChannelTransport {
    #[tracing::instrument(name = "transport.call", skip_all, fields(routing_key = %routing_key))]
    async fn call(&self, routing_key: &str, body: Vec<u8>) -> Result<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        let outcome = self.shared.route_call(routing_key, body, tx).await;
        if outcome == SendOutcome::Unroutable {
            return Ok(CallOutcome::Unroutable);
        }
        rx.await
            .map(CallOutcome::Reply)
            .map_err(|_| TransportError::Reply("responder dropped the request".to_string()))
    }

    async fn cast(&self, routing_key: &str, body: Vec<u8>) -> Result<SendOutcome> {
        Ok(self.shared.route(routing_key, body, None, None).await)
    }
}
