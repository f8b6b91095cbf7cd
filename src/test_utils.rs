//! Shared test fixtures.
//!
//! Provides a scripted responder on the channel transport, a dispatcher
//! that records what it was asked to send, and a few sample message types.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{self, Destination, DispatchError, DispatchScope, OutboundDispatcher};
use crate::envelope::{Envelope, ResponseEnvelope};
use crate::message::{Message, Notification, Request, TypeDescriptor};
use crate::transport::{Binding, ChannelTransport, Subscriber};

// ============================================================================
// Sample messages
// ============================================================================

/// Request answered with the sum of its operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Add {
    pub a: i64,
    pub b: i64,
}

impl Message for Add {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new("math", "Add")
    }
}

impl Request for Add {
    type Response = i64;
}

/// Notification with a free-form label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub label: String,
}

impl Message for Tick {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new("clock", "Tick")
    }
}

impl Notification for Tick {}

// ============================================================================
// Channel responder
// ============================================================================

/// Answer every request on `routing_key` with `respond`.
pub async fn spawn_responder<F>(
    transport: &ChannelTransport,
    routing_key: &str,
    respond: F,
) -> JoinHandle<()>
where
    F: Fn(Envelope) -> ResponseEnvelope + Send + Sync + 'static,
{
    let mut deliveries = transport
        .subscribe(Binding::request(routing_key, 16))
        .await
        .unwrap();

    tokio::spawn(async move {
        while let Some(delivery) = deliveries.next().await {
            let envelope = Envelope::decode(&delivery.body).unwrap();
            let response = respond(envelope).encode().unwrap();
            if delivery.can_reply() {
                delivery.reply(response).await.unwrap();
            }
            delivery.ack().await.unwrap();
        }
    })
}

// ============================================================================
// Recording dispatcher
// ============================================================================

type Responder = Box<dyn Fn(&[u8]) -> dispatch::Result<Vec<u8>> + Send + Sync>;

/// Dispatcher that records calls and answers requests from a closure.
pub struct RecordingDispatcher {
    name: String,
    scope: DispatchScope,
    requests: Mutex<Vec<(Destination, Vec<u8>)>>,
    notifications: Mutex<Vec<(Destination, Vec<u8>)>>,
    calls: AtomicUsize,
    responder: Option<Responder>,
}

impl RecordingDispatcher {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scope: DispatchScope::All,
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            responder: None,
        }
    }

    /// Restrict the dispatcher to the listed type names.
    pub fn only<'a>(mut self, types: impl IntoIterator<Item = &'a str>) -> Self {
        self.scope = DispatchScope::Only(types.into_iter().map(str::to_string).collect());
        self
    }

    /// Answer requests with `respond` instead of an empty body.
    pub fn respond_with<F>(mut self, respond: F) -> Self
    where
        F: Fn(&[u8]) -> dispatch::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(respond));
        self
    }

    /// Requests and notifications received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(Destination, Vec<u8>)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<(Destination, Vec<u8>)> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundDispatcher for RecordingDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_dispatch(&self, destination: &Destination) -> bool {
        self.scope.contains(&destination.type_name)
    }

    async fn dispatch_request(
        &self,
        destination: &Destination,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> dispatch::Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = match &self.responder {
            Some(respond) => respond(&body),
            None => Ok(Vec::new()),
        };
        self.requests
            .lock()
            .unwrap()
            .push((destination.clone(), body));
        reply
    }

    async fn notify(&self, destination: &Destination, body: Vec<u8>) -> dispatch::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.notifications
            .lock()
            .unwrap()
            .push((destination.clone(), body));
        Ok(())
    }
}
