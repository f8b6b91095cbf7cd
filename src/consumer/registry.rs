//! Inbound registry: routing key to typed invocation path.
//!
//! Each handler registered on the mediator contributes a [`Registration`]
//! carrying monomorphized entry points for its message type. The consumer
//! looks deliveries up by routing key and calls the entry point, which
//! deserializes the body into the concrete type and invokes the mediator.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::envelope::CodecError;
use crate::handler::HandlerError;
use crate::mediator::{MediatorError, PropagationScope, RouterError, RoutingMediator};
use crate::message::{Notification, Request, TypeDescriptor};
use crate::route_table::{Route, RouteTable};
use crate::transport::MessageKind;

/// Error kind replied when a request body cannot be decoded.
pub const DECODE_ERROR_KIND: &str = "courier::DecodeError";
/// Error kind replied when a response cannot be encoded.
pub const ENCODE_ERROR_KIND: &str = "courier::EncodeError";
/// Error kind replied when no local handler exists for a request.
pub const NO_HANDLER_KIND: &str = "courier::NoHandler";

/// Decode a request body, run the local handler, encode its response.
pub(crate) type RequestInvoker =
    fn(Arc<RoutingMediator>, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>>;

/// Decode a notification body and publish it to local handlers only.
pub(crate) type NotificationInvoker =
    fn(Arc<RoutingMediator>, Vec<u8>) -> BoxFuture<'static, Result<(), RouterError>>;

#[derive(Clone, Copy)]
pub(crate) enum Invoker {
    Request(RequestInvoker),
    Notification(NotificationInvoker),
}

/// A message type registered on the mediator.
#[derive(Clone)]
pub struct Registration {
    type_id: TypeId,
    descriptor: TypeDescriptor,
    invoker: Invoker,
}

impl Registration {
    pub(crate) fn request<R: Request>() -> Self {
        Self {
            type_id: TypeId::of::<R>(),
            descriptor: R::descriptor(),
            invoker: Invoker::Request(invoke_request::<R>),
        }
    }

    pub(crate) fn notification<N: Notification>() -> Self {
        Self {
            type_id: TypeId::of::<N>(),
            descriptor: N::descriptor(),
            invoker: Invoker::Notification(invoke_notification::<N>),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Qualified type name.
    pub fn type_name(&self) -> String {
        self.descriptor.qualified_name()
    }

    pub fn kind(&self) -> MessageKind {
        match self.invoker {
            Invoker::Request(_) => MessageKind::Request,
            Invoker::Notification(_) => MessageKind::Notification,
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("type_name", &self.type_name())
            .field("kind", &self.kind())
            .finish()
    }
}

fn invoke_request<R: Request>(
    mediator: Arc<RoutingMediator>,
    body: Vec<u8>,
) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
    Box::pin(async move {
        let request: R = serde_json::from_slice(&body)
            .map_err(|e| HandlerError::new(DECODE_ERROR_KIND, e.to_string()))?;

        let response = mediator.local().send(request).await.map_err(|e| match e {
            MediatorError::Handler(e) => e,
            MediatorError::NoHandler(type_name) => HandlerError::new(
                NO_HANDLER_KIND,
                format!("No handler registered for {}", type_name),
            ),
            MediatorError::Publish(e) => HandlerError::from_error(&e),
        })?;

        serde_json::to_vec(&response).map_err(|e| HandlerError::new(ENCODE_ERROR_KIND, e.to_string()))
    })
}

fn invoke_notification<N: Notification>(
    mediator: Arc<RoutingMediator>,
    body: Vec<u8>,
) -> BoxFuture<'static, Result<(), RouterError>> {
    Box::pin(async move {
        let notification: N = serde_json::from_slice(&body).map_err(CodecError::Decode)?;
        mediator
            .publish_in(notification, PropagationScope::RemoteOrigin)
            .await
    })
}

/// One subscribed message type.
#[derive(Debug, Clone)]
pub struct InboundRoute {
    pub type_name: String,
    pub routing_key: String,
    pub kind: MessageKind,
    invoker: InvokerSlot,
}

impl InboundRoute {
    pub(crate) fn invoker(&self) -> Invoker {
        self.invoker.0
    }
}

#[derive(Clone, Copy)]
struct InvokerSlot(Invoker);

impl std::fmt::Debug for InvokerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<invoker>")
    }
}

/// Routing key -> inbound route, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct InboundRegistry {
    routes: HashMap<String, InboundRoute>,
}

impl InboundRegistry {
    /// Register every type this node accepts from peers.
    ///
    /// Requests are subscribed only when they classify as local; a node never
    /// serves a request it sends away. Notifications with a handler are
    /// subscribed whenever they have a route, so every node sharing one
    /// configuration receives a remote notification, the publishing node
    /// included. Inbound copies are published in remote-origin scope and are
    /// never sent out again.
    pub fn build(registrations: &[Registration], table: &RouteTable) -> Self {
        let routes = registrations
            .iter()
            .filter(|r| match (r.kind(), table.classify(&r.type_name())) {
                (_, Route::NotFound) => false,
                (MessageKind::Request, route) => route == Route::Local,
                (MessageKind::Notification, _) => true,
            })
            .map(|r| {
                let route = InboundRoute {
                    type_name: r.type_name(),
                    routing_key: table.routing_key(r.descriptor()),
                    kind: r.kind(),
                    invoker: InvokerSlot(r.invoker),
                };
                (route.routing_key.clone(), route)
            })
            .collect();
        Self { routes }
    }

    pub fn get(&self, routing_key: &str) -> Option<&InboundRoute> {
        self.routes.get(routing_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InboundRoute> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
