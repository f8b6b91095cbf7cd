//! In-process mediator.
//!
//! Holds the typed handlers registered at startup: one handler per request
//! type, any number per notification type. The registry is keyed by
//! `TypeId` and never changes after [`MediatorBuilder::build`].
//!
//! [`RoutingMediator`] wraps it to send types classified as remote over the
//! configured transports.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::debug;

use crate::consumer::Registration;
use crate::fanout::{FanoutPublisher, PublishError, PublishStrategy};
use crate::handler::{self, HandlerError, NotificationHandlerFn, RequestHandlerFn};
use crate::message::{Notification, Request};

mod routing;

pub use routing::{PropagationScope, RouterError, RoutingMediator};

/// Result type for local mediator operations.
pub type Result<T> = std::result::Result<T, MediatorError>;

/// Errors from in-process dispatch.
#[derive(Debug, thiserror::Error)]
pub enum MediatorError {
    #[error("No handler registered for {0}")]
    NoHandler(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

type Erased = Box<dyn Any + Send + Sync>;

/// Registry of typed handlers.
pub struct Mediator {
    requests: HashMap<TypeId, Erased>,
    notifications: HashMap<TypeId, Erased>,
    strategies: HashMap<TypeId, PublishStrategy>,
    default_strategy: PublishStrategy,
    registrations: Vec<Registration>,
}

impl Mediator {
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::default()
    }

    /// Invoke the handler registered for `R`.
    ///
    /// A panicking handler is reported as a [`HandlerError`] of kind `panic`.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response> {
        let handler = self
            .requests
            .get(&TypeId::of::<R>())
            .and_then(|h| h.downcast_ref::<RequestHandlerFn<R, R::Response>>())
            .ok_or_else(|| MediatorError::NoHandler(R::descriptor().qualified_name()))?;

        let running = std::panic::catch_unwind(AssertUnwindSafe(|| handler(request)))
            .map_err(HandlerError::from_panic)?;
        AssertUnwindSafe(running)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)))
            .map_err(MediatorError::Handler)
    }

    /// Run every local handler of `N` under its publish strategy.
    pub async fn publish<N: Notification>(&self, notification: N) -> Result<()> {
        self.publish_shared(Arc::new(notification)).await
    }

    pub(crate) async fn publish_shared<N: Notification>(&self, notification: Arc<N>) -> Result<()> {
        let handlers = self
            .notifications
            .get(&TypeId::of::<N>())
            .and_then(|h| h.downcast_ref::<Vec<NotificationHandlerFn<N>>>())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let strategy = self.strategy_for::<N>();

        debug!(
            notification = %N::descriptor(),
            handlers = handlers.len(),
            strategy = ?strategy,
            "Publishing locally"
        );

        FanoutPublisher::new(strategy)
            .publish(handlers, notification)
            .await?;
        Ok(())
    }

    /// Strategy used for notification type `N`.
    pub fn strategy_for<N: Notification>(&self) -> PublishStrategy {
        self.strategies
            .get(&TypeId::of::<N>())
            .copied()
            .unwrap_or(self.default_strategy)
    }

    pub fn handles_request<R: Request>(&self) -> bool {
        self.requests.contains_key(&TypeId::of::<R>())
    }

    pub fn handles_notification<N: Notification>(&self) -> bool {
        self.notifications.contains_key(&TypeId::of::<N>())
    }

    /// Every registered message type, in registration order.
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field(
                "types",
                &self
                    .registrations
                    .iter()
                    .map(|r| r.type_name())
                    .collect::<Vec<_>>(),
            )
            .field("default_strategy", &self.default_strategy)
            .finish()
    }
}

/// Builder for [`Mediator`].
#[derive(Default)]
pub struct MediatorBuilder {
    requests: HashMap<TypeId, Erased>,
    notifications: HashMap<TypeId, Erased>,
    strategies: HashMap<TypeId, PublishStrategy>,
    default_strategy: PublishStrategy,
    registrations: Vec<Registration>,
}

impl MediatorBuilder {
    /// Register the handler for request type `R`, replacing any earlier one.
    pub fn request_handler<R: Request>(mut self, handler: RequestHandlerFn<R, R::Response>) -> Self {
        self.requests.insert(TypeId::of::<R>(), Box::new(handler));
        self.register(Registration::request::<R>());
        self
    }

    /// Register an async closure as the handler for `R`.
    pub fn on_request<R, F, Fut>(self, f: F) -> Self
    where
        R: Request,
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R::Response, HandlerError>> + Send + 'static,
    {
        self.request_handler::<R>(handler::request_handler(f))
    }

    /// Add a handler for notification type `N`.
    pub fn notification_handler<N: Notification>(mut self, handler: NotificationHandlerFn<N>) -> Self {
        let slot = self
            .notifications
            .entry(TypeId::of::<N>())
            .or_insert_with(|| Box::new(Vec::<NotificationHandlerFn<N>>::new()));
        if let Some(handlers) = slot.downcast_mut::<Vec<NotificationHandlerFn<N>>>() {
            handlers.push(handler);
        }
        self.register(Registration::notification::<N>());
        self
    }

    /// Add an async closure as a handler for `N`.
    pub fn on_notification<N, F, Fut>(self, f: F) -> Self
    where
        N: Notification,
        F: Fn(Arc<N>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.notification_handler::<N>(handler::notification_handler(f))
    }

    /// Publish strategy for notification type `N`.
    pub fn notification_strategy<N: Notification>(mut self, strategy: PublishStrategy) -> Self {
        self.strategies.insert(TypeId::of::<N>(), strategy);
        self
    }

    /// Strategy for notification types without their own.
    pub fn default_strategy(mut self, strategy: PublishStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn build(self) -> Mediator {
        Mediator {
            requests: self.requests,
            notifications: self.notifications,
            strategies: self.strategies,
            default_strategy: self.default_strategy,
            registrations: self.registrations,
        }
    }

    fn register(&mut self, registration: Registration) {
        if !self
            .registrations
            .iter()
            .any(|r| r.type_id() == registration.type_id())
        {
            self.registrations.push(registration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Add, Tick};
    use crate::transport::MessageKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn adder() -> MediatorBuilder {
        Mediator::builder().on_request(|req: Add| async move { Ok(req.a + req.b) })
    }

    #[tokio::test]
    async fn test_send_invokes_registered_handler() {
        let mediator = adder().build();
        assert_eq!(mediator.send(Add { a: 2, b: 3 }).await.unwrap(), 5);
        assert!(mediator.handles_request::<Add>());
    }

    #[tokio::test]
    async fn test_send_without_handler() {
        let mediator = Mediator::builder().build();
        let result = mediator.send(Add { a: 1, b: 1 }).await;
        assert!(matches!(result, Err(MediatorError::NoHandler(t)) if t == "math.Add"));
    }

    #[tokio::test]
    async fn test_later_request_handler_replaces_earlier() {
        let mediator = adder()
            .on_request(|req: Add| async move { Ok(req.a * req.b) })
            .build();
        assert_eq!(mediator.send(Add { a: 2, b: 3 }).await.unwrap(), 6);
        assert_eq!(mediator.registrations().len(), 1);
    }

    #[tokio::test]
    async fn test_send_handler_error_is_returned() {
        let mediator = Mediator::builder()
            .on_request(|_: Add| async move {
                Err::<i64, _>(HandlerError::new("math::Overflow", "too big"))
            })
            .build();

        match mediator.send(Add { a: 1, b: 1 }).await {
            Err(MediatorError::Handler(e)) => assert_eq!(e.kind, "math::Overflow"),
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_panicking_handler_becomes_error() {
        let mediator = Mediator::builder()
            .on_request(|_: Add| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(0)
            })
            .build();

        match mediator.send(Add { a: 1, b: 1 }).await {
            Err(MediatorError::Handler(e)) => {
                assert_eq!(e.kind, crate::handler::PANIC_KIND);
                assert_eq!(e.message, "handler blew up");
            }
            other => panic!("expected panic error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_runs_every_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut builder = Mediator::builder();
        for _ in 0..3 {
            let count = Arc::clone(&count);
            builder = builder.on_notification(move |_: Arc<Tick>| {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        let mediator = builder.build();

        mediator
            .publish(Tick {
                label: "t".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(mediator.registrations().len(), 1);
        assert_eq!(mediator.registrations()[0].kind(), MessageKind::Notification);
    }

    #[tokio::test]
    async fn test_publish_without_handlers_is_ok() {
        let mediator = Mediator::builder().build();
        assert!(!mediator.handles_notification::<Tick>());
        mediator
            .publish(Tick {
                label: "t".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_notification_strategy_per_type() {
        let mediator = Mediator::builder()
            .default_strategy(PublishStrategy::ParallelWaitAll)
            .notification_strategy::<Tick>(PublishStrategy::SequentialContinueOnError)
            .on_notification(|_: Arc<Tick>| async move { Err(HandlerError::new("a", "first")) })
            .on_notification(|_: Arc<Tick>| async move { Err(HandlerError::new("b", "second")) })
            .build();

        assert_eq!(
            mediator.strategy_for::<Tick>(),
            PublishStrategy::SequentialContinueOnError
        );

        let result = mediator
            .publish(Tick {
                label: "t".to_string(),
            })
            .await;
        match result {
            Err(MediatorError::Publish(e)) => assert_eq!(e.errors().len(), 2),
            other => panic!("expected aggregate, got {:?}", other),
        }
    }

    #[test]
    fn test_registrations_carry_type_identity() {
        let mediator = adder()
            .on_notification(|_: Arc<Tick>| async move { Ok(()) })
            .build();
        let names: Vec<_> = mediator
            .registrations()
            .iter()
            .map(|r| r.type_name())
            .collect();
        assert_eq!(names, vec!["math.Add", "clock.Tick"]);
    }
}
