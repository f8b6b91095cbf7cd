//! Router builder.
//!
//! Provides a fluent API for registering handlers, choosing transports and
//! building a [`Router`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, ConsumerConfig, DedupConfig, MessagingConfig};
use crate::consumer::{ConsumerHandle, InboundConsumer, InboundRegistry};
use crate::dispatch::{DispatcherSet, OutboundDispatcher};
use crate::fanout::PublishStrategy;
use crate::handler::HandlerError;
use crate::mediator::{Mediator, MediatorBuilder, RouterError, RoutingMediator};
use crate::message::{Notification, Request};
use crate::route_table::RouteTable;
use crate::transport::{self, connect_dispatchers, Connected, Subscriber};

/// Builder for [`Router`].
///
/// Dispatchers added directly take precedence over those connected from
/// a [`MessagingConfig`].
pub struct RouterBuilder {
    mediator: MediatorBuilder,
    routes: RouteTable,
    dispatchers: DispatcherSet,
    subscribers: Vec<Arc<dyn Subscriber>>,
    messaging: Option<MessagingConfig>,
    request_timeout: Option<Duration>,
    consumer: ConsumerConfig,
    dedup: DedupConfig,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    /// Create a builder with default routing and no transports.
    pub fn new() -> Self {
        Self {
            mediator: Mediator::builder(),
            routes: RouteTable::default(),
            dispatchers: DispatcherSet::new(),
            subscribers: Vec::new(),
            messaging: None,
            request_timeout: None,
            consumer: ConsumerConfig::default(),
            dedup: DedupConfig::default(),
        }
    }

    /// Apply every section of a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new()
            .with_routes(RouteTable::from_config(&config.routing))
            .with_messaging(config.messaging.clone())
            .with_consumer(config.consumer.clone())
            .with_dedup(config.dedup.clone());
        builder.request_timeout = config.routing.request_timeout();
        builder
    }

    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Connect these transports at build time.
    pub fn with_messaging(mut self, config: MessagingConfig) -> Self {
        self.messaging = Some(config);
        self
    }

    /// Reply timeout for dispatchers connected from messaging config.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_consumer(mut self, config: ConsumerConfig) -> Self {
        self.consumer = config;
        self
    }

    pub fn with_dedup(mut self, config: DedupConfig) -> Self {
        self.dedup = config;
        self
    }

    /// Add an outbound dispatcher at the lowest precedence so far.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn OutboundDispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    /// Add an inbound subscription source.
    pub fn with_subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Use already connected transports.
    pub fn with_connected(mut self, connected: Connected) -> Self {
        for dispatcher in connected.dispatchers.iter() {
            self.dispatchers.push(Arc::clone(dispatcher));
        }
        self.subscribers.extend(connected.subscribers);
        self
    }

    /// Register the handler for request type `R`.
    pub fn register_request<R, F, Fut>(mut self, handler: F) -> Self
    where
        R: Request,
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, HandlerError>> + Send + 'static,
    {
        self.mediator = self.mediator.on_request(handler);
        self
    }

    /// Add a handler for notification type `N`.
    pub fn register_notification<N, F, Fut>(mut self, handler: F) -> Self
    where
        N: Notification,
        F: Fn(Arc<N>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.mediator = self.mediator.on_notification(handler);
        self
    }

    /// Publish strategy for notification type `N`.
    pub fn with_notification_strategy<N: Notification>(mut self, strategy: PublishStrategy) -> Self {
        self.mediator = self.mediator.notification_strategy::<N>(strategy);
        self
    }

    /// Strategy for notification types without their own.
    pub fn with_default_strategy(mut self, strategy: PublishStrategy) -> Self {
        self.mediator = self.mediator.default_strategy(strategy);
        self
    }

    /// Connect configured transports and assemble the router.
    pub async fn build(mut self) -> transport::Result<Router> {
        if let Some(messaging) = self.messaging.take() {
            let connected = connect_dispatchers(&messaging, self.request_timeout).await?;
            self = self.with_connected(connected);
        }

        let local = self.mediator.build();
        let routes = Arc::new(self.routes);
        let registry = Arc::new(InboundRegistry::build(local.registrations(), &routes));

        info!(
            mode = ?routes.mode(),
            inbound_types = registry.len(),
            dispatchers = ?self.dispatchers,
            "Router built"
        );

        Ok(Router {
            mediator: Arc::new(RoutingMediator::new(local, routes, self.dispatchers)),
            registry,
            subscribers: self.subscribers,
            consumer: self.consumer,
            dedup: self.dedup,
        })
    }
}

/// Assembled router: the routing mediator plus what it needs to consume.
pub struct Router {
    mediator: Arc<RoutingMediator>,
    registry: Arc<InboundRegistry>,
    subscribers: Vec<Arc<dyn Subscriber>>,
    consumer: ConsumerConfig,
    dedup: DedupConfig,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn mediator(&self) -> &Arc<RoutingMediator> {
        &self.mediator
    }

    /// Types this router accepts from peers.
    pub fn registry(&self) -> &InboundRegistry {
        &self.registry
    }

    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response, RouterError> {
        self.mediator.send(request).await
    }

    pub async fn send_with<R: Request>(
        &self,
        request: R,
        cancel: &CancellationToken,
    ) -> Result<R::Response, RouterError> {
        self.mediator.send_with(request, cancel).await
    }

    pub async fn publish<N: Notification>(&self, notification: N) -> Result<(), RouterError> {
        self.mediator.publish(notification).await
    }

    /// Subscribe the inbound types on every transport and start consuming.
    pub async fn start(&self) -> transport::Result<ConsumerHandle> {
        let consumer = InboundConsumer::new(
            Arc::clone(&self.mediator),
            Arc::clone(&self.registry),
            self.consumer.clone(),
            &self.dedup,
        );
        consumer.start(&self.subscribers).await
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("mediator", &self.mediator)
            .field("registry", &self.registry)
            .field(
                "subscribers",
                &self.subscribers.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
