//! Handler callables and the error they report.
//!
//! Handlers are plain typed function values. A failure is a [`HandlerError`],
//! which is also what crosses the wire inside an `Exception` response, so a
//! remote failure reaches the caller in exactly the shape a local one would.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Error kind used when a handler panics.
pub const PANIC_KIND: &str = "panic";

/// Failure reported by a request or notification handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    /// Error type name (e.g. `orders::OutOfStock`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an arbitrary error, using its type name as the kind.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }

    /// Build the error reported for a panicking handler.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new(PANIC_KIND, message)
    }
}

/// Type-erased request handler for request type `R` answering `T`.
pub type RequestHandlerFn<R, T> =
    Arc<dyn Fn(R) -> BoxFuture<'static, Result<T, HandlerError>> + Send + Sync>;

/// Type-erased notification handler for notification type `N`.
pub type NotificationHandlerFn<N> =
    Arc<dyn Fn(Arc<N>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Box an async closure into a [`RequestHandlerFn`].
pub fn request_handler<R, T, F, Fut>(f: F) -> RequestHandlerFn<R, T>
where
    F: Fn(R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Box an async closure into a [`NotificationHandlerFn`].
pub fn notification_handler<N, F, Fut>(f: F) -> NotificationHandlerFn<N>
where
    F: Fn(Arc<N>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |notification| Box::pin(f(notification)))
}

/// Display helper for logging a list of handler errors.
pub(crate) struct ErrorList<'a>(pub &'a [HandlerError]);

impl fmt::Display for ErrorList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}
