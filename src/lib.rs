//! Courier - distributed router for an in-process mediator
//!
//! Extends a typed request/notification mediator so selected message types
//! travel between processes over a broker (AMQP) or an RPC channel (NATS),
//! while the rest stay in-process.

pub mod builder;
pub mod config;
pub mod consumer;
pub mod correlation;
pub mod dedup;
pub mod dispatch;
pub mod envelope;
pub mod fanout;
pub mod handler;
pub mod mediator;
pub mod message;
pub mod route_table;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use builder::{Router, RouterBuilder};
pub use handler::HandlerError;
pub use mediator::{Mediator, PropagationScope, RouterError, RoutingMediator};
pub use message::{Message, Notification, Request, TypeDescriptor};
