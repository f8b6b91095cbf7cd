//! Shared fixtures for router integration tests.
//!
//! Message types used across nodes and a helper that assembles a node on a
//! shared in-memory transport.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier::dispatch::{BrokerDispatcher, DispatchScope};
use courier::message::{Message, Notification, Request, TypeDescriptor};
use courier::route_table::RouteTable;
use courier::transport::ChannelTransport;
use courier::RouterBuilder;

/// Price lookup answered by the pricing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub sku: String,
}

impl Message for Quote {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new("shop.pricing", "Quote")
    }
}

impl Request for Quote {
    type Response = Price;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub sku: String,
    pub cents: u64,
}

/// Request no node handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub order: u64,
}

impl Message for Refund {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new("shop.billing", "Refund")
    }
}

impl Request for Refund {
    type Response = ();
}

/// Broadcast when a price changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChanged {
    pub sku: String,
    pub cents: u64,
}

impl Message for PriceChanged {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new("shop.pricing", "PriceChanged")
    }
}

impl Notification for PriceChanged {}

/// Builder for a node on `transport`, dispatching through a broker dispatcher.
///
/// Returns the dispatcher too so tests can inspect outstanding calls.
pub async fn node(
    transport: &ChannelTransport,
    routes: RouteTable,
) -> (RouterBuilder, Arc<BrokerDispatcher>) {
    let dispatcher = Arc::new(
        BrokerDispatcher::connect(Arc::new(transport.clone()), DispatchScope::All, None)
            .await
            .expect("reply queue"),
    );
    let builder = RouterBuilder::new()
        .with_routes(routes)
        .with_dispatcher(dispatcher.clone())
        .with_subscriber(Arc::new(transport.clone()));
    (builder, dispatcher)
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
