//! courier-node: a router node serving built-in diagnostics
//!
//! Loads configuration, connects the configured transports and serves:
//! - `courier.Ping` requests, answered with this node's id
//! - `courier.Heartbeat` notifications, published every few seconds and
//!   logged by every node that receives them
//!
//! Runs until Ctrl-C.
//!
//! ## Configuration
//! ```yaml
//! routing:
//!   mode: implicit_local
//!   remote_types: [courier.Heartbeat]
//! consumer:
//!   node_id: node-a
//! messaging:
//!   transports: [amqp]
//!   amqp:
//!     url: amqp://localhost:5672
//! ```
//!
//! The first command-line argument, if any, names an extra config file.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use courier::config::Config;
use courier::message::{Message, Notification, Request, TypeDescriptor};
use courier::utils::bootstrap::{connect_with_retry, init_tracing};
use courier::{Router, RouterBuilder};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    from: String,
}

impl Message for Ping {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new("courier", "Ping")
    }
}

impl Request for Ping {
    type Response = Pong;
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    node_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    node_id: String,
    sequence: u64,
}

impl Message for Heartbeat {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new("courier", "Heartbeat")
    }
}

impl Notification for Heartbeat {}

async fn build_router(config: &Config, node_id: &str) -> courier::transport::Result<Router> {
    let ping_node = node_id.to_string();
    RouterBuilder::from_config(config)
        .register_request(move |ping: Ping| {
            let node_id = ping_node.clone();
            async move {
                info!(from = %ping.from, "Ping received");
                Ok(Pong { node_id })
            }
        })
        .register_notification(|beat: Arc<Heartbeat>| async move {
            info!(from = %beat.node_id, sequence = beat.sequence, "Heartbeat received");
            Ok(())
        })
        .build()
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let mut config = Config::load(path.as_deref())?;
    let node_id = config.consumer.resolve_node_id();
    config.consumer.node_id = Some(node_id.clone());

    let router = connect_with_retry("transports", || build_router(&config, &node_id)).await?;
    let consumer = router.start().await?;

    info!(node_id = %node_id, "courier-node started");

    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut sequence = 0u64;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                sequence += 1;
                let beat = Heartbeat { node_id: node_id.clone(), sequence };
                if let Err(e) = router.publish(beat).await {
                    error!(error = %e, "Failed to publish heartbeat");
                }
            }
        }
    }

    info!("Shutting down");
    consumer.shutdown().await;
    Ok(())
}
