//! Local notification fan-out.
//!
//! Runs every in-process handler of one notification under a
//! [`PublishStrategy`]. The publisher keeps no state between calls; the
//! strategy is chosen once per notification type on the mediator builder.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::handler::{ErrorList, HandlerError, NotificationHandlerFn};

/// Concurrency policy for invoking local notification handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStrategy {
    /// Run handlers one after another; report every failure at the end.
    SequentialContinueOnError,
    /// Run handlers one after another; stop at the first failure.
    #[default]
    SequentialStopOnError,
    /// Poll all handlers concurrently on the calling task; report every failure.
    AsyncContinueOnError,
    /// Spawn a task per handler and return without waiting.
    ParallelFireAndForget,
    /// Spawn a task per handler and wait for all of them.
    ParallelWaitAll,
    /// Spawn a task per handler and return when the first one finishes.
    ParallelWaitAny,
}

/// Failure of a local publish.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("Notification handler failed: {0}")]
    Handler(HandlerError),

    #[error("{} notification handler(s) failed: {}", .0.len(), ErrorList(.0))]
    Aggregate(Vec<HandlerError>),
}

impl PublishError {
    /// Every underlying handler failure.
    pub fn errors(&self) -> &[HandlerError] {
        match self {
            Self::Handler(e) => std::slice::from_ref(e),
            Self::Aggregate(errors) => errors,
        }
    }
}

/// Executes the handlers of one notification under a strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct FanoutPublisher {
    strategy: PublishStrategy,
}

impl FanoutPublisher {
    pub fn new(strategy: PublishStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> PublishStrategy {
        self.strategy
    }

    /// Invoke `handlers` for `notification`.
    pub async fn publish<N>(
        &self,
        handlers: &[NotificationHandlerFn<N>],
        notification: Arc<N>,
    ) -> Result<(), PublishError>
    where
        N: Send + Sync + 'static,
    {
        if handlers.is_empty() {
            debug!("No local handlers for notification");
            return Ok(());
        }

        match self.strategy {
            PublishStrategy::SequentialContinueOnError => {
                let mut failures = Vec::new();
                for handler in handlers {
                    if let Err(e) = invoke(handler, Arc::clone(&notification)).await {
                        failures.push(e);
                    }
                }
                aggregate(failures)
            }
            PublishStrategy::SequentialStopOnError => {
                for handler in handlers {
                    invoke(handler, Arc::clone(&notification))
                        .await
                        .map_err(PublishError::Handler)?;
                }
                Ok(())
            }
            PublishStrategy::AsyncContinueOnError => {
                // Every handler is started before any is polled, so start-up
                // failures are collected alongside runtime ones.
                let started: Vec<_> = handlers
                    .iter()
                    .map(|h| invoke(h, Arc::clone(&notification)))
                    .collect();
                let failures = future::join_all(started)
                    .await
                    .into_iter()
                    .filter_map(Result::err)
                    .collect();
                aggregate(failures)
            }
            PublishStrategy::ParallelFireAndForget => {
                for handler in handlers {
                    let running = invoke(handler, Arc::clone(&notification));
                    tokio::spawn(async move {
                        if let Err(e) = running.await {
                            warn!(error = %e, "Fire-and-forget notification handler failed");
                        }
                    });
                }
                Ok(())
            }
            PublishStrategy::ParallelWaitAll => {
                let tasks: Vec<_> = handlers
                    .iter()
                    .map(|h| tokio::spawn(invoke(h, Arc::clone(&notification))))
                    .collect();
                let failures = future::join_all(tasks)
                    .await
                    .into_iter()
                    .filter_map(|joined| match joined {
                        Ok(result) => result.err(),
                        Err(e) => Some(join_failure(e)),
                    })
                    .collect();
                aggregate(failures)
            }
            PublishStrategy::ParallelWaitAny => {
                let tasks: Vec<_> = handlers
                    .iter()
                    .map(|h| tokio::spawn(invoke(h, Arc::clone(&notification))))
                    .collect();
                // Dropping the remaining join handles detaches those tasks.
                let (first, index, _remaining) = future::select_all(tasks).await;
                debug!(
                    handler_index = index,
                    succeeded = matches!(first, Ok(Ok(()))),
                    "First notification handler finished"
                );
                Ok(())
            }
        }
    }
}

/// Start one handler, turning a panic at start or while running into an error.
fn invoke<N>(
    handler: &NotificationHandlerFn<N>,
    notification: Arc<N>,
) -> BoxFuture<'static, Result<(), HandlerError>>
where
    N: Send + Sync + 'static,
{
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(notification))) {
        Ok(running) => AssertUnwindSafe(running)
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|payload| Err(HandlerError::from_panic(payload))))
            .boxed(),
        Err(payload) => future::ready(Err(HandlerError::from_panic(payload))).boxed(),
    }
}

fn join_failure(e: tokio::task::JoinError) -> HandlerError {
    if e.is_panic() {
        HandlerError::from_panic(e.into_panic())
    } else {
        HandlerError::new("cancelled", e.to_string())
    }
}

fn aggregate(failures: Vec<HandlerError>) -> Result<(), PublishError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(PublishError::Aggregate(failures))
    }
}

#[cfg(test)]
mod tests;
