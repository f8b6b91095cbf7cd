//! Matching asynchronous replies to outstanding remote calls.
//!
//! A caller registers an entry, receives a [`PendingReply`] and awaits it.
//! The broker reply pump resolves entries by correlation id. Every entry is
//! removed exactly once: by its reply, by an explicit failure, or by the
//! pending handle being dropped (cancellation, timeout, caller gone).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::dispatch::DispatchError;

type Waiter = oneshot::Sender<Result<Vec<u8>, DispatchError>>;

struct CorrelationEntry {
    waiter: Waiter,
    created_at: Instant,
}

/// Concurrent map from correlation id to pending caller.
#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, CorrelationEntry>>,
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new entry under a fresh UUIDv4 correlation id.
    pub fn register(self: &Arc<Self>) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.lock();
        let mut id = Uuid::new_v4().to_string();
        while entries.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }
        entries.insert(
            id.clone(),
            CorrelationEntry {
                waiter: tx,
                created_at: Instant::now(),
            },
        );
        drop(entries);

        PendingReply {
            id,
            receiver: rx,
            table: Arc::clone(self),
        }
    }

    /// Complete the entry for `id` with reply bytes.
    ///
    /// Returns `false` when no entry exists (late or unknown reply).
    pub fn resolve(&self, id: &str, reply: Vec<u8>) -> bool {
        self.complete(id, Ok(reply))
    }

    /// Complete the entry for `id` with an error.
    pub fn fail(&self, id: &str, error: DispatchError) -> bool {
        self.complete(id, Err(error))
    }

    /// Fail every outstanding entry, e.g. when the reply queue closes.
    pub fn fail_all(&self, error: impl Fn() -> DispatchError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.waiter.send(Err(error()));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn complete(&self, id: &str, outcome: Result<Vec<u8>, DispatchError>) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        debug!(
            correlation_id = %id,
            waited_ms = entry.created_at.elapsed().as_millis() as u64,
            "Resolved correlation entry"
        );
        // Receiver gone: the caller dropped its future after removal.
        let _ = entry.waiter.send(outcome);
        true
    }

    fn remove(&self, id: &str) -> Option<Duration> {
        self.lock()
            .remove(id)
            .map(|entry| entry.created_at.elapsed())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CorrelationEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.len())
            .finish()
    }
}

/// A registered call awaiting its reply.
///
/// Resolves to the raw reply bytes. Dropping it removes the entry.
pub struct PendingReply {
    id: String,
    receiver: oneshot::Receiver<Result<Vec<u8>, DispatchError>>,
    table: Arc<CorrelationTable>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Vec<u8>, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(DispatchError::Cancelled))
        })
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(waited) = self.table.remove(&self.id) {
            debug!(
                correlation_id = %self.id,
                waited_ms = waited.as_millis() as u64,
                "Abandoned correlation entry"
            );
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_completes_pending_reply() {
        let table = CorrelationTable::new();
        let pending = table.register();
        let id = pending.correlation_id().to_string();
        assert!(table.contains(&id));

        assert!(table.resolve(&id, b"reply".to_vec()));
        assert_eq!(pending.await.unwrap(), b"reply".to_vec());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_propagates_error() {
        let table = CorrelationTable::new();
        let pending = table.register();
        let id = pending.correlation_id().to_string();

        assert!(table.fail(&id, DispatchError::Unroutable("ns_Foo".to_string())));
        assert!(matches!(pending.await, Err(DispatchError::Unroutable(_))));
    }

    #[test]
    fn test_drop_removes_entry_and_late_reply_is_ignored() {
        let table = CorrelationTable::new();
        let pending = table.register();
        let id = pending.correlation_id().to_string();

        drop(pending);
        assert!(!table.contains(&id));
        assert!(!table.resolve(&id, b"late".to_vec()));
    }

    #[test]
    fn test_ids_are_unique() {
        let table = CorrelationTable::new();
        let pending: Vec<_> = (0..100).map(|_| table.register()).collect();
        let ids: std::collections::HashSet<_> =
            pending.iter().map(|p| p.correlation_id().to_string()).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(table.len(), 100);
    }

    #[tokio::test]
    async fn test_fail_all_drains_table() {
        let table = CorrelationTable::new();
        let first = table.register();
        let second = table.register();

        assert_eq!(table.fail_all(|| DispatchError::Cancelled), 2);
        assert!(table.is_empty());
        assert!(matches!(first.await, Err(DispatchError::Cancelled)));
        assert!(matches!(second.await, Err(DispatchError::Cancelled)));
    }

    #[test]
    fn test_resolve_unknown_id() {
        let table = CorrelationTable::new();
        assert!(!table.resolve("missing", Vec::new()));
    }
}
