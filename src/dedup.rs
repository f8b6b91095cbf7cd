//! Time-bounded suppression of duplicate notification deliveries.
//!
//! Brokers redeliver, and fan-out topologies can deliver the same
//! notification twice. The consumer hashes each inbound notification and
//! drops copies whose hash was seen within the TTL window. Memory stays
//! bounded: every insertion schedules its own eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// SHA-256 digest identifying one notification delivery.
pub type Digest = [u8; 32];

/// Compute the dedup digest of a delivery.
pub fn compute_digest(routing_key: &str, body: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(routing_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(body);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy)]
struct DedupEntry {
    inserted_at: Instant,
    ttl: Duration,
    generation: u64,
}

impl DedupEntry {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) < self.ttl
    }
}

/// Set of recently seen digests.
///
/// Cheap to clone; clones share the same set.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<Digest, DedupEntry>>>,
    generation: Arc<AtomicU64>,
}

impl Deduplicator {
    /// Create a deduplicator whose [`observe`](Self::observe) uses `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `digest` was remembered less than its TTL ago.
    pub async fn seen(&self, digest: &Digest) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(digest)
            .is_some_and(|entry| entry.is_live(Instant::now()))
    }

    /// Remember `digest` for `ttl`, restarting its window if already present.
    pub async fn remember(&self, digest: Digest, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        self.insert(&mut entries, digest, ttl);
    }

    /// Check and remember `digest` under one lock acquisition.
    ///
    /// Returns `true` on the first sighting within the window; `false` means
    /// the delivery is a duplicate and should be dropped.
    pub async fn observe(&self, digest: Digest) -> bool {
        let mut entries = self.entries.lock().await;
        if entries
            .get(&digest)
            .is_some_and(|entry| entry.is_live(Instant::now()))
        {
            return false;
        }
        self.insert(&mut entries, digest, self.ttl);
        true
    }

    /// Number of digests currently held, including expired ones awaiting eviction.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn insert(&self, entries: &mut HashMap<Digest, DedupEntry>, digest: Digest, ttl: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            digest,
            DedupEntry {
                inserted_at: Instant::now(),
                ttl,
                generation,
            },
        );

        let map = Arc::clone(&self.entries);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut entries = map.lock().await;
            // A later remember() owns the entry now.
            if entries
                .get(&digest)
                .is_some_and(|entry| entry.generation == generation)
            {
                entries.remove(&digest);
                trace!(digest = %hex::encode(digest), "Evicted dedup entry");
            }
        });
    }
}
