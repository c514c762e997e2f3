//! In-memory checkpoint store
//!
//! Maps a thread identifier to the latest conversation state for that
//! thread. Each thread's checkpoint sits behind its own async mutex so a graph
//! run can read, extend and write it back without another run on the same
//! thread interleaving. Idle threads are evicted after a TTL, and the least
//! recently used ones go first once the store is over capacity.

use crate::conversation::Conversation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Stable identifier for one conversation thread
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ThreadId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ThreadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Latest persisted state of one thread
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub conversation: Conversation,
    /// Number of completed graph runs written to this thread
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Replace the stored conversation with the result of a graph run
    pub fn commit(&mut self, conversation: Conversation) {
        self.conversation = conversation;
        self.version += 1;
        self.updated_at = Some(Utc::now());
    }
}

/// Exclusive access to one thread's checkpoint
pub type CheckpointGuard = OwnedMutexGuard<Checkpoint>;

/// When idle threads are dropped from memory
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    pub idle_ttl: Duration,
    pub max_threads: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(3600),
            max_threads: 1000,
        }
    }
}

struct Slot {
    checkpoint: Arc<AsyncMutex<Checkpoint>>,
    last_access: Instant,
}

impl Slot {
    /// A slot is busy while some run holds its guard
    fn is_busy(&self) -> bool {
        Arc::strong_count(&self.checkpoint) > 1
    }
}

/// Thread-safe registry of per-thread checkpoints
pub struct CheckpointStore {
    slots: Mutex<HashMap<ThreadId, Slot>>,
    policy: EvictionPolicy,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new(EvictionPolicy::default())
    }
}

impl CheckpointStore {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock a thread's checkpoint, creating an empty one on first use.
    ///
    /// Waits while another run holds the same thread.
    pub async fn checkout(&self, thread_id: &ThreadId) -> CheckpointGuard {
        let checkpoint = {
            let mut slots = self.slots();
            let slot = slots.entry(thread_id.clone()).or_insert_with(|| {
                tracing::debug!(thread_id = %thread_id, "Creating checkpoint thread");
                Slot {
                    checkpoint: Arc::new(AsyncMutex::new(Checkpoint::default())),
                    last_access: Instant::now(),
                }
            });
            slot.last_access = Instant::now();
            Arc::clone(&slot.checkpoint)
        };
        checkpoint.lock_owned().await
    }

    /// Lock a thread's checkpoint only if the thread is still registered.
    ///
    /// The lookup and the claim on the slot happen under one registry lock,
    /// and a claimed slot is never evicted.
    pub async fn checkout_existing(&self, thread_id: &ThreadId) -> Option<CheckpointGuard> {
        let checkpoint = {
            let mut slots = self.slots();
            let slot = slots.get_mut(thread_id)?;
            slot.last_access = Instant::now();
            Arc::clone(&slot.checkpoint)
        };
        Some(checkpoint.lock_owned().await)
    }

    /// Copy of a thread's checkpoint, or `None` if the thread is unknown
    pub async fn snapshot(&self, thread_id: &ThreadId) -> Option<Checkpoint> {
        let checkpoint = {
            let mut slots = self.slots();
            let slot = slots.get_mut(thread_id)?;
            slot.last_access = Instant::now();
            Arc::clone(&slot.checkpoint)
        };
        let guard = checkpoint.lock().await;
        Some(guard.clone())
    }

    pub fn contains(&self, thread_id: &ThreadId) -> bool {
        self.slots().contains_key(thread_id)
    }

    /// Forget a thread. Runs already holding its guard finish against the
    /// detached checkpoint.
    pub fn remove(&self, thread_id: &ThreadId) -> bool {
        self.slots().remove(thread_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Apply the eviction policy now; returns how many threads were dropped
    pub fn evict(&self) -> usize {
        self.evict_at(Instant::now())
    }

    fn evict_at(&self, now: Instant) -> usize {
        let mut slots = self.slots();
        let before = slots.len();

        let ttl = self.policy.idle_ttl;
        slots.retain(|_, slot| slot.is_busy() || now.duration_since(slot.last_access) <= ttl);

        if slots.len() > self.policy.max_threads {
            let mut idle: Vec<(ThreadId, Instant)> = slots
                .iter()
                .filter(|(_, slot)| !slot.is_busy())
                .map(|(id, slot)| (id.clone(), slot.last_access))
                .collect();
            idle.sort_by_key(|(_, last_access)| *last_access);

            let excess = slots.len() - self.policy.max_threads;
            for (id, _) in idle.into_iter().take(excess) {
                slots.remove(&id);
            }
        }

        let evicted = before - slots.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = slots.len(), "Evicted idle threads");
        }
        evicted
    }
}
