//! Pair-keyed mutual exclusion for the private-room rendezvous
//!
//! Finding-or-creating the unique private room between two users must be
//! serialized per user pair, or two concurrent "start chat" calls race the
//! check-then-insert and produce duplicate rooms. This module derives an
//! ordering-independent key from the pair and hands out one async mutex
//! per key, so only requests for the same pair contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::UserId;

/// Canonical ordering-independent key for a user pair.
///
/// Both invocation orders map to the same key: the ids are sorted before
/// being joined.
pub fn canonical_pair(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}|{}", lo, hi)
}

/// Registry of per-pair locks.
///
/// Lock entries live for the lifetime of the registry; the population is
/// bounded by the distinct user pairs that attempted a rendezvous.
#[derive(Debug, Default)]
pub struct PairLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for the unordered pair (a, b).
    ///
    /// The guard is released on drop, which the caller scopes to exactly
    /// the find-or-create critical section.
    pub async fn acquire(&self, a: UserId, b: UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("pair lock registry poisoned");
            locks
                .entry(canonical_pair(a, b))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}
