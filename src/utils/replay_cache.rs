//! Replay Cache for received nonce counters
//!
//! Tracks every AEAD nonce counter accepted on the receive direction of one
//! session. The counter space is 16 bits, so the cache is a fixed bitset
//! covering all of it: lookups and inserts are O(1) and memory never grows.
//!
//! Counters may legitimately arrive out of order (separate characteristics
//! deliver independently), so a sliding "highest seen" window would reject
//! valid traffic. The bitset accepts any order and rejects only exact repeats.

use tracing::{debug, warn};

const COUNTER_SPACE: usize = u16::MAX as usize + 1;
const WORDS: usize = COUNTER_SPACE / 64;

/// Bitset of accepted counters for one session direction
pub struct ReplayCache {
    seen: Box<[u64; WORDS]>,
    accepted: usize,
}

impl std::fmt::Debug for ReplayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCache")
            .field("accepted", &self.accepted)
            .finish()
    }
}

impl ReplayCache {
    pub fn new() -> Self {
        Self {
            seen: Box::new([0u64; WORDS]),
            accepted: 0,
        }
    }

    /// Whether `counter` was already accepted. Read-only.
    pub fn contains(&self, counter: u16) -> bool {
        let (word, bit) = Self::slot(counter);
        self.seen[word] & bit != 0
    }

    /// Check and record `counter`.
    ///
    /// Returns true if the counter is a replay (already seen), false if new.
    /// Only call after the message authenticated; a forged message must not
    /// burn a counter.
    pub fn is_replay(&mut self, counter: u16) -> bool {
        if self.contains(counter) {
            warn!(counter, "replayed nonce counter");
            return true;
        }
        self.record(counter);
        false
    }

    /// Record `counter` as spent; recording it twice is a no-op
    pub fn record(&mut self, counter: u16) {
        let (word, bit) = Self::slot(counter);
        if self.seen[word] & bit == 0 {
            self.seen[word] |= bit;
            self.accepted += 1;
        }
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            accepted: self.accepted,
            capacity: COUNTER_SPACE,
        }
    }

    /// Forget every counter (new session keys)
    pub fn clear(&mut self) {
        self.seen.fill(0);
        self.accepted = 0;
        debug!("Replay cache cleared");
    }

    #[inline]
    fn slot(counter: u16) -> (usize, u64) {
        let counter = counter as usize;
        (counter / 64, 1u64 << (counter % 64))
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the replay cache
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Counters accepted so far
    pub accepted: usize,
    /// Size of the counter space
    pub capacity: usize,
}
