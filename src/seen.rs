//! Duplicate suppression for envelope ids.
//!
//! Entries are kept in insertion order, which is also chronological order, so
//! expiry only ever has to look at the oldest end.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

/// Default maximum number of remembered ids.
pub const DEFAULT_MAX_SEEN: usize = 5_000;

/// Default lifetime of a remembered id.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub struct SeenCache {
    entries: LruCache<String, Instant>,
    max_entries: usize,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("capacity must be non-zero");
        Self {
            entries: LruCache::new(cap),
            max_entries,
            ttl,
        }
    }

    /// Record `id` as seen at `now`. Returns `true` if it was already known.
    ///
    /// Empty ids are never stored and never reported as duplicates. Lookups
    /// do not refresh an entry's position; age counts from first sight.
    pub fn remember(&mut self, id: &str, now: Instant) -> bool {
        if id.is_empty() {
            return false;
        }
        if self.entries.contains(id) {
            return true;
        }
        if self.max_entries > 0 {
            // At capacity `push` hands back the single oldest entry.
            let _ = self.entries.push(id.to_string(), now);
        }
        self.purge_expired(now);
        false
    }

    /// Drop entries older than the TTL, stopping at the first fresh one.
    pub fn purge_expired(&mut self, now: Instant) {
        while let Some((_, first_seen)) = self.entries.peek_lru() {
            if now.saturating_duration_since(*first_seen) > self.ttl {
                self.entries.pop_lru();
            } else {
                break;
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SEEN, DEFAULT_SEEN_TTL)
    }
}
