//! Revision cache for cheap "anything changed?" probes
//!
//! A cache client is passed into each collection. Stream heads only grow, so a
//! cached head above the watermark proves a change; anything else falls
//! through to the database.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::StreamKey;

/// Key/value store holding stream heads
pub trait RevisionCache: Send + Sync {
    /// Cached value, `None` on a miss
    fn get(&self, key: &str) -> Option<i64>;

    /// Store a value
    fn put(&self, key: &str, value: i64);

    /// Drop a value
    fn invalidate(&self, key: &str);
}

/// Cache key of a stream head
pub fn head_key(stream: &StreamKey) -> String {
    format!("head:{}", stream.ledger_key())
}

/// Cache that never holds anything; every probe falls through to the database
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRevisionCache;

impl RevisionCache for NoRevisionCache {
    fn get(&self, _key: &str) -> Option<i64> {
        None
    }

    fn put(&self, _key: &str, _value: i64) {}

    fn invalidate(&self, _key: &str) {}
}

/// In-process cache shared between the collections of one worker pool
#[derive(Debug, Default)]
pub struct MemoryRevisionCache {
    entries: Mutex<HashMap<String, i64>>,
}

impl MemoryRevisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RevisionCache for MemoryRevisionCache {
    fn get(&self, key: &str) -> Option<i64> {
        // A poisoned lock degrades to a miss
        self.entries.lock().ok()?.get(key).copied()
    }

    fn put(&self, key: &str, value: i64) {
        if let Ok(mut entries) = self.entries.lock() {
            // Heads only grow; never overwrite with an older value
            let entry = entries.entry(key.to_string()).or_insert(value);
            *entry = (*entry).max(value);
        }
    }

    fn invalidate(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}
