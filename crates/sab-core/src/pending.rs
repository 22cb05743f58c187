use std::{collections::HashMap, time::Duration};

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct PendingPrompt {
    prompt: String,
    created: Instant,
}

/// Prompts waiting for a delivery receipt to reveal their recipient, keyed by
/// the outbound message timestamp the receipt will acknowledge.
///
/// Entries are visible for at most `ttl`: `take_if_present` never serves an
/// entry older than that, and the periodic sweep removes stale entries whether
/// or not anyone asked for them. At most one entry exists per timestamp; a
/// later insert under the same key overwrites.
pub struct PendingTable {
    ttl: Duration,
    entries: Mutex<HashMap<i64, PendingPrompt>>,
}

impl PendingTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts or overwrites the prompt stored under `timestamp`.
    pub async fn put(&self, timestamp: i64, prompt: String) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            timestamp,
            PendingPrompt {
                prompt,
                created: Instant::now(),
            },
        );
    }

    /// Consumes and returns the first live entry whose key appears in
    /// `timestamps`, scanning in the order given. Expired entries are dropped
    /// on contact and never returned, so a caller sees each stored prompt at
    /// most once.
    pub async fn take_if_present(&self, timestamps: &[i64]) -> Option<(i64, String)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        for &timestamp in timestamps {
            if let Some(entry) = entries.remove(&timestamp) {
                if now.duration_since(entry.created) <= self.ttl {
                    return Some((timestamp, entry.prompt));
                }
                // Stale and unswept: treat as already gone, keep scanning.
            }
        }
        None
    }

    /// Removes every entry older than the TTL as of `now`; returns how many
    /// were dropped.
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.created) <= self.ttl);
        before - entries.len()
    }
}
