//! Ephemeral replay-result storage.
//!
//! Entries live for the daemon's lifetime at most; a background sweeper
//! evicts anything older than the configured TTL on a coarse interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ReplayEntry {
    pub headers: Vec<u8>,
    pub body: Vec<u8>,
    pub duration: Duration,
    pub created_at: Instant,
}

impl ReplayEntry {
    pub fn new(headers: Vec<u8>, body: Vec<u8>, duration: Duration) -> Self {
        ReplayEntry {
            headers,
            body,
            duration,
            created_at: Instant::now(),
        }
    }
}

#[derive(Default)]
pub struct ReplayStore {
    entries: Mutex<HashMap<String, ReplayEntry>>,
}

impl ReplayStore {
    pub fn new() -> Self {
        ReplayStore::default()
    }

    pub fn store(&self, id: &str, entry: ReplayEntry) {
        self.entries
            .lock()
            .expect("replay store poisoned")
            .insert(id.to_string(), entry);
    }

    pub fn get(&self, id: &str) -> Option<ReplayEntry> {
        self.entries
            .lock()
            .expect("replay store poisoned")
            .get(id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().expect("replay store poisoned").len()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("replay store poisoned").clear();
    }

    /// Drop entries older than `max_age`; returns how many were evicted.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock().expect("replay store poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() <= max_age);
        before - entries.len()
    }

    /// Run the TTL sweeper until the task is aborted at daemon shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, ttl: Duration, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so fresh entries survive.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = store.sweep(ttl);
                if evicted > 0 {
                    log::info!("replay store: evicted {evicted} expired entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_get_round_trip() {
        let store = ReplayStore::new();
        store.store(
            "id",
            ReplayEntry::new(b"HTTP/1.1 200 OK\r\n\r\n".to_vec(), b"body".to_vec(), Duration::from_secs(1)),
        );

        let entry = store.get("id").expect("stored entry");
        assert_eq!(entry.headers, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(entry.body, b"body");
        assert_eq!(entry.duration, Duration::from_secs(1));
        assert!(store.get("other").is_none());
    }

    #[test]
    fn count_and_clear() {
        let store = ReplayStore::new();
        store.store("one", ReplayEntry::new(vec![], vec![], Duration::ZERO));
        store.store("two", ReplayEntry::new(vec![], vec![], Duration::ZERO));
        assert_eq!(store.count(), 2);

        store.clear();
        assert_eq!(store.count(), 0);
        assert!(store.get("one").is_none());
    }

    #[test]
    fn sweep_evicts_only_expired_entries() {
        let store = ReplayStore::new();
        let mut old = ReplayEntry::new(vec![], vec![], Duration::ZERO);
        old.created_at = Instant::now() - Duration::from_secs(120);
        store.store("old", old);
        store.store("fresh", ReplayEntry::new(vec![], vec![], Duration::ZERO));

        assert_eq!(store.sweep(Duration::from_secs(60)), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
    }
}
