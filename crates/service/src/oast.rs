//! OAST session registry.
//!
//! A flat map keyed by session id; each session owns a bounded ring of
//! observed interaction events plus a cursor for `since="last"` polling.
//! Long-poll waiters park on a per-session `Notify` that is signalled on
//! every event enqueue and on session deletion.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Hard ceiling on long-poll waits, regardless of the caller's request.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct OastEventRecord {
    pub id: String,
    pub time: DateTime<Utc>,
    pub event_type: String,
    pub source_ip: String,
    pub subdomain: String,
    pub details: String,
}

#[derive(Debug, Clone)]
pub struct OastSessionRecord {
    pub id: String,
    pub label: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub events: Vec<OastEventRecord>,
    pub dropped_count: u64,
}

struct SessionState {
    info: OastSessionRecord,
    ring: VecDeque<(u64, OastEventRecord)>,
    next_seq: u64,
    cursor: u64,
    dropped: u64,
    deleted: bool,
}

struct SessionHandle {
    state: Mutex<SessionState>,
    notify: Notify,
}

pub struct OastRegistry {
    capacity: usize,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl OastRegistry {
    pub fn new(ring_capacity: usize) -> Self {
        OastRegistry {
            capacity: ring_capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session. A non-empty label must be unique among live
    /// sessions.
    pub fn insert(&self, info: OastSessionRecord) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("oast registry poisoned");
        if !info.label.is_empty() {
            for handle in sessions.values() {
                let state = handle.state.lock().expect("oast session poisoned");
                if state.info.label == info.label {
                    return Err(ServiceError::LabelExists(info.label.clone()));
                }
            }
        }

        let id = info.id.clone();
        sessions.insert(
            id,
            Arc::new(SessionHandle {
                state: Mutex::new(SessionState {
                    info,
                    ring: VecDeque::new(),
                    next_seq: 0,
                    cursor: 0,
                    dropped: 0,
                    deleted: false,
                }),
                notify: Notify::new(),
            }),
        );
        Ok(())
    }

    /// Resolve a session by id, label, or domain.
    fn resolve(&self, key: &str) -> Result<Arc<SessionHandle>> {
        let sessions = self.sessions.lock().expect("oast registry poisoned");
        if let Some(handle) = sessions.get(key) {
            return Ok(Arc::clone(handle));
        }
        for handle in sessions.values() {
            let state = handle.state.lock().expect("oast session poisoned");
            if state.info.domain == key || (!key.is_empty() && state.info.label == key) {
                drop(state);
                return Ok(Arc::clone(handle));
            }
        }
        Err(ServiceError::NotFound(format!("session not found: {key}")))
    }

    pub fn session_info(&self, key: &str) -> Result<OastSessionRecord> {
        let handle = self.resolve(key)?;
        let state = handle.state.lock().expect("oast session poisoned");
        Ok(state.info.clone())
    }

    /// Append an event to the session identified by `key` (id, label, or
    /// domain). Ring overflow advances the dropped counter.
    pub fn push_event(&self, key: &str, event: OastEventRecord) -> Result<()> {
        let handle = self.resolve(key)?;
        let mut state = handle.state.lock().expect("oast session poisoned");
        let seq = state.next_seq + 1;
        state.next_seq = seq;
        state.ring.push_back((seq, event));
        if state.ring.len() > self.capacity {
            state.ring.pop_front();
            state.dropped += 1;
        }
        drop(state);
        handle.notify.notify_waiters();
        Ok(())
    }

    /// Poll for events.
    ///
    /// - `since == "last"` returns events strictly newer than the cursor
    ///   and advances it past the last event actually returned.
    /// - `since == "<event-id>"` returns events strictly after that event;
    ///   an id already evicted from the ring yields everything buffered.
    /// - `since == ""` returns all buffered events, cursor untouched.
    ///
    /// A positive `wait` long-polls until events arrive, the session is
    /// deleted, the request is cancelled, or `min(wait, 120s)` elapses.
    pub async fn poll(
        &self,
        ctx: &CancellationToken,
        key: &str,
        since: &str,
        wait: Duration,
        limit: usize,
    ) -> Result<PollOutcome> {
        let handle = self.resolve(key)?;
        let deadline = tokio::time::Instant::now() + wait.min(MAX_POLL_WAIT);

        loop {
            if ctx.is_cancelled() {
                return Err(ServiceError::Canceled);
            }
            let notified = handle.notify.notified();

            {
                let mut state = handle.state.lock().expect("oast session poisoned");
                if state.deleted {
                    return Err(ServiceError::NotFound(format!("session not found: {key}")));
                }

                let from_seq = match since {
                    "" => 0,
                    "last" => state.cursor,
                    event_id => state
                        .ring
                        .iter()
                        .find(|(_, e)| e.id == event_id)
                        .map(|(seq, _)| *seq)
                        .unwrap_or(0),
                };

                let mut batch: Vec<(u64, OastEventRecord)> = state
                    .ring
                    .iter()
                    .filter(|(seq, _)| *seq > from_seq)
                    .cloned()
                    .collect();
                if limit > 0 && batch.len() > limit {
                    batch.truncate(limit);
                }

                let expired = tokio::time::Instant::now() >= deadline;
                if !batch.is_empty() || wait.is_zero() || expired {
                    if since == "last" {
                        if let Some((seq, _)) = batch.last() {
                            state.cursor = *seq;
                        }
                    }
                    return Ok(PollOutcome {
                        events: batch.into_iter().map(|(_, e)| e).collect(),
                        dropped_count: state.dropped,
                    });
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(ServiceError::Canceled),
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    pub fn get_event(&self, key: &str, event_id: &str) -> Result<OastEventRecord> {
        let handle = self.resolve(key)?;
        let state = handle.state.lock().expect("oast session poisoned");
        state
            .ring
            .iter()
            .find(|(_, e)| e.id == event_id)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("event not found: {event_id}")))
    }

    pub fn list(&self) -> Vec<OastSessionRecord> {
        let sessions = self.sessions.lock().expect("oast registry poisoned");
        sessions
            .values()
            .map(|handle| {
                handle
                    .state
                    .lock()
                    .expect("oast session poisoned")
                    .info
                    .clone()
            })
            .collect()
    }

    /// Remove a session and wake any parked pollers. Returns the record so
    /// the adapter can release provider-side resources.
    pub fn remove(&self, key: &str) -> Result<OastSessionRecord> {
        let handle = self.resolve(key)?;
        let info = {
            let mut state = handle.state.lock().expect("oast session poisoned");
            state.deleted = true;
            state.info.clone()
        };
        handle.notify.notify_waiters();
        self.sessions
            .lock()
            .expect("oast registry poisoned")
            .remove(&info.id);
        Ok(info)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("oast registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
