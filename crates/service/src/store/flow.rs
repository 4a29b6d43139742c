//! Flow-identity cache.
//!
//! Remote proxy history is addressed by integer offset, which drifts as the
//! proxy records new traffic. The daemon mints short base62 ids bound to
//! the sha256 of the exact request bytes; the offset is only a hint that
//! gets rebound when it goes stale.

use crate::ids;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

/// Hex sha256 over the raw request bytes.
pub fn content_hash(request: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRef {
    pub offset: usize,
    pub hash: String,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, FlowRef>,
    by_hash: HashMap<String, String>,
}

/// In-memory id map. Invariant: at most one identifier per content hash.
#[derive(Default)]
pub struct FlowStore {
    inner: RwLock<Inner>,
}

impl FlowStore {
    pub fn new() -> Self {
        FlowStore::default()
    }

    /// Register a history entry seen at `offset`. Reuses the existing id
    /// for a known hash (updating the offset hint), otherwise mints one.
    pub fn intern(&self, offset: usize, hash: &str) -> String {
        let mut inner = self.inner.write().expect("flow store poisoned");
        if let Some(id) = inner.by_hash.get(hash).cloned() {
            if let Some(entry) = inner.by_id.get_mut(&id) {
                entry.offset = offset;
            }
            return id;
        }

        let mut id = ids::generate(ids::DEFAULT_LENGTH);
        while inner.by_id.contains_key(&id) {
            id = ids::generate(ids::DEFAULT_LENGTH);
        }
        inner.by_id.insert(
            id.clone(),
            FlowRef {
                offset,
                hash: hash.to_string(),
            },
        );
        inner.by_hash.insert(hash.to_string(), id.clone());
        id
    }

    pub fn lookup(&self, id: &str) -> Option<FlowRef> {
        self.inner
            .read()
            .expect("flow store poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    /// Point an id at a new offset after a rescan found its hash elsewhere.
    pub fn rebind(&self, id: &str, offset: usize) {
        let mut inner = self.inner.write().expect("flow store poisoned");
        if let Some(entry) = inner.by_id.get_mut(id) {
            entry.offset = offset;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("flow store poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_hex() {
        let a = content_hash(b"GET / HTTP/1.1\r\n\r\n");
        let b = content_hash(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash(b"GET /other HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn intern_reuses_id_for_same_hash() {
        let store = FlowStore::new();
        let hash = content_hash(b"request-a");

        let id1 = store.intern(0, &hash);
        let id2 = store.intern(7, &hash);
        assert_eq!(id1, id2);
        assert_eq!(store.len(), 1);
        // Offset hint follows the most recent observation.
        assert_eq!(store.lookup(&id1).unwrap().offset, 7);
    }

    #[test]
    fn distinct_hashes_get_distinct_ids() {
        let store = FlowStore::new();
        let id_a = store.intern(0, &content_hash(b"a"));
        let id_b = store.intern(1, &content_hash(b"b"));
        assert_ne!(id_a, id_b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn rebind_updates_offset_only() {
        let store = FlowStore::new();
        let hash = content_hash(b"payload");
        let id = store.intern(3, &hash);

        store.rebind(&id, 42);
        let entry = store.lookup(&id).unwrap();
        assert_eq!(entry.offset, 42);
        assert_eq!(entry.hash, hash);

        // Unknown ids are ignored.
        store.rebind("missing", 1);
        assert!(store.lookup("missing").is_none());
    }

    #[test]
    fn swapped_offsets_rebind_without_new_ids() {
        let store = FlowStore::new();
        let hash_a = content_hash(b"first");
        let hash_b = content_hash(b"second");

        let id_a = store.intern(0, &hash_a);
        let id_b = store.intern(1, &hash_b);

        // History re-fetch returns the entries in reversed order.
        let again_a = store.intern(1, &hash_a);
        let again_b = store.intern(0, &hash_b);
        assert_eq!(id_a, again_a);
        assert_eq!(id_b, again_b);
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup(&id_a).unwrap().offset, 1);
        assert_eq!(store.lookup(&id_b).unwrap().offset, 0);
    }
}
