//! Content-addressed blob storage.
//!
//! Large shared payloads (clipboard contents, pasted images) are stored once
//! and referenced by the hex SHA-256 of their bytes. The broker answers
//! `BLOB_PUT` with the key and `BLOB_GET` with the bytes; blobs never reach
//! the worker.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

/// Get/put by content key.
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Store `data`, returning its key.
    fn put(&self, data: &[u8]) -> String;
    /// Fetch the bytes stored under `key`.
    fn get(&self, key: &str) -> Option<Arc<Vec<u8>>>;
}

/// Hex SHA-256 of `data`.
pub fn blob_key(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, Arc<Vec<u8>>>,
    order: VecDeque<String>,
    bytes: usize,
}

/// In-memory store with oldest-first eviction once `capacity` bytes are held.
#[derive(Debug)]
pub struct MemoryBlobStore {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MemoryBlobStore {
    /// Create a store holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Total bytes currently stored.
    pub fn stored_bytes(&self) -> usize {
        self.inner.lock().expect("blob store mutex poisoned").bytes
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, data: &[u8]) -> String {
        let key = blob_key(data);
        let mut inner = self.inner.lock().expect("blob store mutex poisoned");
        if inner.blobs.contains_key(&key) {
            return key;
        }
        while inner.bytes + data.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.blobs.remove(&oldest) {
                inner.bytes -= evicted.len();
                log::debug!("[blob] Evicted {oldest} ({} bytes)", evicted.len());
            }
        }
        if data.len() > self.capacity {
            log::warn!("[blob] Blob of {} bytes exceeds store capacity; not retained", data.len());
            return key;
        }
        inner.bytes += data.len();
        inner.order.push_back(key.clone());
        inner.blobs.insert(key.clone(), Arc::new(data.to_vec()));
        key
    }

    fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let inner = self.inner.lock().expect("blob store mutex poisoned");
        inner.blobs.get(key).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_sha256_hex() {
        assert_eq!(
            blob_key(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_put_then_get() {
        let store = MemoryBlobStore::new(1024);
        let key = store.put(b"clipboard");
        assert_eq!(store.get(&key).unwrap().as_slice(), b"clipboard");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_put_is_stored_once() {
        let store = MemoryBlobStore::new(1024);
        store.put(b"same");
        store.put(b"same");
        assert_eq!(store.stored_bytes(), 4);
    }

    #[test]
    fn test_oldest_blob_is_evicted_at_capacity() {
        let store = MemoryBlobStore::new(10);
        let first = store.put(b"aaaaaa");
        let second = store.put(b"bbbbbb");
        assert!(store.get(&first).is_none());
        assert!(store.get(&second).is_some());
        assert_eq!(store.stored_bytes(), 6);
    }
}
