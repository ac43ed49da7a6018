//! In-memory object store.
//!
//! Backs tests and single-host deployments. Keys are `(bucket, key)` pairs
//! in a concurrent map; listing walks the map and sorts.

use super::{ObjectStore, StorageError, StorageFuture};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A concurrent, process-local object store.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<(String, String), Bytes>,
    delete_calls: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `delete_prefix` calls made against this store. Lets tests
    /// assert that deprovisioning ran exactly once per bucket.
    pub fn delete_prefix_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Total object count across all buckets.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, bucket: &'a str, key: &'a str, data: Bytes) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.objects
                .insert((bucket.to_string(), key.to_string()), data);
            Ok(())
        })
    }

    fn get<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, Bytes> {
        Box::pin(async move {
            self.objects
                .get(&(bucket.to_string(), key.to_string()))
                .map(|entry| entry.value().clone())
                .ok_or_else(|| StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
        })
    }

    fn list_prefix<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StorageFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut keys: Vec<String> = self
                .objects
                .iter()
                .filter(|entry| entry.key().0 == bucket && entry.key().1.starts_with(prefix))
                .map(|entry| entry.key().1.clone())
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn delete_prefix<'a>(&'a self, bucket: &'a str, prefix: &'a str) -> StorageFuture<'a, usize> {
        Box::pin(async move {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            let doomed: Vec<(String, String)> = self
                .objects
                .iter()
                .filter(|entry| entry.key().0 == bucket && entry.key().1.starts_with(prefix))
                .map(|entry| entry.key().clone())
                .collect();
            let count = doomed.len();
            for key in doomed {
                self.objects.remove(&key);
            }
            Ok(count)
        })
    }
}
