use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{BucketError, BucketStore, ObjectMeta};

/// Object-store operations that can be made to fail on a [`MemoryBucketStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Head,
    Get,
    Put,
    Copy,
    Delete,
    List,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Bytes>,
    failing: HashSet<Operation>,
    mutations: usize,
}

/// In-process bucket backed by a sorted map. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryBucketStore {
    bucket: String,
    state: Mutex<State>,
}

impl MemoryBucketStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Seeds an object without counting it as a mutation.
    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Bytes>) {
        self.lock().objects.insert(key.into(), bytes.into());
    }

    pub fn fail_operation(&self, operation: Operation) {
        self.lock().failing.insert(operation);
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).cloned()
    }

    /// Number of successful put, copy and delete calls.
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations
    }

    fn list(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectMeta>, BucketError> {
        let state = self.lock();
        Self::check(&state, Operation::List, prefix)?;
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, bytes)| ObjectMeta {
                key: key.clone(),
                size_bytes: bytes.len() as u64,
            })
            .collect())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(state: &State, operation: Operation, key: &str) -> Result<(), BucketError> {
        if state.failing.contains(&operation) {
            return Err(BucketError::Sdk(format!(
                "injected {operation:?} failure for '{key}'"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>, BucketError> {
        let state = self.lock();
        Self::check(&state, Operation::Head, key)?;
        Ok(state.objects.get(key).map(|bytes| ObjectMeta {
            key: key.to_string(),
            size_bytes: bytes.len() as u64,
        }))
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        let state = self.lock();
        Self::check(&state, Operation::Get, key)?;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| BucketError::NotFound(key.to_string()))
    }

    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<(), BucketError> {
        let mut state = self.lock();
        Self::check(&state, Operation::Put, key)?;
        state.objects.insert(key.to_string(), bytes);
        state.mutations += 1;
        Ok(())
    }

    async fn copy_object(
        &self,
        source_key: &str,
        destination_key: &str,
    ) -> Result<(), BucketError> {
        let mut state = self.lock();
        Self::check(&state, Operation::Copy, source_key)?;
        let bytes = state
            .objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| BucketError::NotFound(source_key.to_string()))?;
        state.objects.insert(destination_key.to_string(), bytes);
        state.mutations += 1;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), BucketError> {
        let mut state = self.lock();
        Self::check(&state, Operation::Delete, key)?;
        state.objects.remove(key);
        state.mutations += 1;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
        self.list(prefix, usize::MAX)
    }

    async fn list_prefix_limited(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<ObjectMeta>, BucketError> {
        self.list(prefix, limit)
    }

    async fn probe_prefix(&self, prefix: &str) -> Result<(), BucketError> {
        let state = self.lock();
        Self::check(&state, Operation::List, prefix)
    }
}
