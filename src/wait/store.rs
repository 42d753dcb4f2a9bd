use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::{BatchError, Result};
use crate::wait::future::{CallKey, CallOutput, CallStatus};

/// Where finished calls leave their status and result.
///
/// `Ok(None)` from a fetch means "not available yet"; errors are transport
/// failures of the store itself.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Backend name; futures carry the name of the backend they were stored in.
    fn backend(&self) -> &str;

    /// Call ids of `executor_id`/`job_id` that have a status available.
    async fn ready_calls(&self, executor_id: &str, job_id: &str) -> Result<HashSet<String>>;

    async fn fetch_status(&self, key: &CallKey) -> Result<Option<CallStatus>>;

    async fn fetch_result(&self, key: &CallKey) -> Result<Option<CallOutput>>;
}

/// Builds stores for backends other than the one a waiter was given.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn open(&self, backend: &str) -> Result<Arc<dyn CallStore>>;
}

/// In-process call store.
pub struct MemoryStore {
    backend: String,
    statuses: RwLock<HashMap<CallKey, CallStatus>>,
    outputs: RwLock<HashMap<CallKey, CallOutput>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            statuses: RwLock::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub async fn put_status(&self, key: CallKey, status: CallStatus) {
        self.statuses.write().await.insert(key, status);
    }

    pub async fn put_result(&self, key: CallKey, output: CallOutput) {
        self.outputs.write().await.insert(key, output);
    }

    /// Store a successful call together with its value.
    pub async fn complete(&self, key: CallKey, value: serde_json::Value) {
        self.put_result(key.clone(), CallOutput::Value(value)).await;
        self.put_status(key, CallStatus::success()).await;
    }

    /// Make every operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BatchError::Storage(format!(
                "{} backend unavailable",
                self.backend
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    fn backend(&self) -> &str {
        &self.backend
    }

    async fn ready_calls(&self, executor_id: &str, job_id: &str) -> Result<HashSet<String>> {
        self.check_available()?;
        let statuses = self.statuses.read().await;
        Ok(statuses
            .keys()
            .filter(|k| k.executor_id == executor_id && k.job_id == job_id)
            .map(|k| k.call_id.clone())
            .collect())
    }

    async fn fetch_status(&self, key: &CallKey) -> Result<Option<CallStatus>> {
        self.check_available()?;
        Ok(self.statuses.read().await.get(key).cloned())
    }

    async fn fetch_result(&self, key: &CallKey) -> Result<Option<CallOutput>> {
        self.check_available()?;
        Ok(self.outputs.read().await.get(key).cloned())
    }
}

/// Hands out one shared [`MemoryStore`] per backend name.
#[derive(Default)]
pub struct MemoryStoreProvider {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store behind `backend`, created on first use.
    pub async fn store(&self, backend: &str) -> Arc<MemoryStore> {
        let mut stores = self.stores.lock().await;
        stores
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new(backend)))
            .clone()
    }
}

#[async_trait]
impl StoreProvider for MemoryStoreProvider {
    async fn open(&self, backend: &str) -> Result<Arc<dyn CallStore>> {
        let store: Arc<dyn CallStore> = self.store(backend).await;
        Ok(store)
    }
}
