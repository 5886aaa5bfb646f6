//! Run record store
//!
//! Seam to the external document store that owns run records. The engine
//! only needs get/insert/patch-by-id semantics; whatever actually persists
//! the documents (and serves the rest of the system) lives behind this
//! trait.

use anyhow::Result;
use async_trait::async_trait;
use runforge_core::domain::run::{RunRecord, RunUpdate};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Document-store operations the engine depends on
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Stores a freshly created run record.
    async fn insert(&self, record: RunRecord) -> Result<()>;

    /// Fetches a run record by id.
    async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    /// Applies a partial update; returns false if the run does not exist.
    ///
    /// Each call is atomic with respect to other `apply` calls, but there
    /// is no check-and-set across a get/apply pair: concurrent terminal
    /// writers resolve last-writer-wins.
    async fn apply(&self, run_id: Uuid, update: RunUpdate) -> Result<bool>;
}

/// In-memory store for tests and single-process embedding
#[derive(Default)]
pub struct MemoryRunStore {
    records: Mutex<HashMap<Uuid, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, record: RunRecord) -> Result<()> {
        let mut records = self.records.lock().expect("store poisoned");
        records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let records = self.records.lock().expect("store poisoned");
        Ok(records.get(&run_id).cloned())
    }

    async fn apply(&self, run_id: Uuid, update: RunUpdate) -> Result<bool> {
        let mut records = self.records.lock().expect("store poisoned");
        match records.get_mut(&run_id) {
            Some(record) => {
                update.apply_to(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
