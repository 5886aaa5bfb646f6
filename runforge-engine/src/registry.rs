//! Active-run registry
//!
//! The authoritative in-memory table of runs currently owned by this engine
//! instance. An entry exists if and only if an execution is in flight (or
//! being set up); absence means callers defer to the persisted record.
//!
//! A single mutex guards the table and is held only for the duration of a
//! table mutation, never across process I/O or blocking waits. Execution
//! setup reserves an entry first, which is what makes two concurrent
//! `execute` calls for the same run race safely: exactly one reservation
//! wins, the other gets a conflict.

use runforge_core::domain::run::RunStatus;
use runforge_core::error::{EngineError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ports::PortRange;
use crate::process::ProcessHandle;

/// One actively executing run
pub struct RegistryEntry {
    /// Live process handle; `None` while the reservation is being set up
    pub handle: Option<Arc<ProcessHandle>>,
    /// Current in-memory status (more current than the store while live)
    pub status: RunStatus,
    /// Port interval allocated for this execution
    pub ports: Option<PortRange>,
    /// Monitor task watching the process
    pub monitor: Option<JoinHandle<()>>,
}

/// In-memory table of active runs
#[derive(Default)]
pub struct RunRegistry {
    entries: Mutex<HashMap<Uuid, RegistryEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an entry for `run_id` before any side effect happens.
    ///
    /// Fails with a conflict if the run already has an entry, live or
    /// pending. This is the at-most-one-active-process-per-run gate.
    pub fn reserve(&self, run_id: Uuid) -> Result<()> {
        let mut entries = self.entries.lock().expect("registry poisoned");
        if entries.contains_key(&run_id) {
            return Err(EngineError::conflict(run_id, "run is already executing"));
        }
        entries.insert(
            run_id,
            RegistryEntry {
                handle: None,
                status: RunStatus::Starting,
                ports: None,
                monitor: None,
            },
        );
        Ok(())
    }

    /// Fills a reservation with the spawned process and its ports.
    pub fn activate(&self, run_id: Uuid, handle: Arc<ProcessHandle>, ports: PortRange) {
        let mut entries = self.entries.lock().expect("registry poisoned");
        if let Some(entry) = entries.get_mut(&run_id) {
            entry.handle = Some(handle);
            entry.ports = Some(ports);
            entry.status = RunStatus::Starting;
        }
    }

    /// Attaches the monitor task to an entry.
    pub fn set_monitor(&self, run_id: Uuid, monitor: JoinHandle<()>) {
        let mut entries = self.entries.lock().expect("registry poisoned");
        if let Some(entry) = entries.get_mut(&run_id) {
            entry.monitor = Some(monitor);
        }
    }

    /// Takes the monitor task out of an entry, leaving the entry in place.
    pub fn take_monitor(&self, run_id: &Uuid) -> Option<JoinHandle<()>> {
        let mut entries = self.entries.lock().expect("registry poisoned");
        entries.get_mut(run_id).and_then(|entry| entry.monitor.take())
    }

    /// Updates the in-memory status of a live run.
    pub fn set_status(&self, run_id: &Uuid, status: RunStatus) {
        let mut entries = self.entries.lock().expect("registry poisoned");
        if let Some(entry) = entries.get_mut(run_id) {
            entry.status = status;
        }
    }

    /// In-memory status, if the run is currently owned by this engine.
    pub fn status(&self, run_id: &Uuid) -> Option<RunStatus> {
        let entries = self.entries.lock().expect("registry poisoned");
        entries.get(run_id).map(|entry| entry.status)
    }

    /// Live process handle, if any.
    pub fn handle(&self, run_id: &Uuid) -> Option<Arc<ProcessHandle>> {
        let entries = self.entries.lock().expect("registry poisoned");
        entries.get(run_id).and_then(|entry| entry.handle.clone())
    }

    pub fn contains(&self, run_id: &Uuid) -> bool {
        let entries = self.entries.lock().expect("registry poisoned");
        entries.contains_key(run_id)
    }

    /// Removes and returns the entry for `run_id`. Idempotent.
    pub fn remove(&self, run_id: &Uuid) -> Option<RegistryEntry> {
        let mut entries = self.entries.lock().expect("registry poisoned");
        entries.remove(run_id)
    }

    /// Ids of all runs currently owned by this engine.
    pub fn active_ids(&self) -> Vec<Uuid> {
        let entries = self.entries.lock().expect("registry poisoned");
        entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_conflicts_on_second_call() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();

        assert!(registry.reserve(run_id).is_ok());
        let err = registry.reserve(run_id).unwrap_err();
        assert!(err.is_conflict());

        // Releasing the reservation makes the run executable again
        registry.remove(&run_id);
        assert!(registry.reserve(run_id).is_ok());
    }

    #[test]
    fn test_status_tracking() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        registry.reserve(run_id).unwrap();

        assert_eq!(registry.status(&run_id), Some(RunStatus::Starting));
        registry.set_status(&run_id, RunStatus::Running);
        assert_eq!(registry.status(&run_id), Some(RunStatus::Running));

        registry.remove(&run_id);
        assert_eq!(registry.status(&run_id), None);
    }

    #[test]
    fn test_active_ids() {
        let registry = RunRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.reserve(a).unwrap();
        registry.reserve(b).unwrap();

        let mut ids = registry.active_ids();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
