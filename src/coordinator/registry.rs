//! In-flight scheduled-run registry.
//!
//! An injected, explicitly-owned concurrent map enforcing at most one live
//! run per schedule id. Producer tasks append cancelable handles; the run's
//! cancellation callback cancels every handle and removes the entry. Entries
//! record the owning run id so a stale cancellation cannot evict a successor
//! run that reused the schedule id.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::task::AbortHandle;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a run is already in flight for schedule {0}")]
    AlreadyRunning(String),
}

/// Cancelable handle to one spawned unit of run work.
#[derive(Debug)]
pub struct RunHandle {
    abort: AbortHandle,
}

impl RunHandle {
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }
}

#[derive(Debug)]
struct Entry {
    run_id: String,
    handles: Vec<RunHandle>,
}

/// `schedule id -> in-flight run` for every scheduled run.
#[derive(Debug, Default)]
pub struct RunRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-if-absent. A second registration for a live schedule id is
    /// rejected before any work is dispatched.
    pub fn register(&self, schedule_id: &str, run_id: &str) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        if entries.contains_key(schedule_id) {
            return Err(RegistryError::AlreadyRunning(schedule_id.to_string()));
        }
        entries.insert(
            schedule_id.to_string(),
            Entry {
                run_id: run_id.to_string(),
                handles: Vec::new(),
            },
        );
        Ok(())
    }

    /// Append a handle to the registered run. Returns the handle back when
    /// the entry is gone or owned by another run (cancellation raced the
    /// spawn) so the caller can cancel it immediately.
    pub fn append(
        &self,
        schedule_id: &str,
        run_id: &str,
        handle: RunHandle,
    ) -> Result<(), RunHandle> {
        let mut entries = self.lock();
        match entries.get_mut(schedule_id) {
            Some(entry) if entry.run_id == run_id => {
                entry.handles.push(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Cancel every handle of the named run and remove its entry. A no-op
    /// when the entry belongs to a different run. Returns the number of
    /// handles cancelled.
    pub fn cancel_and_remove(&self, schedule_id: &str, run_id: &str) -> usize {
        let removed = {
            let mut entries = self.lock();
            match entries.get(schedule_id) {
                Some(entry) if entry.run_id == run_id => entries.remove(schedule_id),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                for handle in &entry.handles {
                    handle.cancel();
                }
                entry.handles.len()
            }
            None => 0,
        }
    }

    /// Remove without cancelling (natural completion). Only removes the
    /// named run's own entry.
    pub fn remove(&self, schedule_id: &str, run_id: &str) -> bool {
        let mut entries = self.lock();
        match entries.get(schedule_id) {
            Some(entry) if entry.run_id == run_id => {
                entries.remove(schedule_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, schedule_id: &str) -> bool {
        self.lock().contains_key(schedule_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
