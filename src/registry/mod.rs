//! Run registry
//!
//! Process-wide map of active runs to their cancellation state. The run
//! driver registers, polls and deregisters; cancel requests arrive from other
//! request handlers, possibly on other worker threads. Every operation takes
//! the map lock once and never holds it across an await point.

mod entry;

pub use entry::{RunHandle, RunId, RunInfo};

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::utils::cancel::CancelHandle;
use entry::RunEntry;

/// Registry of active runs.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<RunId, RunEntry>>,
}

static_assertions::assert_impl_all!(RunRegistry: Send, Sync);

impl RunRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave an entry half-written, so a
    // poisoned map is still consistent.
    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a run under `id`.
    ///
    /// Fails with `DuplicateRun` if `id` is already active; the existing
    /// run is left untouched.
    pub fn register(&self, id: RunId, owner: impl Into<String>) -> Result<RunHandle> {
        let owner = owner.into();
        let mut runs = self.runs();
        if runs.contains_key(&id) {
            return Err(StreamError::DuplicateRun(id.to_string()));
        }
        let cancel = CancelHandle::new();
        runs.insert(
            id.clone(),
            RunEntry {
                owner: owner.clone(),
                cancel: cancel.clone(),
                started_at: Utc::now(),
            },
        );
        debug!(run_id = %id, owner = %owner, "run registered");
        Ok(RunHandle::new(id, owner, cancel))
    }

    /// Register a run under a freshly minted id.
    pub fn register_new(&self, owner: impl Into<String>) -> RunHandle {
        let owner = owner.into();
        loop {
            match self.register(RunId::mint(), owner.clone()) {
                Ok(handle) => return handle,
                Err(_) => continue,
            }
        }
    }

    /// Request cancellation of `id`.
    ///
    /// Returns whether a matching run existed. Does not wait for the run to
    /// observe the request.
    pub fn cancel(&self, id: &RunId) -> bool {
        match self.runs().get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(run_id = %id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Request cancellation of `id` only if it was started by `owner`.
    ///
    /// A run of another owner is reported exactly like an unknown id.
    pub fn cancel_owned(&self, id: &RunId, owner: &str) -> bool {
        match self.runs().get(id) {
            Some(entry) if entry.owner == owner => {
                entry.cancel.cancel();
                debug!(run_id = %id, owner, "run cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Request cancellation of every active run started by `owner`.
    ///
    /// Returns the number of runs flagged.
    pub fn cancel_owner(&self, owner: &str) -> usize {
        let runs = self.runs();
        let mut count = 0;
        for (id, entry) in runs.iter().filter(|(_, e)| e.owner == owner) {
            entry.cancel.cancel();
            debug!(run_id = %id, owner, "run cancellation requested");
            count += 1;
        }
        count
    }

    /// Whether `id` has been asked to stop. Unknown ids report `false`.
    pub fn is_cancelled(&self, id: &RunId) -> bool {
        self.runs()
            .get(id)
            .is_some_and(|entry| entry.cancel.is_cancelled())
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: &RunId) -> bool {
        self.runs().contains_key(id)
    }

    /// Remove `id`. Safe to call when absent.
    pub fn deregister(&self, id: &RunId) {
        if self.runs().remove(id).is_some() {
            debug!(run_id = %id, "run deregistered");
        }
    }

    /// Ids of all active runs.
    pub fn list_active(&self) -> BTreeSet<RunId> {
        self.runs().keys().cloned().collect()
    }

    /// Snapshot of all active runs, ordered by id.
    pub fn snapshot(&self) -> Vec<RunInfo> {
        let mut out: Vec<RunInfo> = self
            .runs()
            .iter()
            .map(|(id, entry)| RunInfo {
                id: id.clone(),
                owner: entry.owner.clone(),
                cancelled: entry.cancel.is_cancelled(),
                started_at: entry.started_at,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Number of active runs.
    pub fn len(&self) -> usize {
        self.runs().len()
    }

    /// Whether no run is active.
    pub fn is_empty(&self) -> bool {
        self.runs().is_empty()
    }

    /// Tie the lifetime of `id`'s registration to the returned guard.
    pub fn guard(self: &Arc<Self>, id: RunId) -> RunGuard {
        RunGuard {
            registry: Arc::clone(self),
            id,
        }
    }
}

/// Deregisters its run when dropped, on every exit path of the driver
/// including panics and dropped futures.
#[derive(Debug)]
pub struct RunGuard {
    registry: Arc<RunRegistry>,
    id: RunId,
}

impl RunGuard {
    /// Id of the guarded run.
    pub fn id(&self) -> &RunId {
        &self.id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.id);
    }
}
