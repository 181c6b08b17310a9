//! Run identifiers and per-run registry entries

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::cancel::CancelHandle;

/// Identifier of one run.
///
/// Run ids are minted per run and are distinct from the caller identity, so
/// one caller may have several runs that are cancelled independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Mint a fresh random run id.
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// State the registry holds for one active run.
#[derive(Debug, Clone)]
pub(crate) struct RunEntry {
    pub(crate) owner: String,
    pub(crate) cancel: CancelHandle,
    pub(crate) started_at: DateTime<Utc>,
}

/// Handle given to the driver of one registered run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    id: RunId,
    owner: String,
    cancel: CancelHandle,
}

impl RunHandle {
    pub(crate) fn new(id: RunId, owner: String, cancel: CancelHandle) -> Self {
        Self { id, owner, cancel }
    }

    /// Run id.
    pub fn id(&self) -> &RunId {
        &self.id
    }

    /// Identity of the caller that started the run.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether a stop was requested. Non-blocking.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Snapshot of one active run, for operational tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    /// Run id
    pub id: RunId,
    /// Caller identity
    pub owner: String,
    /// Whether a stop was requested
    pub cancelled: bool,
    /// Registration time
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_unique() {
        let a = RunId::mint();
        let b = RunId::mint();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn run_id_serializes_as_plain_string() {
        let id = RunId::from("run-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"run-1\"");
    }
}
