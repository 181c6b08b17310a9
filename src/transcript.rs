//! Transcript persistence contract
//!
//! A completed run hands its narrative buffer and business buffer to a
//! `TranscriptStore`. A failed save is logged by the driver and never fails
//! a run that already streamed to the client.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde_json::{Map, Value};

use crate::envelope::DataType;
use crate::error::Result;
use crate::registry::RunId;

/// Request-level context of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Run id
    pub run_id: RunId,
    /// Caller identity
    pub owner: String,
    /// Client-supplied id of this question/answer record
    pub record_id: Option<String>,
    /// Conversation id
    pub chat_id: Option<String>,
    /// Original user question
    pub query: String,
}

/// Everything persisted for one completed run.
#[derive(Debug, Clone)]
pub struct TranscriptRecord {
    /// Request context
    pub context: RunContext,
    /// Narrative fragments in emission order
    pub narrative: Vec<String>,
    /// Last structured payload, wrapped as `{"data": ..., "dataType": "BUSINESS_DATA"}`;
    /// an empty object when the run produced none
    pub business: Value,
    /// Intent label
    pub intent_kind: String,
    /// Caller credential, forwarded for the store's own authorization
    pub token: SecretString,
    /// Free-form extras supplied with the request
    pub extras: Map<String, Value>,
    /// Data source the run queried
    pub datasource_id: Option<i64>,
    /// Completion time
    pub finished_at: DateTime<Utc>,
}

impl TranscriptRecord {
    /// Concatenated narrative text.
    pub fn narrative_text(&self) -> String {
        self.narrative.concat()
    }
}

/// Wrap a business payload the way transcripts store it.
pub fn business_record(payload: Option<&Value>) -> Value {
    match payload {
        Some(data) => serde_json::json!({
            "data": data,
            "dataType": DataType::BusinessData,
        }),
        None => Value::Object(Map::new()),
    }
}

/// Persists finished transcripts.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Save one transcript.
    async fn save(&self, record: TranscriptRecord) -> Result<()>;
}

/// In-memory transcript store.
#[derive(Debug, Default)]
pub struct MemoryTranscriptStore {
    records: Mutex<Vec<TranscriptRecord>>,
}

impl MemoryTranscriptStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All saved records, oldest first.
    pub fn records(&self) -> Vec<TranscriptRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of saved records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing was saved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn save(&self, record: TranscriptRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}
