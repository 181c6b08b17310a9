//! Execution engine contract
//!
//! The engine that runs the reasoning pipeline lives outside this crate. It is
//! consumed as a lazy stream of tagged `EngineEvent`s; only the shape of an
//! event matters here, never the pipeline's own step logic.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Output of one named pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Step name
    pub name: String,
    /// Step payload
    pub payload: Map<String, Value>,
}

impl StepEvent {
    /// Build a step event from a JSON payload.
    ///
    /// An object is used as-is, `null` becomes an empty payload and any other
    /// value is stored under the key `"value"`.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Step event with an empty payload.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Map::new(),
        }
    }
}

/// One item produced by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A named pipeline step.
    Step(StepEvent),
    /// A free-form narrative chunk from a chat-style engine.
    Text {
        /// Chunk text
        text: String,
    },
}

impl EngineEvent {
    /// Shorthand for a step event.
    pub fn step(name: impl Into<String>, payload: Value) -> Self {
        Self::Step(StepEvent::new(name, payload))
    }

    /// Shorthand for a text chunk.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Lazy sequence of engine events. Finite in practice.
pub type StepStream = Pin<Box<dyn Stream<Item = Result<EngineEvent>> + Send>>;

/// Capabilities an engine declares once, up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Engine accepts a tool list in its input.
    pub accepts_tools: bool,
}

/// Initial input handed to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineInput {
    /// User question, with attachment text appended when present
    pub query: String,
    /// Identity of the caller
    pub owner: String,
    /// Data source the pipeline should query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<i64>,
    /// Conversation id, for engine-side session grouping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    /// Tools offered to the engine; empty unless it accepts tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

/// Producer of step sequences.
#[async_trait]
pub trait StepEngine: Send + Sync {
    /// Declared capabilities.
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    /// Start the pipeline and return its event stream.
    async fn start(&self, input: PipelineInput) -> Result<StepStream>;
}

/// File reference attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Display name
    pub name: String,
    /// Storage location understood by the reader
    pub location: String,
}

/// Converts attachments to markdown text for the pipeline input.
#[async_trait]
pub trait AttachmentReader: Send + Sync {
    /// Read all attachments into one markdown document.
    async fn read_as_markdown(&self, attachments: &[Attachment]) -> Result<String>;
}

/// Append attachment text to `query` the way the pipeline expects it.
pub fn query_with_reference(query: &str, markdown: &str) -> String {
    if markdown.is_empty() {
        query.to_string()
    } else {
        format!("{query}\n\nReference material:\n{markdown}")
    }
}
