//! Output envelope codec
//!
//! Every unit written to the client is `"data:" + JSON(envelope) + "\n\n"`.
//! Three envelope shapes exist on the wire:
//!
//! ```text
//! {"data":{"messageType":"continue","content":"..."},"dataType":"ANSWER"}
//! {"data":{...structured payload...},"dataType":"BUSINESS_DATA"}
//! {"data":{"messageType":"end","content":""},"dataType":"STREAM_END"}
//! ```
//!
//! Non-ASCII text is written as UTF-8, never `\u` escaped.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Prefix of every frame.
pub const FRAME_PREFIX: &str = "data:";

/// Suffix of every frame.
pub const FRAME_SUFFIX: &str = "\n\n";

/// Envelope classification (`dataType` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Narrative text
    #[serde(rename = "ANSWER")]
    Answer,
    /// Structured business payload
    #[serde(rename = "BUSINESS_DATA")]
    BusinessData,
    /// Unique stream terminator
    #[serde(rename = "STREAM_END")]
    StreamEnd,
}

impl DataType {
    /// Wire name of the data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answer => "ANSWER",
            Self::BusinessData => "BUSINESS_DATA",
            Self::StreamEnd => "STREAM_END",
        }
    }
}

/// `messageType` of a narrative envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Streaming content
    Continue,
    /// Informational notice (e.g. "stopped")
    Info,
    /// End of content
    End,
    /// Failure report
    Error,
}

/// Body of `ANSWER` and `STREAM_END` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerMessage {
    /// Message kind
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    /// Text content
    pub content: String,
}

/// One unit sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEnvelope", try_from = "WireEnvelope")]
pub enum OutputEnvelope {
    /// Narrative text
    Answer(AnswerMessage),
    /// Structured payload, sent as-is
    BusinessData(serde_json::Value),
    /// Terminator
    StreamEnd,
}

/// Field order on the wire is `data` then `dataType`.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    data: serde_json::Value,
    #[serde(rename = "dataType")]
    data_type: DataType,
}

impl From<OutputEnvelope> for WireEnvelope {
    fn from(envelope: OutputEnvelope) -> Self {
        match envelope {
            OutputEnvelope::Answer(msg) => Self {
                data: serde_json::json!({
                    "messageType": msg.message_type,
                    "content": msg.content,
                }),
                data_type: DataType::Answer,
            },
            OutputEnvelope::BusinessData(value) => Self {
                data: value,
                data_type: DataType::BusinessData,
            },
            OutputEnvelope::StreamEnd => Self {
                data: serde_json::json!({"messageType": MessageType::End, "content": ""}),
                data_type: DataType::StreamEnd,
            },
        }
    }
}

impl TryFrom<WireEnvelope> for OutputEnvelope {
    type Error = String;

    fn try_from(wire: WireEnvelope) -> std::result::Result<Self, Self::Error> {
        match wire.data_type {
            DataType::Answer => serde_json::from_value::<AnswerMessage>(wire.data)
                .map(OutputEnvelope::Answer)
                .map_err(|e| format!("invalid ANSWER body: {e}")),
            DataType::BusinessData => Ok(OutputEnvelope::BusinessData(wire.data)),
            DataType::StreamEnd => Ok(OutputEnvelope::StreamEnd),
        }
    }
}

impl OutputEnvelope {
    /// Narrative envelope with an explicit message type.
    pub fn answer(message_type: MessageType, content: impl Into<String>) -> Self {
        Self::Answer(AnswerMessage {
            message_type,
            content: content.into(),
        })
    }

    /// `ANSWER/continue` envelope.
    pub fn text(content: impl Into<String>) -> Self {
        Self::answer(MessageType::Continue, content)
    }

    /// `ANSWER/info` envelope.
    pub fn info(content: impl Into<String>) -> Self {
        Self::answer(MessageType::Info, content)
    }

    /// `ANSWER/error` envelope.
    pub fn error(content: impl Into<String>) -> Self {
        Self::answer(MessageType::Error, content)
    }

    /// `BUSINESS_DATA` envelope.
    pub fn business(data: serde_json::Value) -> Self {
        Self::BusinessData(data)
    }

    /// Classification of this envelope.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Answer(_) => DataType::Answer,
            Self::BusinessData(_) => DataType::BusinessData,
            Self::StreamEnd => DataType::StreamEnd,
        }
    }

    /// Text content when this is an `ANSWER` envelope.
    pub fn answer_content(&self) -> Option<&str> {
        match self {
            Self::Answer(msg) => Some(&msg.content),
            _ => None,
        }
    }

    /// Whether this is the terminator.
    pub fn is_stream_end(&self) -> bool {
        matches!(self, Self::StreamEnd)
    }
}

/// Encode one envelope as a text-event frame.
pub fn encode_frame(envelope: &OutputEnvelope) -> Result<String> {
    let json = serde_json::to_string(envelope)?;
    Ok(format!("{FRAME_PREFIX}{json}{FRAME_SUFFIX}"))
}

/// Encode one envelope as a frame ready for a byte channel.
pub fn encode_frame_bytes(envelope: &OutputEnvelope) -> Result<Bytes> {
    encode_frame(envelope).map(Bytes::from)
}

/// Parse one frame back into an envelope.
///
/// Accepts the frame with or without its trailing blank line, and with an
/// optional space after `data:`.
pub fn decode_frame(frame: &str) -> Result<OutputEnvelope> {
    let body = frame
        .trim_end_matches('\n')
        .strip_prefix(FRAME_PREFIX)
        .ok_or_else(|| StreamError::Serialization(format!("frame must start with '{FRAME_PREFIX}'")))?;
    Ok(serde_json::from_str(body.trim_start())?)
}
