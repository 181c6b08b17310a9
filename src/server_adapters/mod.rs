//! Server adapters: expose the run driver over HTTP
//!
//! Framework-agnostic pieces live here: request/response bodies, bearer
//! token extraction and the frame stream feeding a response body. The Axum
//! router is behind the `server-adapters` feature.
//!
//! ## Example (Axum)
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepstream::server_adapters::axum::{AppState, router};
//!
//! let app = router(AppState::new(Arc::new(driver)));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! ```

use std::convert::Infallible;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::driver::RunRequest;
use crate::engine::Attachment;
use crate::registry::RunInfo;

#[cfg(feature = "server-adapters")]
pub mod axum;

/// Response header carrying the id of a started run.
pub const RUN_ID_HEADER: &str = "x-run-id";

/// JSON body of `POST /runs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunPayload {
    /// User question
    pub query: String,
    /// Conversation id
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Question/answer record id
    #[serde(default)]
    pub record_id: Option<String>,
    /// Data source to query
    #[serde(default)]
    pub datasource_id: Option<i64>,
    /// Attached files
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Free-form extras persisted with the transcript
    #[serde(default)]
    pub extras: Map<String, Value>,
}

impl RunPayload {
    /// Combine with the caller's credential into a driver request.
    pub fn into_request(self, token: SecretString) -> RunRequest {
        RunRequest {
            query: self.query,
            token,
            chat_id: self.chat_id,
            record_id: self.record_id,
            datasource_id: self.datasource_id,
            attachments: self.attachments,
            extras: self.extras,
        }
    }
}

/// Body of `POST /runs/{run_id}/cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Whether an active run was found and flagged
    pub cancelled: bool,
}

/// Body of `POST /runs/cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOwnerResponse {
    /// Number of runs flagged
    pub cancelled: usize,
}

/// Body of `GET /runs`.
#[derive(Debug, Clone, Serialize)]
pub struct RunsResponse {
    /// The caller's active runs, ordered by id
    pub runs: Vec<RunInfo>,
}

/// Extract the credential from an `Authorization` header value.
///
/// Accepts `Bearer <token>` (scheme case-insensitive). A bare token is
/// accepted as well; an empty one is not.
pub fn bearer_token(header: &str) -> Option<SecretString> {
    let header = header.trim();
    let token = match header.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        Some(_) => return None,
        None => header,
    };
    if token.is_empty() {
        None
    } else {
        Some(SecretString::from(token.to_string()))
    }
}

/// Turn the driver's frame channel into a response body stream.
///
/// Ends when the driver drops its sender, i.e. after `STREAM_END`.
pub fn frame_stream(
    mut rx: mpsc::Receiver<Bytes>,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, Infallible>> + Send>> {
    let s = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            yield Ok(frame);
        }
    };
    Box::pin(s)
}
