//! # stepstream - step-by-step answer streaming
//!
//! Turns the step sequence of a multi-step question-answering engine into a
//! stream of `data:`-framed JSON envelopes for a client, with cooperative
//! cancellation of in-flight runs and transcript persistence once a run
//! completes.
//!
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ## Pieces
//!
//! - **Envelope codec** (`envelope`): the three envelope kinds and their wire frames
//! - **Run registry** (`registry`): active runs and their cancel flags
//! - **Section rendering** (`section`): collapsible markup around intermediate steps
//! - **Step resolver** (`resolver`): what each step contributes to the stream
//! - **Run driver** (`driver`): the per-run state machine tying it all together
//! - **Collaborators** (`engine`, `identity`, `transcript`): traits the embedding
//!   application implements
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepstream::prelude::*;
//!
//! let driver = RunDriver::builder()
//!     .identity(Arc::new(MyDecoder))
//!     .engine(Arc::new(MyEngine))
//!     .store(Arc::new(MemoryTranscriptStore::new()))
//!     .config(AggregatorConfig::from_env())
//!     .build()?;
//!
//! let mut sink = MemorySink::new();
//! let report = driver.run(RunRequest::new("how many orders?", token), &mut sink).await;
//! ```

pub mod config;
pub mod driver;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod registry;
pub mod resolver;
pub mod section;
pub mod server_adapters;
pub mod sink;
pub mod telemetry;
pub mod transcript;
pub mod utils;

pub use config::AggregatorConfig;
pub use driver::{RunDriver, RunOutcome, RunReport, RunRequest};
pub use envelope::{DataType, MessageType, OutputEnvelope, decode_frame, encode_frame};
pub use error::{Result, StreamError};
pub use registry::{RunId, RunRegistry};

/// Commonly used types.
pub mod prelude {
    pub use crate::config::{AggregatorConfig, AggregatorConfigBuilder};
    pub use crate::driver::{RunDriver, RunDriverBuilder, RunOutcome, RunReport, RunRequest};
    pub use crate::engine::{
        Attachment, AttachmentReader, EngineCapabilities, EngineEvent, PipelineInput,
        StepEngine, StepEvent, StepStream,
    };
    pub use crate::envelope::{
        DataType, MessageType, OutputEnvelope, decode_frame, encode_frame,
    };
    pub use crate::error::{Result, StreamError};
    pub use crate::identity::{Identity, IdentityDecoder};
    pub use crate::registry::{RunHandle, RunId, RunInfo, RunRegistry};
    pub use crate::resolver::{StepResolver, StepRule};
    pub use crate::sink::{ChannelSink, EnvelopeSink, MemorySink};
    pub use crate::transcript::{MemoryTranscriptStore, TranscriptRecord, TranscriptStore};
}
