//! Shared fakes for driver and router tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use stepstream::prelude::*;
use tokio::sync::Notify;

/// One scripted engine action.
#[derive(Clone)]
pub enum Script {
    /// Yield an event
    Event(EngineEvent),
    /// Yield an error and stop
    Fail(StreamError),
    /// Wait until notified
    WaitFor(Arc<Notify>),
    /// Cancel every run of the caller, as a concurrent stop request would
    CancelOwner(Arc<RunRegistry>),
}

/// Engine replaying a fixed script.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Vec<Script>,
    start_error: Option<StreamError>,
    accepts_tools: bool,
    last_input: Mutex<Option<PipelineInput>>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Engine yielding `events` in order.
    pub fn events(events: Vec<EngineEvent>) -> Self {
        Self::new(events.into_iter().map(Script::Event).collect())
    }

    /// Engine failing before producing a stream.
    pub fn failing_start(err: StreamError) -> Self {
        Self {
            start_error: Some(err),
            ..Self::default()
        }
    }

    pub fn with_tools(mut self) -> Self {
        self.accepts_tools = true;
        self
    }

    /// Input of the most recent start, if any.
    pub fn last_input(&self) -> Option<PipelineInput> {
        self.last_input.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepEngine for ScriptedEngine {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            accepts_tools: self.accepts_tools,
        }
    }

    async fn start(&self, input: PipelineInput) -> Result<StepStream> {
        *self.last_input.lock().unwrap() = Some(input.clone());
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }

        let script = self.script.clone();
        let owner = input.owner;
        let s = async_stream::stream! {
            for item in script {
                match item {
                    Script::Event(event) => {
                        yield Ok(event);
                    }
                    Script::Fail(err) => {
                        yield Err(err);
                        break;
                    }
                    Script::WaitFor(gate) => gate.notified().await,
                    Script::CancelOwner(registry) => {
                        registry.cancel_owner(&owner);
                    }
                }
            }
        };
        Ok(Box::pin(s))
    }
}

/// Accepts any non-empty token except `expired`; the token is the caller id.
pub struct TokenIdentity;

#[async_trait]
impl IdentityDecoder for TokenIdentity {
    async fn decode(&self, token: &SecretString) -> Result<Identity> {
        match token.expose_secret() {
            "" => Err(StreamError::Auth("missing token".into())),
            "expired" => Err(StreamError::Auth("token expired".into())),
            id => Ok(Identity::new(id)),
        }
    }
}

/// Store that always fails.
pub struct FailingStore;

#[async_trait]
impl TranscriptStore for FailingStore {
    async fn save(&self, _record: TranscriptRecord) -> Result<()> {
        Err(StreamError::Persistence("database unavailable".into()))
    }
}

/// Reader returning the same markdown for any attachment list.
pub struct FixedReader(pub String);

#[async_trait]
impl AttachmentReader for FixedReader {
    async fn read_as_markdown(&self, _attachments: &[Attachment]) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Driver wired to fakes, with handles to inspect afterwards.
pub struct Harness {
    pub driver: Arc<RunDriver>,
    pub engine: Arc<ScriptedEngine>,
    pub store: Arc<MemoryTranscriptStore>,
    pub registry: Arc<RunRegistry>,
}

impl Harness {
    pub fn new(engine: ScriptedEngine, config: AggregatorConfig) -> Self {
        Self::with_registry(Arc::new(RunRegistry::new()), engine, config)
    }

    pub fn with_registry(
        registry: Arc<RunRegistry>,
        engine: ScriptedEngine,
        config: AggregatorConfig,
    ) -> Self {
        let engine = Arc::new(engine);
        let store = Arc::new(MemoryTranscriptStore::new());
        let driver = RunDriver::builder()
            .registry(registry.clone())
            .identity(Arc::new(TokenIdentity))
            .engine(engine.clone())
            .store(store.clone())
            .config(config)
            .build()
            .unwrap();
        Self {
            driver: Arc::new(driver),
            engine,
            store,
            registry,
        }
    }
}

/// Config with sections hidden.
pub fn quiet_config() -> AggregatorConfig {
    AggregatorConfig::builder()
        .show_sections(false)
        .build()
        .unwrap()
}

/// Text of every `ANSWER` envelope, in order.
pub fn answers(envelopes: &[OutputEnvelope]) -> Vec<String> {
    envelopes
        .iter()
        .filter_map(|e| e.answer_content().map(str::to_string))
        .collect()
}

/// Number of `STREAM_END` envelopes.
pub fn stream_ends(envelopes: &[OutputEnvelope]) -> usize {
    envelopes.iter().filter(|e| e.is_stream_end()).count()
}
