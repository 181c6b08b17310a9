//! Run driver
//!
//! Owns the lifecycle of one run:
//!
//! ```text
//! INIT -> STREAMING -> { CANCELLED | COMPLETED | FAILED } -> CLOSED
//! ```
//!
//! INIT decodes the caller, builds the pipeline input and registers the run.
//! STREAMING pulls engine events one at a time and re-checks the cancel flag
//! before processing each of them. Every terminal state ends with exactly one
//! `STREAM_END` frame, and CLOSED (deregistration) runs on every exit path
//! through a `RunGuard`.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use secrecy::SecretString;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::AggregatorConfig;
use crate::engine::{
    Attachment, AttachmentReader, EngineCapabilities, EngineEvent, PipelineInput, StepEngine,
    StepEvent, query_with_reference,
};
use crate::envelope::OutputEnvelope;
use crate::error::{Result, StreamError};
use crate::identity::{Identity, IdentityDecoder};
use crate::registry::{RunGuard, RunHandle, RunId, RunRegistry};
use crate::resolver::{BusinessBuffer, StepContent, StepResolver};
use crate::section::SectionTracker;
use crate::sink::{ChannelSink, EnvelopeSink};
use crate::transcript::{RunContext, TranscriptRecord, TranscriptStore, business_record};

/// One client request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// User question
    pub query: String,
    /// Caller credential
    pub token: SecretString,
    /// Conversation id
    pub chat_id: Option<String>,
    /// Client-supplied id of this question/answer record
    pub record_id: Option<String>,
    /// Data source to query
    pub datasource_id: Option<i64>,
    /// Files whose text is appended to the query
    pub attachments: Vec<Attachment>,
    /// Free-form extras persisted with the transcript
    pub extras: Map<String, Value>,
}

impl RunRequest {
    /// Request with only a query and a credential.
    pub fn new(query: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            token: SecretString::from(token.into()),
            chat_id: None,
            record_id: None,
            datasource_id: None,
            attachments: Vec::new(),
            extras: Map::new(),
        }
    }

    /// Set the conversation id.
    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Set the record id.
    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Set the data source.
    pub fn with_datasource(mut self, datasource_id: i64) -> Self {
        self.datasource_id = Some(datasource_id);
        self
    }

    /// Attach files.
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Terminal state a run reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// INIT failed; streaming never started.
    Rejected,
    /// The step sequence was exhausted without cancellation.
    Completed,
    /// A stop was requested and observed.
    Cancelled,
    /// The engine failed, a payload was malformed, or the client went away.
    Failed,
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run id, absent when INIT failed before registration
    pub run_id: Option<RunId>,
    /// Terminal state
    pub outcome: RunOutcome,
    /// Narrative buffer: the content of every `ANSWER` envelope sent
    pub narrative: Vec<String>,
    /// Business buffer
    pub business: Option<Value>,
    /// Failure that ended the run
    pub error: Option<StreamError>,
    /// Whether the transcript store accepted the transcript
    pub persisted: bool,
}

impl RunReport {
    fn rejected(error: StreamError) -> Self {
        Self {
            run_id: None,
            outcome: RunOutcome::Rejected,
            narrative: Vec::new(),
            business: None,
            error: Some(error),
            persisted: false,
        }
    }
}

/// A registered run whose streaming has not started.
#[derive(Debug)]
pub struct PreparedRun {
    handle: RunHandle,
    guard: RunGuard,
    input: PipelineInput,
}

impl PreparedRun {
    /// Registry handle of the run.
    pub fn handle(&self) -> &RunHandle {
        &self.handle
    }

    /// Input the engine will receive.
    pub fn input(&self) -> &PipelineInput {
        &self.input
    }
}

/// How the streaming loop ended.
enum Exit {
    Exhausted,
    Cancelled,
    Failed(StreamError),
}

/// Per-run working state. Owned by one driver task, never shared.
struct RunState<'a> {
    config: &'a AggregatorConfig,
    resolver: &'a StepResolver,
    sections: SectionTracker,
    narrative: Vec<String>,
    business: BusinessBuffer,
}

impl<'a> RunState<'a> {
    fn new(config: &'a AggregatorConfig, resolver: &'a StepResolver) -> Self {
        Self {
            config,
            resolver,
            sections: SectionTracker::new(config.show_sections),
            narrative: Vec::new(),
            business: BusinessBuffer::new(),
        }
    }

    async fn emit<S: EnvelopeSink>(&mut self, sink: &mut S, envelope: OutputEnvelope) -> Result<()> {
        sink.send(&envelope).await?;
        if let OutputEnvelope::Answer(msg) = envelope {
            self.narrative.push(msg.content);
        }
        Ok(())
    }

    async fn close_section<S: EnvelopeSink>(&mut self, sink: &mut S) -> Result<()> {
        if let Some(action) = self.sections.close() {
            self.emit(sink, OutputEnvelope::text(action.markup())).await?;
        }
        Ok(())
    }

    async fn process<S: EnvelopeSink>(&mut self, sink: &mut S, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Text { text } => {
                self.close_section(sink).await?;
                self.emit(sink, OutputEnvelope::text(text)).await?;
            }
            EngineEvent::Step(step) => self.process_step(sink, step).await?,
        }
        sink.flush().await
    }

    async fn process_step<S: EnvelopeSink>(&mut self, sink: &mut S, step: StepEvent) -> Result<()> {
        let terminal = self.resolver.is_terminal(&step.name);
        for action in self.sections.enter(&step.name, terminal) {
            self.emit(sink, OutputEnvelope::text(action.markup())).await?;
        }

        match self.resolver.resolve(&step)? {
            StepContent::Nothing => {}
            StepContent::Narrative {
                text,
                always_forwarded,
            } => {
                if always_forwarded || self.config.show_sections {
                    self.emit(sink, OutputEnvelope::text(text)).await?;
                }
            }
            StepContent::Business(data) => {
                self.business.replace(data.clone());
                self.emit(sink, OutputEnvelope::business(data)).await?;
            }
            StepContent::Enrichment(items) => {
                let count = items.len();
                let key = self.config.recommendation_key.as_str();
                match self.business.merge(key, items).cloned() {
                    Some(updated) => {
                        debug!(step = %step.name, count, "merged recommendations into business data");
                        self.emit(sink, OutputEnvelope::business(updated)).await?;
                    }
                    None => {
                        warn!(step = %step.name, count, "no business data to enrich, dropping recommendations");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Drives runs end to end.
pub struct RunDriver {
    registry: Arc<RunRegistry>,
    identity: Arc<dyn IdentityDecoder>,
    engine: Arc<dyn StepEngine>,
    store: Arc<dyn TranscriptStore>,
    attachments: Option<Arc<dyn AttachmentReader>>,
    resolver: StepResolver,
    config: AggregatorConfig,
    capabilities: EngineCapabilities,
}

impl std::fmt::Debug for RunDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunDriver")
            .field("config", &self.config)
            .field("capabilities", &self.capabilities)
            .field("active_runs", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl RunDriver {
    /// Create a new builder.
    pub fn builder() -> RunDriverBuilder {
        RunDriverBuilder::default()
    }

    /// Shared run registry.
    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Configuration in use.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Request cancellation of one run.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        self.registry.cancel(run_id)
    }

    /// Request cancellation of one run on behalf of `owner`.
    ///
    /// Runs started by someone else are left alone and reported as not found.
    pub fn cancel_owned(&self, run_id: &RunId, owner: &str) -> bool {
        self.registry.cancel_owned(run_id, owner)
    }

    /// Request cancellation of every run of one caller.
    pub fn cancel_owner(&self, owner: &str) -> usize {
        self.registry.cancel_owner(owner)
    }

    /// Ids of all active runs.
    pub fn list_active_runs(&self) -> std::collections::BTreeSet<RunId> {
        self.registry.list_active()
    }

    /// Decode a caller credential.
    pub async fn authenticate(&self, token: &SecretString) -> Result<Identity> {
        self.identity.decode(token).await
    }

    /// INIT: decode the caller, build the pipeline input, register the run.
    pub async fn prepare(&self, request: &RunRequest) -> Result<PreparedRun> {
        let identity = self.authenticate(&request.token).await?;

        let mut query = request.query.clone();
        if !request.attachments.is_empty() {
            match &self.attachments {
                Some(reader) => {
                    let markdown = reader.read_as_markdown(&request.attachments).await?;
                    query = query_with_reference(&query, &markdown);
                }
                None => warn!(
                    count = request.attachments.len(),
                    "no attachment reader configured, ignoring attachments"
                ),
            }
        }

        let tools = if self.capabilities.accepts_tools {
            self.config.allowed_tools.clone()
        } else {
            Vec::new()
        };

        let input = PipelineInput {
            query,
            owner: identity.id.clone(),
            datasource_id: request.datasource_id,
            chat_id: request.chat_id.clone(),
            tools,
        };

        let handle = self.registry.register_new(identity.id);
        let guard = self.registry.guard(handle.id().clone());
        Ok(PreparedRun {
            handle,
            guard,
            input,
        })
    }

    /// Drive one request to completion, writing every frame to `sink`.
    ///
    /// An INIT failure is reported as one error envelope plus `STREAM_END`.
    pub async fn run<S: EnvelopeSink>(&self, request: RunRequest, sink: &mut S) -> RunReport {
        match self.prepare(&request).await {
            Ok(prepared) => self.stream(prepared, &request, sink).await,
            Err(err) => {
                warn!(error = %err, "run rejected before streaming");
                let message = self.config.failure_message(&err);
                let written = async {
                    sink.send(&OutputEnvelope::error(message)).await?;
                    sink.send(&OutputEnvelope::StreamEnd).await?;
                    sink.flush().await
                };
                if let Err(e) = written.await {
                    debug!(error = %e, "could not report rejection to client");
                }
                RunReport::rejected(err)
            }
        }
    }

    /// Register a run and drive it on a background task.
    ///
    /// The run is registered before this returns, so the id can be cancelled
    /// immediately. Frames arrive on the returned receiver.
    pub async fn spawn(
        self: &Arc<Self>,
        request: RunRequest,
    ) -> Result<(RunId, mpsc::Receiver<Bytes>)> {
        let prepared = self.prepare(&request).await?;
        let run_id = prepared.handle.id().clone();
        let (mut sink, rx) = ChannelSink::channel(self.config.channel_capacity);
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            driver.stream(prepared, &request, &mut sink).await;
        });
        Ok((run_id, rx))
    }

    /// STREAMING through CLOSED for a prepared run.
    pub async fn stream<S: EnvelopeSink>(
        &self,
        prepared: PreparedRun,
        request: &RunRequest,
        sink: &mut S,
    ) -> RunReport {
        let span = info_span!(
            "run",
            run_id = %prepared.handle.id(),
            owner = %prepared.handle.owner()
        );
        self.stream_inner(prepared, request, sink)
            .instrument(span)
            .await
    }

    async fn stream_inner<S: EnvelopeSink>(
        &self,
        prepared: PreparedRun,
        request: &RunRequest,
        sink: &mut S,
    ) -> RunReport {
        // Dropping the guard at the end of this function is the CLOSED state.
        let PreparedRun {
            handle,
            guard: _guard,
            input,
        } = prepared;
        let mut state = RunState::new(&self.config, &self.resolver);
        info!("run started");

        let exit = match self.engine.start(input).await {
            Err(err) => Exit::Failed(err),
            Ok(mut events) => loop {
                let next = events.next().await;
                if handle.is_cancelled() {
                    break Exit::Cancelled;
                }
                match next {
                    None => break Exit::Exhausted,
                    Some(Err(err)) => break Exit::Failed(err),
                    Some(Ok(event)) => {
                        if let Err(err) = state.process(sink, event).await {
                            break Exit::Failed(err);
                        }
                    }
                }
            },
        };

        let mut report = RunReport {
            run_id: Some(handle.id().clone()),
            outcome: RunOutcome::Completed,
            narrative: Vec::new(),
            business: None,
            error: None,
            persisted: false,
        };

        match exit {
            Exit::Cancelled => {
                report.outcome = RunOutcome::Cancelled;
                info!("run cancelled");
                let stopped = self.config.stopped_message.clone();
                let written = async {
                    state.close_section(sink).await?;
                    state.emit(sink, OutputEnvelope::info(stopped)).await?;
                    sink.send(&OutputEnvelope::StreamEnd).await?;
                    sink.flush().await
                };
                if let Err(e) = written.await {
                    debug!(error = %e, "could not deliver stop notice");
                }
            }
            Exit::Failed(err) => {
                report.outcome = RunOutcome::Failed;
                if err.is_client_visible() {
                    error!(error = %err, "run failed");
                    let message = self.config.failure_message(&err);
                    let written = async {
                        state.close_section(sink).await?;
                        state.emit(sink, OutputEnvelope::error(message)).await?;
                        sink.send(&OutputEnvelope::StreamEnd).await?;
                        sink.flush().await
                    };
                    if let Err(e) = written.await {
                        debug!(error = %e, "could not deliver failure notice");
                    }
                } else {
                    warn!(error = %err, "run aborted, client unreachable");
                }
                report.error = Some(err);
            }
            Exit::Exhausted => {
                let written = async {
                    state.close_section(sink).await?;
                    sink.send(&OutputEnvelope::StreamEnd).await?;
                    sink.flush().await
                };
                let finished = written.await;
                match finished {
                    Ok(()) => {
                        report.persisted = self.persist(&handle, request, &state).await;
                        info!(persisted = report.persisted, "run completed");
                    }
                    Err(err) => {
                        warn!(error = %err, "client went away while finishing run");
                        report.outcome = RunOutcome::Failed;
                        report.error = Some(err);
                    }
                }
            }
        }

        report.narrative = state.narrative;
        report.business = state.business.get().cloned();
        report
    }

    async fn persist(&self, handle: &RunHandle, request: &RunRequest, state: &RunState<'_>) -> bool {
        let record = TranscriptRecord {
            context: RunContext {
                run_id: handle.id().clone(),
                owner: handle.owner().to_string(),
                record_id: request.record_id.clone(),
                chat_id: request.chat_id.clone(),
                query: request.query.clone(),
            },
            narrative: state.narrative.clone(),
            business: business_record(state.business.get()),
            intent_kind: self.config.intent_kind.clone(),
            token: request.token.clone(),
            extras: request.extras.clone(),
            datasource_id: request.datasource_id,
            finished_at: Utc::now(),
        };
        match self.store.save(record).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "failed to save transcript");
                false
            }
        }
    }
}

/// Builder for `RunDriver`.
#[derive(Default)]
pub struct RunDriverBuilder {
    registry: Option<Arc<RunRegistry>>,
    identity: Option<Arc<dyn IdentityDecoder>>,
    engine: Option<Arc<dyn StepEngine>>,
    store: Option<Arc<dyn TranscriptStore>>,
    attachments: Option<Arc<dyn AttachmentReader>>,
    resolver: Option<StepResolver>,
    config: Option<AggregatorConfig>,
}

impl RunDriverBuilder {
    /// Share an existing registry.
    pub fn registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the identity decoder.
    pub fn identity(mut self, identity: Arc<dyn IdentityDecoder>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the engine.
    pub fn engine(mut self, engine: Arc<dyn StepEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the transcript store.
    pub fn store(mut self, store: Arc<dyn TranscriptStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the attachment reader.
    pub fn attachments(mut self, reader: Arc<dyn AttachmentReader>) -> Self {
        self.attachments = Some(reader);
        self
    }

    /// Replace the step rule table.
    pub fn resolver(mut self, resolver: StepResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: AggregatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the driver. Engine capabilities are resolved here, once.
    pub fn build(self) -> Result<RunDriver> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let identity = self
            .identity
            .ok_or_else(|| StreamError::Config("identity decoder is required".to_string()))?;
        let engine = self
            .engine
            .ok_or_else(|| StreamError::Config("step engine is required".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| StreamError::Config("transcript store is required".to_string()))?;
        let capabilities = engine.capabilities();

        Ok(RunDriver {
            registry: self.registry.unwrap_or_default(),
            identity,
            engine,
            store,
            attachments: self.attachments,
            resolver: self.resolver.unwrap_or_default(),
            config,
            capabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepStream;
    use crate::resolver::StepRule;
    use crate::section::SECTION_CLOSE;
    use crate::sink::MemorySink;
    use crate::transcript::MemoryTranscriptStore;
    use async_trait::async_trait;
    use futures::stream;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use tracing_test::traced_test;

    struct TokenIsId;

    #[async_trait]
    impl IdentityDecoder for TokenIsId {
        async fn decode(&self, token: &SecretString) -> Result<Identity> {
            match token.expose_secret() {
                "" => Err(StreamError::Auth("empty token".into())),
                id => Ok(Identity::new(id)),
            }
        }
    }

    struct Scripted(Vec<EngineEvent>);

    #[async_trait]
    impl StepEngine for Scripted {
        async fn start(&self, _input: PipelineInput) -> Result<StepStream> {
            Ok(Box::pin(stream::iter(self.0.clone().into_iter().map(Ok))))
        }
    }

    fn driver(events: Vec<EngineEvent>) -> (RunDriver, Arc<MemoryTranscriptStore>) {
        let store = Arc::new(MemoryTranscriptStore::new());
        let driver = RunDriver::builder()
            .identity(Arc::new(TokenIsId))
            .engine(Arc::new(Scripted(events)))
            .store(store.clone())
            .build()
            .unwrap();
        (driver, store)
    }

    #[tokio::test]
    async fn completed_run_ends_with_single_stream_end() {
        let (driver, store) = driver(vec![
            EngineEvent::step("sql_generator", json!({"generated_sql": "SELECT 1"})),
            EngineEvent::step("summarize", json!({"report_summary": "one row"})),
        ]);
        let mut sink = MemorySink::new();
        let report = driver.run(RunRequest::new("q", "alice"), &mut sink).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        let envelopes = sink.envelopes().unwrap();
        assert_eq!(envelopes.iter().filter(|e| e.is_stream_end()).count(), 1);
        assert!(envelopes.last().unwrap().is_stream_end());
        assert!(report.persisted);
        assert_eq!(store.len(), 1);
        assert!(driver.list_active_runs().is_empty());
    }

    #[tokio::test]
    async fn engine_capabilities_gate_tools() {
        struct ToolEngine;

        #[async_trait]
        impl StepEngine for ToolEngine {
            fn capabilities(&self) -> EngineCapabilities {
                EngineCapabilities {
                    accepts_tools: true,
                }
            }

            async fn start(&self, _input: PipelineInput) -> Result<StepStream> {
                Ok(Box::pin(stream::empty()))
            }
        }

        let config = AggregatorConfig::builder()
            .allowed_tools(["Read"])
            .build()
            .unwrap();

        let with_tools = RunDriver::builder()
            .identity(Arc::new(TokenIsId))
            .engine(Arc::new(ToolEngine))
            .store(Arc::new(MemoryTranscriptStore::new()))
            .config(config.clone())
            .build()
            .unwrap();
        let prepared = with_tools.prepare(&RunRequest::new("q", "alice")).await.unwrap();
        assert_eq!(prepared.input().tools, vec!["Read"]);

        let without_tools = RunDriver::builder()
            .identity(Arc::new(TokenIsId))
            .engine(Arc::new(Scripted(vec![])))
            .store(Arc::new(MemoryTranscriptStore::new()))
            .config(config)
            .build()
            .unwrap();
        let prepared = without_tools.prepare(&RunRequest::new("q", "alice")).await.unwrap();
        assert!(prepared.input().tools.is_empty());
    }

    #[tokio::test]
    async fn dropped_prepared_run_is_deregistered() {
        let (driver, _) = driver(vec![]);
        let prepared = driver.prepare(&RunRequest::new("q", "alice")).await.unwrap();
        let id = prepared.handle().id().clone();
        assert!(driver.registry().contains(&id));
        drop(prepared);
        assert!(!driver.registry().contains(&id));
    }

    #[tokio::test]
    async fn custom_summary_step_closes_without_opening() {
        let driver = RunDriver::builder()
            .identity(Arc::new(TokenIsId))
            .engine(Arc::new(Scripted(vec![
                EngineEvent::step("sql_generator", json!({"generated_sql": "SELECT 1"})),
                EngineEvent::step("final_answer", json!({"report_summary": "done"})),
            ])))
            .store(Arc::new(MemoryTranscriptStore::new()))
            .resolver(StepResolver::default().with_rule("final_answer", StepRule::Summary))
            .build()
            .unwrap();
        let mut sink = MemorySink::new();
        let report = driver.run(RunRequest::new("q", "alice"), &mut sink).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        let envelopes = sink.envelopes().unwrap();
        assert_eq!(
            envelopes[1..],
            [
                OutputEnvelope::text("SELECT 1"),
                OutputEnvelope::text(SECTION_CLOSE),
                OutputEnvelope::text("done"),
                OutputEnvelope::StreamEnd,
            ]
        );
        assert!(envelopes[0].answer_content().unwrap().starts_with("<details"));
    }

    #[tokio::test]
    #[traced_test]
    async fn early_enrichment_is_logged_and_dropped() {
        let (driver, _) = driver(vec![EngineEvent::step(
            "question_recommender",
            json!({"recommended_questions": ["q1"]}),
        )]);
        let mut sink = MemorySink::new();
        let report = driver.run(RunRequest::new("q", "alice"), &mut sink).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(logs_contain("dropping recommendations"));
    }

    #[test]
    fn builder_requires_collaborators() {
        let err = RunDriver::builder().build().unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }
}
