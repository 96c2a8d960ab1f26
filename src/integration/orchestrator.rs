//! Orchestrator for the end-to-end shopper interaction
//!
//! Connects all components: Detect -> Greet -> Listen -> Analyze -> Chat -> Speak.
//! Every step is callable on its own with the previous step's output, so a
//! caller can retry a failed step without repeating the ones before it.

use crate::llm::{greeting_text, ChatReply, ChatService, InteractionContext};
use crate::models::{PersonStatus, StatusAnalyzer};
use crate::speech::{
    AudioChunk, ChunkAssembler, ChunkEmitter, SttStreamEvent, SynthesisArtifact, SynthesisRequest,
    TranscriptEvent,
};
use crate::tracking::{JobState, ParamOverrides, TrackingController, TrackingJob};
use crate::utils::perf::{InteractionMetrics, Stopwatch};
use crate::{Result, SellerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Stages of one interaction, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionStep {
    Detect,
    Greet,
    Listen,
    Analyze,
    Chat,
    Speak,
}

impl InteractionStep {
    pub const ALL: [InteractionStep; 6] = [
        InteractionStep::Detect,
        InteractionStep::Greet,
        InteractionStep::Listen,
        InteractionStep::Analyze,
        InteractionStep::Chat,
        InteractionStep::Speak,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionStep::Detect => "detect",
            InteractionStep::Greet => "greet",
            InteractionStep::Listen => "listen",
            InteractionStep::Analyze => "analyze",
            InteractionStep::Chat => "chat",
            InteractionStep::Speak => "speak",
        }
    }
}

impl fmt::Display for InteractionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress events emitted by the orchestrator
#[derive(Debug, Clone)]
pub enum InteractionEvent {
    StepStarted(InteractionStep),

    StepCompleted {
        step: InteractionStep,
        elapsed_ms: u64,
    },

    StepFailed {
        step: InteractionStep,
        error: SellerError,
    },
}

/// Inputs for one full interaction
#[derive(Debug, Clone)]
pub struct InteractionInput {
    /// Uploaded tracking job for the camera footage
    pub job_id: Uuid,

    pub language: String,

    /// The customer's utterance as ordered chunks
    pub audio: Vec<AudioChunk>,

    /// Camera frame used for status analysis
    pub frame: Vec<u8>,

    /// Continue an existing chat session
    pub session_id: Option<Uuid>,
}

/// Outputs of every step of a successful interaction
#[derive(Debug, Clone)]
pub struct InteractionOutcome {
    pub detection: TrackingJob,
    pub greeting: SynthesisArtifact,
    pub transcript: String,
    pub status: PersonStatus,
    pub reply: ChatReply,
    pub speech: SynthesisArtifact,
    pub metrics: InteractionMetrics,
}

pub struct InteractionOrchestrator {
    tracking: Arc<TrackingController>,
    assembler: Arc<ChunkAssembler>,
    emitter: Arc<ChunkEmitter>,
    chat: Arc<ChatService>,
    analyzer: Arc<dyn StatusAnalyzer>,
    events: Option<mpsc::UnboundedSender<InteractionEvent>>,
}

impl InteractionOrchestrator {
    pub fn new(
        tracking: Arc<TrackingController>,
        assembler: Arc<ChunkAssembler>,
        emitter: Arc<ChunkEmitter>,
        chat: Arc<ChatService>,
        analyzer: Arc<dyn StatusAnalyzer>,
    ) -> Self {
        Self {
            tracking,
            assembler,
            emitter,
            chat,
            analyzer,
            events: None,
        }
    }

    /// Report step progress on a channel
    pub fn with_event_sender(mut self, tx: mpsc::UnboundedSender<InteractionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: InteractionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn step<T>(&self, step: InteractionStep, work: impl Future<Output = Result<T>>) -> Result<T> {
        self.emit(InteractionEvent::StepStarted(step));
        debug!("Step {} started", step);
        let stopwatch = Stopwatch::start();

        match work.await {
            Ok(value) => {
                info!("Step {} completed in {}ms", step, stopwatch.elapsed_ms());
                self.emit(InteractionEvent::StepCompleted {
                    step,
                    elapsed_ms: stopwatch.elapsed_ms(),
                });
                Ok(value)
            }
            Err(e) => {
                error!("Step {} failed: {}", step, e);
                let e = e.at_step(step);
                self.emit(InteractionEvent::StepFailed {
                    step,
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }

    /// Run every step in order, stopping at the first failure
    pub async fn run(&self, input: InteractionInput) -> Result<InteractionOutcome> {
        info!("Starting interaction for tracking job {}", input.job_id);

        let mut stopwatch = Stopwatch::start();
        let mut metrics = InteractionMetrics::default();

        let detection = self.detect(input.job_id).await?;
        metrics.record(InteractionStep::Detect, stopwatch.lap());
        let greeting = self.greet(&detection, &input.language).await?;
        metrics.record(InteractionStep::Greet, stopwatch.lap());
        let transcript = self.listen(input.audio).await?;
        metrics.record(InteractionStep::Listen, stopwatch.lap());
        let status = self.analyze(input.frame).await?;
        metrics.record(InteractionStep::Analyze, stopwatch.lap());

        let context = InteractionContext::new(transcript.as_str(), input.language.as_str())
            .with_people_detected(detection.tracks().len())
            .with_status(status.clone());
        let reply = self.converse(input.session_id, &context).await?;
        metrics.record(InteractionStep::Chat, stopwatch.lap());
        let speech = self.speak(&reply, &input.language).await?;
        metrics.record(InteractionStep::Speak, stopwatch.lap());

        info!(
            "Interaction for session {} finished: {}",
            reply.session_id,
            metrics.summary()
        );
        Ok(InteractionOutcome {
            detection,
            greeting,
            transcript,
            status,
            reply,
            speech,
            metrics,
        })
    }

    /// Make sure the footage has been tracked and someone is in it.
    ///
    /// A job that already completed is reused rather than reprocessed.
    pub async fn detect(&self, job_id: Uuid) -> Result<TrackingJob> {
        self.step(InteractionStep::Detect, async {
            let job = self.tracking.get(job_id)?;
            let job = match job.state {
                JobState::Completed => job,
                _ => self.tracking.process(job_id, ParamOverrides::default()).await?,
            };
            if job.tracks().is_empty() {
                return Err(SellerError::InvalidState(format!(
                    "nobody was detected in {}",
                    job.asset.filename
                )));
            }
            Ok(job)
        })
        .await
    }

    pub async fn greet(&self, detection: &TrackingJob, language: &str) -> Result<SynthesisArtifact> {
        self.step(InteractionStep::Greet, async {
            let text = greeting_text(detection.tracks().len(), language);
            self.emitter
                .synthesize(SynthesisRequest::new(
                    text,
                    language,
                    self.emitter.config().default_chunk_size,
                ))
                .await
        })
        .await
    }

    /// Stream the utterance through a fresh transcription stream and return
    /// the final text. A closing chunk is added if the input lacks one.
    pub async fn listen(&self, audio: Vec<AudioChunk>) -> Result<String> {
        self.step(InteractionStep::Listen, async {
            let mut chunks = audio;
            let last = chunks.last().cloned().ok_or_else(|| {
                SellerError::InvalidParameters("no audio chunks to transcribe".to_string())
            })?;
            if !last.is_final {
                let index = last.index.checked_add(1).ok_or_else(|| {
                    SellerError::InvalidParameters(format!(
                        "cannot close an utterance whose last chunk_index is {}",
                        last.index
                    ))
                })?;
                chunks.push(AudioChunk {
                    index,
                    payload: Vec::new(),
                    is_final: true,
                    language: last.language,
                    sample_rate: last.sample_rate,
                });
            }

            let handle = self.assembler.attach(format!("listen-{}", Uuid::new_v4()));
            let sender = handle.chunk_sender();
            tokio::spawn(async move {
                for chunk in chunks {
                    // A closed stream reports its own error event
                    if sender.send(chunk).await.is_err() {
                        break;
                    }
                }
            });

            let mut events = handle.finish_input();
            while let Some(event) = events.recv().await {
                match event {
                    SttStreamEvent::Transcript(TranscriptEvent::Final { text, .. }) => {
                        if text.trim().is_empty() {
                            return Err(SellerError::InvalidParameters(
                                "no speech was recognized".to_string(),
                            ));
                        }
                        return Ok(text);
                    }
                    SttStreamEvent::Transcript(partial) => {
                        debug!("Partial transcript: {}", partial.text());
                    }
                    SttStreamEvent::Error { error, .. } => return Err(error),
                }
            }
            Err(SellerError::InferenceFailure(
                "transcription stream closed without a final transcript".to_string(),
            ))
        })
        .await
    }

    pub async fn analyze(&self, frame: Vec<u8>) -> Result<PersonStatus> {
        self.step(InteractionStep::Analyze, async {
            let analyzer = self.analyzer.clone();
            tokio::task::spawn_blocking(move || analyzer.analyze(&frame))
                .await
                .map_err(|e| SellerError::InferenceFailure(format!("status analysis panicked: {}", e)))?
        })
        .await
    }

    pub async fn converse(
        &self,
        session_id: Option<Uuid>,
        context: &InteractionContext,
    ) -> Result<ChatReply> {
        self.step(InteractionStep::Chat, self.chat.send_with_context(session_id, context))
            .await
    }

    pub async fn speak(&self, reply: &ChatReply, language: &str) -> Result<SynthesisArtifact> {
        self.step(InteractionStep::Speak, async {
            self.emitter
                .synthesize(SynthesisRequest::new(
                    reply.response.as_str(),
                    language,
                    self.emitter.config().default_chunk_size,
                ))
                .await
        })
        .await
    }
}
