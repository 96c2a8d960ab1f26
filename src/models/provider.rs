//! Capability contracts that inference backends implement.
//!
//! Every call here is synchronous and may block for a long time; the registry
//! runs them on the blocking pool.

use crate::messages::Role;
use crate::models::ModelKind;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Parameters fixed for the lifetime of one transcription stream
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeParams {
    pub language: String,
    pub sample_rate: u32,
}

/// Result of decoding an audio buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: Option<f32>,
}

/// Speech to text
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, audio: &[f32], params: &TranscribeParams) -> Result<Transcript>;
}

/// Mono audio produced by a synthesizer
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Text to speech
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str, language: &str) -> Result<SynthesizedAudio>;
}

/// One tracked person observed in one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub frame: u64,
    pub track_id: u32,
    pub confidence: f32,
}

/// Person detection and tracking over a video asset
pub trait Detector: Send + Sync {
    fn detect(&self, source: &Path, confidence_threshold: f32) -> Result<Vec<Detection>>;
}

/// One prior turn fed back to the conversation model
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatPrompt {
    pub system: String,
    pub history: Vec<ChatTurn>,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub text: String,
    pub confidence: Option<f32>,
}

/// Conversational response generation
pub trait ChatModel: Send + Sync {
    fn generate(&self, prompt: &ChatPrompt) -> Result<ChatCompletion>;
}

/// Mood and demographics estimated from a camera frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonStatus {
    pub mood: String,
    pub gender: String,
    pub age: u32,
    pub confidence: f32,
}

/// Status analysis is an external capability and is not owned by the registry
pub trait StatusAnalyzer: Send + Sync {
    fn analyze(&self, frame: &[u8]) -> Result<PersonStatus>;
}

/// A ready model instance, shared behind the registry
#[derive(Clone)]
pub enum LoadedModel {
    Transcriber(Arc<dyn Transcriber>),
    Synthesizer(Arc<dyn Synthesizer>),
    Detector(Arc<dyn Detector>),
    Chat(Arc<dyn ChatModel>),
}

impl LoadedModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            LoadedModel::Transcriber(_) => ModelKind::Transcription,
            LoadedModel::Synthesizer(_) => ModelKind::Synthesis,
            LoadedModel::Detector(_) => ModelKind::Detection,
            LoadedModel::Chat(_) => ModelKind::Conversation,
        }
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoadedModel({})", self.kind())
    }
}

/// Knows how to bring one model kind into memory
pub trait ModelProvider: Send + Sync {
    fn kind(&self) -> ModelKind;

    /// Human readable name used in logs and health reports
    fn name(&self) -> &str;

    /// Blocking load; called at most once per attempt by the registry
    fn load(&self) -> Result<LoadedModel>;
}
