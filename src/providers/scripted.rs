//! Deterministic in-process capability providers.
//!
//! These stand in for real inference backends in the demo binary and in
//! tests: they honour the provider contracts (blocking calls, fallible
//! loads) but produce predictable output.

use crate::models::{
    ChatCompletion, ChatModel, ChatPrompt, Detection, Detector, LoadedModel, ModelKind,
    ModelProvider, PersonStatus, StatusAnalyzer, SynthesizedAudio, Synthesizer, TranscribeParams,
    Transcriber, Transcript,
};
use crate::{Result, SellerError};
use std::f32::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Take one failure from a countdown, returning true if the call should fail
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Provider that hands out a prebuilt model, optionally slowly or after
/// a number of failed attempts
pub struct StaticProvider {
    name: String,
    model: LoadedModel,
    delay: Duration,
    failures_left: AtomicUsize,
    loads: AtomicUsize,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>, model: LoadedModel) -> Self {
        Self {
            name: name.into(),
            model,
            delay: Duration::ZERO,
            failures_left: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every load
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` loads
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Number of times `load` has been called
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelProvider for StaticProvider {
    fn kind(&self) -> ModelKind {
        self.model.kind()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<LoadedModel> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{} load attempt {}", self.name, attempt);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if take_failure(&self.failures_left) {
            return Err(SellerError::ModelLoad {
                kind: self.kind(),
                cause: format!("{} failed to initialize", self.name),
            });
        }
        Ok(self.model.clone())
    }
}

/// Reveals a fixed transcript in proportion to the audio it is given
pub struct ScriptedTranscriber {
    words: Vec<String>,
    words_per_sec: f32,
}

impl ScriptedTranscriber {
    pub fn new(transcript: &str) -> Self {
        Self {
            words: transcript.split_whitespace().map(str::to_string).collect(),
            words_per_sec: 4.0,
        }
    }

    pub fn with_words_per_sec(mut self, words_per_sec: f32) -> Self {
        self.words_per_sec = words_per_sec.max(0.1);
        self
    }
}

impl Transcriber for ScriptedTranscriber {
    fn transcribe(&self, audio: &[f32], params: &TranscribeParams) -> Result<Transcript> {
        if params.sample_rate == 0 {
            return Err(SellerError::InferenceFailure("sample rate is zero".to_string()));
        }
        if audio.is_empty() {
            return Ok(Transcript {
                text: String::new(),
                confidence: Some(0.0),
            });
        }

        let secs = audio.len() as f32 / params.sample_rate as f32;
        let count = ((secs * self.words_per_sec).ceil() as usize).clamp(1, self.words.len().max(1));
        let text = self.words.iter().take(count).cloned().collect::<Vec<_>>().join(" ");
        let confidence = count as f32 / self.words.len().max(1) as f32;
        Ok(Transcript {
            text,
            confidence: Some(0.5 + confidence.min(1.0) * 0.45),
        })
    }
}

/// Synthesizes a sine tone whose length follows the text length
pub struct ToneSynthesizer {
    sample_rate: u32,
    secs_per_char: f32,
    frequency: f32,
    fail_on: Option<String>,
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            secs_per_char: 0.01,
            frequency: 220.0,
            fail_on: None,
        }
    }
}

impl ToneSynthesizer {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Fail any unit containing `word`
    pub fn failing_on(mut self, word: impl Into<String>) -> Self {
        self.fail_on = Some(word.into());
        self
    }
}

impl Synthesizer for ToneSynthesizer {
    fn synthesize(&self, text: &str, _language: &str) -> Result<SynthesizedAudio> {
        if let Some(word) = &self.fail_on {
            if text.contains(word.as_str()) {
                return Err(SellerError::InferenceFailure(format!(
                    "synthesizer rejected '{}'",
                    text
                )));
            }
        }

        let len = (text.chars().count() as f32 * self.secs_per_char * self.sample_rate as f32) as usize;
        let samples = (0..len.max(1))
            .map(|i| 0.3 * (2.0 * PI * self.frequency * i as f32 / self.sample_rate as f32).sin())
            .collect();
        Ok(SynthesizedAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// Returns a fixed list of detections for any asset
pub struct ScriptedDetector {
    detections: Vec<Detection>,
    delay: Duration,
    failures_left: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            delay: Duration::ZERO,
            failures_left: AtomicUsize::new(0),
        }
    }

    /// A few shoppers walking through frame
    pub fn shoppers() -> Self {
        let mut detections = Vec::new();
        for frame in 0..30 {
            detections.push(Detection {
                frame,
                track_id: 1,
                confidence: 0.9,
            });
            if frame >= 10 {
                detections.push(Detection {
                    frame,
                    track_id: 2,
                    confidence: 0.6,
                });
            }
            if frame % 3 == 0 {
                detections.push(Detection {
                    frame,
                    track_id: 3,
                    confidence: 0.3,
                });
            }
        }
        Self::new(detections)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }
}

impl Detector for ScriptedDetector {
    fn detect(&self, source: &Path, _confidence_threshold: f32) -> Result<Vec<Detection>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if take_failure(&self.failures_left) {
            return Err(SellerError::InferenceFailure(format!(
                "could not decode video {:?}",
                source
            )));
        }
        Ok(self.detections.clone())
    }
}

/// Builds a short reply around what the customer said
#[derive(Default)]
pub struct TemplateChatModel;

impl TemplateChatModel {
    fn customer_words(prompt: &ChatPrompt) -> &str {
        prompt
            .user
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix("Customer said: "))
            .map(|quoted| quoted.trim_matches('"'))
            .unwrap_or(prompt.user.as_str())
    }
}

impl ChatModel for TemplateChatModel {
    fn generate(&self, prompt: &ChatPrompt) -> Result<ChatCompletion> {
        let said = Self::customer_words(prompt).trim();
        if said.is_empty() {
            return Err(SellerError::InferenceFailure("empty prompt".to_string()));
        }
        let text = if prompt.history.is_empty() {
            format!("Happy to help! You asked: {}. Let me find that for you.", said)
        } else {
            format!("Of course. About \"{}\", I'll check that right away.", said)
        };
        Ok(ChatCompletion {
            text,
            confidence: None,
        })
    }
}

/// Always reports the same customer status
pub struct FixedStatusAnalyzer {
    status: PersonStatus,
}

impl FixedStatusAnalyzer {
    pub fn new(status: PersonStatus) -> Self {
        Self { status }
    }
}

impl Default for FixedStatusAnalyzer {
    fn default() -> Self {
        Self::new(PersonStatus {
            mood: "happy".to_string(),
            gender: "male".to_string(),
            age: 30,
            confidence: 0.82,
        })
    }
}

impl StatusAnalyzer for FixedStatusAnalyzer {
    fn analyze(&self, frame: &[u8]) -> Result<PersonStatus> {
        if frame.is_empty() {
            return Err(SellerError::InvalidParameters("empty camera frame".to_string()));
        }
        Ok(self.status.clone())
    }
}
