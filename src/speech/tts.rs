//! Streaming and batch speech synthesis
//!
//! Text is split into ordered units; each unit is synthesized in order and
//! pushed through a bounded channel as one audio chunk. Closing the receiving
//! side stops production after the unit in flight.

use crate::integration::config::TtsConfig;
use crate::models::{ModelKind, ModelRegistry};
use crate::speech::codec::{f32_to_pcm16, pcm16_to_wav};
use crate::speech::segmenter::{SynthesisUnit, TextSegmenter};
use crate::utils::perf::Stopwatch;
use crate::{Result, SellerError};
use futures::Stream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub language: String,
    /// Upper bound, in characters, for one synthesis unit
    pub chunk_size: usize,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, language: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
            chunk_size,
        }
    }
}

/// Events produced by a synthesis stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// PCM16 little-endian mono audio for one unit
    AudioChunk {
        index: u64,
        data: Vec<u8>,
        sample_rate: u32,
    },

    /// All units were delivered
    Complete,

    /// Synthesis stopped early
    Error(SellerError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::AudioChunk { .. })
    }
}

/// Batch synthesis result
#[derive(Debug, Clone)]
pub struct SynthesisArtifact {
    /// 16-bit mono WAV
    pub wav: Vec<u8>,
    pub sample_rate: u32,
    pub duration_secs: f32,
    pub chunks: usize,
    pub processing_time: f64,
}

/// Receiving side of a synthesis stream
pub struct SynthesisStream {
    stream_id: String,
    units: usize,
    rx: mpsc::Receiver<StreamEvent>,
}

impl SynthesisStream {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Number of audio chunks a successful run produces
    pub fn unit_count(&self) -> usize {
        self.units
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Stop production; events already queued can still be drained
    pub fn cancel(&mut self) {
        debug!("Cancelling synthesis stream {}", self.stream_id);
        self.rx.close();
    }

    pub fn into_stream(mut self) -> impl Stream<Item = StreamEvent> {
        async_stream::stream! {
            while let Some(event) = self.rx.recv().await {
                yield event;
            }
        }
    }
}

pub struct ChunkEmitter {
    registry: Arc<ModelRegistry>,
    config: TtsConfig,
}

impl ChunkEmitter {
    pub fn new(registry: Arc<ModelRegistry>, config: TtsConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &TtsConfig {
        &self.config
    }

    /// Request with the configured defaults
    pub fn request(&self, text: impl Into<String>) -> SynthesisRequest {
        SynthesisRequest::new(
            text,
            self.config.default_language.clone(),
            self.config.default_chunk_size,
        )
    }

    fn plan(&self, request: &SynthesisRequest) -> Result<Vec<SynthesisUnit>> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(SellerError::InvalidParameters("text must not be empty".to_string()));
        }
        let chars = text.chars().count();
        if chars > self.config.max_text_chars {
            return Err(SellerError::InvalidParameters(format!(
                "text is {} characters, limit is {}",
                chars, self.config.max_text_chars
            )));
        }
        if !(self.config.min_chunk_size..=self.config.max_chunk_size).contains(&request.chunk_size) {
            return Err(SellerError::InvalidParameters(format!(
                "chunk_size must be between {} and {}, got {}",
                self.config.min_chunk_size, self.config.max_chunk_size, request.chunk_size
            )));
        }
        if request.language.trim().is_empty() {
            return Err(SellerError::InvalidParameters("language must not be empty".to_string()));
        }

        let units = TextSegmenter::new(request.chunk_size).split(text);
        if units.is_empty() {
            return Err(SellerError::InvalidParameters(
                "text contains nothing to synthesize".to_string(),
            ));
        }
        Ok(units)
    }

    /// Start a streaming synthesis.
    ///
    /// Request validation fails here; anything later arrives as a single
    /// `Error` event that ends the stream.
    pub fn start(&self, stream_id: impl Into<String>, request: SynthesisRequest) -> Result<SynthesisStream> {
        let stream_id = stream_id.into();
        let units = self.plan(&request)?;
        let unit_count = units.len();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        info!(
            "Synthesis stream {} started: {} units, language {}",
            stream_id, unit_count, request.language
        );
        tokio::spawn(produce(
            self.registry.clone(),
            stream_id.clone(),
            units,
            request.language,
            tx,
        ));

        Ok(SynthesisStream {
            stream_id,
            units: unit_count,
            rx,
        })
    }

    /// Synthesize everything and return one WAV artifact
    pub async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisArtifact> {
        let stopwatch = Stopwatch::start();
        let mut stream = self.start(format!("batch-{}", Uuid::new_v4()), request)?;

        let mut pcm = Vec::new();
        let mut sample_rate = None;
        let mut chunks = 0;
        loop {
            match stream.recv().await {
                Some(StreamEvent::AudioChunk {
                    data,
                    sample_rate: rate,
                    ..
                }) => {
                    pcm.extend_from_slice(&data);
                    sample_rate.get_or_insert(rate);
                    chunks += 1;
                }
                Some(StreamEvent::Complete) => break,
                Some(StreamEvent::Error(e)) => return Err(e),
                None => {
                    return Err(SellerError::InferenceFailure(
                        "synthesis stream ended without completing".to_string(),
                    ))
                }
            }
        }

        let sample_rate = sample_rate.unwrap_or(self.config.sample_rate);
        let samples = pcm.len() / 2;
        Ok(SynthesisArtifact {
            wav: pcm16_to_wav(&pcm, sample_rate)?,
            sample_rate,
            duration_secs: samples as f32 / sample_rate as f32,
            chunks,
            processing_time: stopwatch.elapsed().as_secs_f64(),
        })
    }
}

async fn produce(
    registry: Arc<ModelRegistry>,
    stream_id: String,
    units: Vec<SynthesisUnit>,
    language: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    let handle = match registry.acquire(ModelKind::Synthesis).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Synthesis stream {} could not get a model: {}", stream_id, e);
            let _ = tx.send(StreamEvent::Error(e)).await;
            return;
        }
    };
    let synthesizer = match handle.synthesizer() {
        Ok(model) => model,
        Err(e) => {
            let _ = tx.send(StreamEvent::Error(e)).await;
            return;
        }
    };

    let mut stream_rate: Option<u32> = None;
    for unit in units {
        if tx.is_closed() {
            debug!("Synthesis stream {} cancelled before unit {}", stream_id, unit.index);
            return;
        }

        let model = synthesizer.clone();
        let lang = language.clone();
        let text = unit.text;
        let audio = match handle.run(move || model.synthesize(&text, &lang)).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!("Synthesis stream {} failed at unit {}: {}", stream_id, unit.index, e);
                let _ = tx.send(StreamEvent::Error(e)).await;
                return;
            }
        };

        match stream_rate {
            None => stream_rate = Some(audio.sample_rate),
            Some(rate) if rate != audio.sample_rate => {
                let e = SellerError::InferenceFailure(format!(
                    "sample rate changed mid-stream from {} to {}",
                    rate, audio.sample_rate
                ));
                let _ = tx.send(StreamEvent::Error(e)).await;
                return;
            }
            Some(_) => {}
        }

        let event = StreamEvent::AudioChunk {
            index: unit.index as u64,
            data: f32_to_pcm16(&audio.samples),
            sample_rate: audio.sample_rate,
        };
        if tx.send(event).await.is_err() {
            debug!("Synthesis stream {} cancelled after unit {}", stream_id, unit.index);
            return;
        }
    }

    let _ = tx.send(StreamEvent::Complete).await;
    info!("Synthesis stream {} complete", stream_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LoadedModel;
    use crate::providers::{StaticProvider, ToneSynthesizer};
    use futures::StreamExt;

    fn emitter(synth: ToneSynthesizer) -> ChunkEmitter {
        let registry = ModelRegistry::builder()
            .with_provider(Arc::new(StaticProvider::new(
                "tone",
                LoadedModel::Synthesizer(Arc::new(synth)),
            )))
            .build()
            .unwrap();
        ChunkEmitter::new(Arc::new(registry), TtsConfig::default())
    }

    const TEXT: &str = "Welcome to the store. Today we have fresh dates! Would you like a sample?";

    #[tokio::test]
    async fn test_stream_emits_ordered_chunks_then_complete() {
        let emitter = emitter(ToneSynthesizer::default());
        let mut stream = emitter.start("t1", emitter.request(TEXT)).unwrap();
        assert_eq!(stream.unit_count(), 3);

        let mut indices = Vec::new();
        let mut completes = 0;
        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::AudioChunk { index, data, .. } => {
                    assert!(!data.is_empty());
                    indices.push(index);
                }
                StreamEvent::Complete => completes += 1,
                StreamEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(completes, 1);
    }

    #[tokio::test]
    async fn test_failure_stops_stream_with_one_error() {
        let emitter = emitter(ToneSynthesizer::default().failing_on("fresh"));
        let events: Vec<_> = emitter
            .start("t2", emitter.request(TEXT))
            .unwrap()
            .into_stream()
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::AudioChunk { index: 0, .. }));
        assert!(matches!(events[1], StreamEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_validation() {
        let emitter = emitter(ToneSynthesizer::default());
        assert!(emitter.start("t3", emitter.request("   ")).is_err());
        assert!(emitter
            .start("t3", SynthesisRequest::new(TEXT, "ar", 100))
            .is_err());
        assert!(emitter
            .start("t3", emitter.request("x".repeat(2000)))
            .is_err());
        assert!(emitter.start("t3", emitter.request("?!")).is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_production() {
        let emitter = emitter(ToneSynthesizer::default());
        let text = (0..50).map(|i| format!("Sentence number {}.", i)).collect::<Vec<_>>().join(" ");
        let mut stream = emitter.start("t4", emitter.request(text)).unwrap();
        assert!(matches!(stream.recv().await, Some(StreamEvent::AudioChunk { index: 0, .. })));
        stream.cancel();

        let mut drained = 0;
        while let Some(event) = stream.recv().await {
            assert!(!matches!(event, StreamEvent::Complete));
            drained += 1;
        }
        assert!(drained < 49);
    }

    #[tokio::test]
    async fn test_batch_artifact() {
        let emitter = emitter(ToneSynthesizer::default());
        let artifact = emitter.synthesize(emitter.request(TEXT)).await.unwrap();
        assert_eq!(artifact.chunks, 3);
        assert_eq!(artifact.sample_rate, 22050);
        assert!(artifact.duration_secs > 0.0);
        assert_eq!(&artifact.wav[0..4], b"RIFF");
    }

    #[tokio::test]
    async fn test_batch_surfaces_error() {
        let emitter = emitter(ToneSynthesizer::default().failing_on("sample"));
        let err = emitter.synthesize(emitter.request(TEXT)).await.unwrap_err();
        assert!(matches!(err, SellerError::InferenceFailure(_)));
    }
}
