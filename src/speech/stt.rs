//! Streaming transcription: ordered chunk assembly with partial and final
//! decodes against the shared transcription model.

use crate::integration::config::SttConfig;
use crate::models::{ModelKind, ModelRegistry, TranscribeParams, Transcript};
use crate::speech::codec::decode_payload;
use crate::utils::perf::Stopwatch;
use crate::{Result, SellerError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// One ordered piece of an incoming audio stream
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub index: u64,
    /// Raw PCM16 little-endian or a complete WAV container; may be empty
    pub payload: Vec<u8>,
    pub is_final: bool,
    pub language: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// Best-effort text so far; superseded by later events
    Partial {
        text: String,
        chunk_index: u64,
        confidence: Option<f32>,
    },

    /// Decode of the whole stream; the stream is closed afterwards
    Final {
        text: String,
        chunk_index: u64,
        confidence: Option<f32>,
    },
}

impl TranscriptEvent {
    pub fn text(&self) -> &str {
        match self {
            TranscriptEvent::Partial { text, .. } | TranscriptEvent::Final { text, .. } => text,
        }
    }

    pub fn chunk_index(&self) -> u64 {
        match self {
            TranscriptEvent::Partial { chunk_index, .. }
            | TranscriptEvent::Final { chunk_index, .. } => *chunk_index,
        }
    }

    pub fn confidence(&self) -> Option<f32> {
        match self {
            TranscriptEvent::Partial { confidence, .. }
            | TranscriptEvent::Final { confidence, .. } => *confidence,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TranscriptEvent::Final { .. })
    }
}

/// Outcome of transcribing one complete recording
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub language: String,
    pub confidence: Option<f32>,
    /// Length of the submitted audio
    pub duration_secs: f64,
    pub processing_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
enum StreamPhase {
    Receiving,
    Finished,
    Invalidated(String),
}

struct StreamState {
    phase: StreamPhase,
    /// Unset until the first chunk fixes the base index
    next_index: Option<u64>,
    params: Option<TranscribeParams>,
    buffer: Vec<f32>,
    chunks_since_partial: usize,
    samples_since_partial: usize,
    last_activity: Instant,
}

impl StreamState {
    fn new() -> Self {
        Self {
            phase: StreamPhase::Receiving,
            next_index: None,
            params: None,
            buffer: Vec::new(),
            chunks_since_partial: 0,
            samples_since_partial: 0,
            last_activity: Instant::now(),
        }
    }

    fn invalidate(&mut self, reason: String) {
        self.phase = StreamPhase::Invalidated(reason);
        self.buffer = Vec::new();
    }
}

/// Reassembles ordered audio chunks per stream id
pub struct ChunkAssembler {
    registry: Arc<ModelRegistry>,
    streams: Mutex<HashMap<String, Arc<AsyncMutex<StreamState>>>>,
    config: SttConfig,
}

impl ChunkAssembler {
    pub fn new(registry: Arc<ModelRegistry>, config: SttConfig) -> Self {
        Self {
            registry,
            streams: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SttConfig {
        &self.config
    }

    fn stream(&self, stream_id: &str) -> Arc<AsyncMutex<StreamState>> {
        self.streams
            .lock()
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                debug!("Opened transcription stream {}", stream_id);
                Arc::new(AsyncMutex::new(StreamState::new()))
            })
            .clone()
    }

    /// Accept the next chunk of a stream.
    ///
    /// Returns a partial event when a partial decode was due, the final event
    /// for the last chunk, and `None` otherwise. Ordering or parameter errors
    /// invalidate the stream until it is closed.
    pub async fn feed(&self, stream_id: &str, chunk: AudioChunk) -> Result<Option<TranscriptEvent>> {
        let stream = self.stream(stream_id);
        let mut state = stream.lock().await;

        match &state.phase {
            StreamPhase::Receiving => {}
            StreamPhase::Finished => {
                return Err(SellerError::InvalidState(format!(
                    "stream {} is already finalized",
                    stream_id
                )))
            }
            StreamPhase::Invalidated(reason) => {
                return Err(SellerError::InvalidState(format!(
                    "stream {} was invalidated: {}",
                    stream_id, reason
                )))
            }
        }

        let params = match accept(&mut state, &chunk) {
            Ok(params) => params,
            Err(e) => {
                warn!("Invalidating stream {} at chunk {}: {}", stream_id, chunk.index, e);
                state.invalidate(e.to_string());
                return Err(e);
            }
        };

        if chunk.is_final {
            state.phase = StreamPhase::Finished;
            let audio = std::mem::take(&mut state.buffer);
            if audio.is_empty() {
                info!("Stream {} finished without audio", stream_id);
                return Ok(Some(TranscriptEvent::Final {
                    text: String::new(),
                    chunk_index: chunk.index,
                    confidence: Some(0.0),
                }));
            }

            let transcript = self.decode(audio, params).await.map_err(|e| {
                warn!("Final decode failed for stream {}: {}", stream_id, e);
                e
            })?;
            info!(
                "Stream {} final transcript ({} chars)",
                stream_id,
                transcript.text.chars().count()
            );
            return Ok(Some(TranscriptEvent::Final {
                text: transcript.text,
                chunk_index: chunk.index,
                confidence: transcript.confidence,
            }));
        }

        if !self.partial_due(&state, params.sample_rate) {
            return Ok(None);
        }
        state.chunks_since_partial = 0;
        state.samples_since_partial = 0;

        match self.decode(state.buffer.clone(), params).await {
            Ok(transcript) => {
                debug!("Stream {} partial at chunk {}", stream_id, chunk.index);
                Ok(Some(TranscriptEvent::Partial {
                    text: transcript.text,
                    chunk_index: chunk.index,
                    confidence: transcript.confidence,
                }))
            }
            Err(e) => {
                // Partials are best-effort; the final decode still runs
                warn!("Partial decode failed for stream {}: {}", stream_id, e);
                Ok(None)
            }
        }
    }

    fn partial_due(&self, state: &StreamState, sample_rate: u32) -> bool {
        if state.buffer.is_empty() {
            return false;
        }
        let by_chunks = self.config.partial_every_chunks > 0
            && state.chunks_since_partial >= self.config.partial_every_chunks;
        let by_duration = self.config.partial_every_secs > 0.0
            && sample_rate > 0
            && state.samples_since_partial as f32 / sample_rate as f32
                >= self.config.partial_every_secs;
        by_chunks || by_duration
    }

    async fn decode(&self, audio: Vec<f32>, params: TranscribeParams) -> Result<Transcript> {
        let handle = self.registry.acquire(ModelKind::Transcription).await?;
        let transcriber = handle.transcriber()?;
        handle
            .run(move || transcriber.transcribe(&audio, &params))
            .await
    }

    /// Transcribe a complete recording without opening a stream.
    ///
    /// A WAV payload is decoded at the rate in its header; `sample_rate` only
    /// applies to raw PCM16.
    pub async fn transcribe(
        &self,
        payload: &[u8],
        language: &str,
        sample_rate: u32,
    ) -> Result<Transcription> {
        let stopwatch = Stopwatch::start();
        if language.trim().is_empty() {
            return Err(SellerError::InvalidParameters(
                "language must not be empty".to_string(),
            ));
        }

        let decoded = decode_payload(payload)?;
        let sample_rate = decoded.sample_rate.unwrap_or(sample_rate);
        if sample_rate == 0 {
            return Err(SellerError::InvalidParameters(
                "sample_rate must be positive".to_string(),
            ));
        }
        if decoded.samples.is_empty() {
            return Err(SellerError::InvalidParameters("audio payload is empty".to_string()));
        }

        let duration_secs = decoded.samples.len() as f64 / f64::from(sample_rate);
        let params = TranscribeParams {
            language: language.to_string(),
            sample_rate,
        };
        let transcript = self.decode(decoded.samples, params).await?;
        info!(
            "Transcribed {:.2}s of {} audio in {}ms",
            duration_secs,
            language,
            stopwatch.elapsed_ms()
        );
        Ok(Transcription {
            text: transcript.text,
            language: language.to_string(),
            confidence: transcript.confidence,
            duration_secs,
            processing_time: stopwatch.elapsed().as_secs_f64(),
        })
    }

    /// Forget a stream; the id can be reused afterwards
    pub fn close(&self, stream_id: &str) -> bool {
        let removed = self.streams.lock().remove(stream_id).is_some();
        if removed {
            debug!("Closed transcription stream {}", stream_id);
        }
        removed
    }

    pub fn active_streams(&self) -> usize {
        self.streams.lock().len()
    }

    /// Drop streams without a chunk for longer than `ttl`.
    ///
    /// Streams in the middle of a decode are skipped.
    pub fn reap_idle(&self, ttl: Duration) -> usize {
        let mut streams = self.streams.lock();
        let before = streams.len();
        streams.retain(|_, stream| match stream.try_lock() {
            Ok(state) => state.last_activity.elapsed() < ttl,
            Err(_) => true,
        });
        let removed = before - streams.len();
        if removed > 0 {
            info!("Reaped {} idle transcription streams", removed);
        }
        removed
    }

    /// Run one stream as a task fed through an ordered channel.
    ///
    /// Dropping the chunk sender is the cancellation signal. A failure is
    /// reported as exactly one error event, after which the stream closes.
    pub fn attach(self: &Arc<Self>, stream_id: impl Into<String>) -> SttStreamHandle {
        let stream_id = stream_id.into();
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<AudioChunk>(32);
        let (event_tx, event_rx) = mpsc::channel::<SttStreamEvent>(32);
        let assembler = self.clone();
        let id = stream_id.clone();

        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let chunk_index = chunk.index;
                let is_final = chunk.is_final;
                match assembler.feed(&id, chunk).await {
                    Ok(Some(event)) => {
                        if event_tx.send(SttStreamEvent::Transcript(event)).await.is_err() {
                            debug!("Listener for stream {} went away", id);
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        let _ = event_tx
                            .send(SttStreamEvent::Error { chunk_index, error })
                            .await;
                        break;
                    }
                }
                if is_final {
                    break;
                }
            }
            assembler.close(&id);
        });

        SttStreamHandle {
            stream_id,
            chunk_tx,
            event_rx,
        }
    }
}

/// Output of an attached stream
#[derive(Debug, Clone)]
pub enum SttStreamEvent {
    Transcript(TranscriptEvent),
    Error { chunk_index: u64, error: SellerError },
}

/// Client side of an attached stream
pub struct SttStreamHandle {
    stream_id: String,
    chunk_tx: mpsc::Sender<AudioChunk>,
    event_rx: mpsc::Receiver<SttStreamEvent>,
}

impl SttStreamHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn chunk_sender(&self) -> mpsc::Sender<AudioChunk> {
        self.chunk_tx.clone()
    }

    pub async fn send(&self, chunk: AudioChunk) -> Result<()> {
        self.chunk_tx
            .send(chunk)
            .await
            .map_err(|_| SellerError::InvalidState(format!("stream {} is closed", self.stream_id)))
    }

    pub async fn recv(&mut self) -> Option<SttStreamEvent> {
        self.event_rx.recv().await
    }

    /// Stop feeding the stream; pending events can still be received
    pub fn finish_input(self) -> mpsc::Receiver<SttStreamEvent> {
        self.event_rx
    }
}

/// Validate a chunk against the stream and append it.
///
/// Nothing is committed unless every check passes.
fn accept(state: &mut StreamState, chunk: &AudioChunk) -> Result<TranscribeParams> {
    if let Some(expected) = state.next_index {
        if chunk.index != expected {
            return Err(SellerError::OutOfOrderChunk {
                expected,
                received: chunk.index,
            });
        }
    }

    let next_index = chunk.index.checked_add(1).ok_or_else(|| {
        SellerError::InvalidParameters(format!(
            "chunk_index {} leaves no room for a successor",
            chunk.index
        ))
    })?;
    if chunk.sample_rate == 0 {
        return Err(SellerError::InvalidParameters(
            "sample_rate must be positive".to_string(),
        ));
    }
    if chunk.language.trim().is_empty() {
        return Err(SellerError::InvalidParameters(
            "language must not be empty".to_string(),
        ));
    }
    if let Some(params) = &state.params {
        if params.language != chunk.language || params.sample_rate != chunk.sample_rate {
            return Err(SellerError::InvalidParameters(format!(
                "stream parameters changed from {}@{}Hz to {}@{}Hz",
                params.language, params.sample_rate, chunk.language, chunk.sample_rate
            )));
        }
    }

    let decoded = decode_payload(&chunk.payload)?;
    if let Some(rate) = decoded.sample_rate {
        if rate != chunk.sample_rate {
            return Err(SellerError::InvalidParameters(format!(
                "WAV payload is {}Hz but stream declares {}Hz",
                rate, chunk.sample_rate
            )));
        }
    }

    let params = state
        .params
        .get_or_insert_with(|| TranscribeParams {
            language: chunk.language.clone(),
            sample_rate: chunk.sample_rate,
        })
        .clone();
    state.next_index = Some(next_index);
    state.chunks_since_partial += 1;
    state.samples_since_partial += decoded.samples.len();
    state.buffer.extend_from_slice(&decoded.samples);
    state.last_activity = Instant::now();
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LoadedModel;
    use crate::providers::{ScriptedTranscriber, StaticProvider};
    use crate::speech::codec::{encode_wav, f32_to_pcm16};

    fn assembler(partial_every_chunks: usize) -> Arc<ChunkAssembler> {
        let registry = ModelRegistry::builder()
            .with_provider(Arc::new(StaticProvider::new(
                "scripted-stt",
                LoadedModel::Transcriber(Arc::new(ScriptedTranscriber::new(
                    "I am looking for fresh dates",
                ))),
            )))
            .build()
            .unwrap();
        let config = SttConfig {
            partial_every_chunks,
            ..SttConfig::default()
        };
        Arc::new(ChunkAssembler::new(Arc::new(registry), config))
    }

    fn chunk(index: u64, is_final: bool) -> AudioChunk {
        AudioChunk {
            index,
            payload: if is_final { Vec::new() } else { f32_to_pcm16(&[0.1; 8000]) },
            is_final,
            language: "ar".to_string(),
            sample_rate: 16000,
        }
    }

    #[tokio::test]
    async fn test_final_after_ordered_chunks() {
        let assembler = assembler(0);
        for i in 0..3 {
            assert!(assembler.feed("s1", chunk(i, false)).await.unwrap().is_none());
        }
        let event = assembler.feed("s1", chunk(3, true)).await.unwrap().unwrap();
        assert!(event.is_final());
        assert_eq!(event.chunk_index(), 3);
        assert!(!event.text().is_empty());

        // Terminated
        let err = assembler.feed("s1", chunk(4, false)).await.unwrap_err();
        assert!(matches!(err, SellerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_gap_invalidates_stream() {
        let assembler = assembler(0);
        assembler.feed("s2", chunk(0, false)).await.unwrap();
        let err = assembler.feed("s2", chunk(2, false)).await.unwrap_err();
        assert!(matches!(
            err,
            SellerError::OutOfOrderChunk {
                expected: 1,
                received: 2
            }
        ));

        // Even the right index is refused now
        let err = assembler.feed("s2", chunk(1, false)).await.unwrap_err();
        assert!(matches!(err, SellerError::InvalidState(_)));

        // Closing allows a restart under the same id
        assert!(assembler.close("s2"));
        assert!(assembler.feed("s2", chunk(0, false)).await.is_ok());
    }

    #[tokio::test]
    async fn test_first_chunk_sets_base_index() {
        let assembler = assembler(0);
        assembler.feed("s3", chunk(1, false)).await.unwrap();
        assembler.feed("s3", chunk(2, false)).await.unwrap();
        let event = assembler.feed("s3", chunk(3, true)).await.unwrap().unwrap();
        assert!(event.is_final());
    }

    #[tokio::test]
    async fn test_partials_every_n_chunks() {
        let assembler = assembler(2);
        assert!(assembler.feed("s4", chunk(0, false)).await.unwrap().is_none());
        let partial = assembler.feed("s4", chunk(1, false)).await.unwrap().unwrap();
        assert!(!partial.is_final());
        assert_eq!(partial.chunk_index(), 1);
        assert!(assembler.feed("s4", chunk(2, false)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parameter_change_rejected() {
        let assembler = assembler(0);
        assembler.feed("s5", chunk(0, false)).await.unwrap();
        let mut changed = chunk(1, false);
        changed.sample_rate = 8000;
        let err = assembler.feed("s5", changed).await.unwrap_err();
        assert!(matches!(err, SellerError::InvalidParameters(_)));

        let mut wav_chunk = chunk(0, false);
        wav_chunk.payload = encode_wav(&[0.0; 100], 44100).unwrap();
        let err = assembler.feed("s6", wav_chunk).await.unwrap_err();
        assert!(matches!(err, SellerError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_last_representable_index_rejected() {
        let assembler = assembler(0);
        let err = assembler.feed("s10", chunk(u64::MAX, false)).await.unwrap_err();
        assert!(matches!(err, SellerError::InvalidParameters(_)));

        // The stream is invalidated, not wrapped around to index 0
        let err = assembler.feed("s10", chunk(0, false)).await.unwrap_err();
        assert!(matches!(err, SellerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_attached_stream_reports_index_overflow() {
        let assembler = assembler(0);
        let mut handle = assembler.attach("s11");
        handle.send(chunk(u64::MAX - 1, false)).await.unwrap();
        handle.send(chunk(u64::MAX, false)).await.unwrap();

        match handle.recv().await {
            Some(SttStreamEvent::Error { chunk_index, error }) => {
                assert_eq!(chunk_index, u64::MAX);
                assert!(matches!(error, SellerError::InvalidParameters(_)));
            }
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_transcribe_whole_recording() {
        let assembler = assembler(0);
        let pcm = f32_to_pcm16(&[0.1; 8000]);
        let result = assembler.transcribe(&pcm, "ar", 16000).await.unwrap();
        assert_eq!(result.text, "I am looking for fresh dates");
        assert_eq!(result.language, "ar");
        assert!((result.duration_secs - 0.5).abs() < 1e-9);
        assert!(result.processing_time >= 0.0);

        // The header rate wins over the declared one
        let wav = encode_wav(&[0.1; 8000], 8000).unwrap();
        let result = assembler.transcribe(&wav, "en", 16000).await.unwrap();
        assert!((result.duration_secs - 1.0).abs() < 1e-9);

        // No stream is left behind
        assert_eq!(assembler.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_transcribe_rejects_unusable_input() {
        let assembler = assembler(0);
        let pcm = f32_to_pcm16(&[0.1; 100]);
        for (payload, language, rate) in [
            (Vec::new(), "ar", 16000),
            (pcm.clone(), " ", 16000),
            (pcm, "ar", 0),
        ] {
            let err = assembler.transcribe(&payload, language, rate).await.unwrap_err();
            assert!(matches!(err, SellerError::InvalidParameters(_)));
        }
    }

    #[tokio::test]
    async fn test_empty_final_skips_model() {
        let assembler = assembler(0);
        let event = assembler.feed("s7", chunk(0, true)).await.unwrap().unwrap();
        assert_eq!(event.text(), "");
        assert!(event.is_final());
    }

    #[tokio::test]
    async fn test_attached_stream_reports_one_error() {
        let assembler = assembler(0);
        let mut handle = assembler.attach("s8");
        handle.send(chunk(0, false)).await.unwrap();
        handle.send(chunk(5, false)).await.unwrap();

        match handle.recv().await {
            Some(SttStreamEvent::Error { chunk_index, error }) => {
                assert_eq!(chunk_index, 5);
                assert!(matches!(error, SellerError::OutOfOrderChunk { .. }));
            }
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(handle.recv().await.is_none());
        assert_eq!(assembler.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_attached_stream_final() {
        let assembler = assembler(0);
        let mut handle = assembler.attach("s9");
        for i in 0..2 {
            handle.send(chunk(i, false)).await.unwrap();
        }
        handle.send(chunk(2, true)).await.unwrap();

        match handle.recv().await {
            Some(SttStreamEvent::Transcript(event)) => assert!(event.is_final()),
            other => panic!("expected final transcript, got {:?}", other),
        }
        assert!(handle.recv().await.is_none());
    }
}
