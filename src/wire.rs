//! JSON shapes exchanged with the transport layer
//!
//! Field names here are part of the external contract. Domain types convert
//! into these at the edge; nothing inside the crate depends on them.

use crate::llm::ChatReply;
use crate::speech::codec::{decode_base64, encode_base64};
use crate::speech::{
    AudioChunk, StreamEvent, SttStreamEvent, SynthesisRequest, TranscriptEvent, Transcription,
};
use crate::tracking::{JobState, Track, TrackingJob};
use crate::{ErrorCode, Result, SellerError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_language() -> String {
    "ar".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_chunk_size() -> usize {
    1024
}

/// Parse a session id from the wire. A malformed id cannot name any
/// session, so it is reported as not found.
pub fn parse_session_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| SellerError::not_found("session", raw))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageIn {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ChatMessageIn {
    pub fn session_uuid(&self) -> Result<Option<Uuid>> {
        self.session_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(parse_session_id)
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponseOut {
    pub response: String,
    pub session_id: String,
    pub processing_time: f64,
    pub confidence: f32,
}

impl From<&ChatReply> for ChatResponseOut {
    fn from(reply: &ChatReply) -> Self {
        Self {
            response: reply.response.clone(),
            session_id: reply.session_id.to_string(),
            processing_time: reply.processing_time,
            confidence: reply.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingUploadResponse {
    pub session_id: String,
    pub status: JobState,
    pub filename: String,
}

impl From<&TrackingJob> for TrackingUploadResponse {
    fn from(job: &TrackingJob) -> Self {
        Self {
            session_id: job.id.to_string(),
            status: job.state,
            filename: job.asset.filename.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingProcessResponse {
    pub session_id: String,
    pub status: JobState,
    pub tracks: Vec<Track>,
}

impl From<&TrackingJob> for TrackingProcessResponse {
    fn from(job: &TrackingJob) -> Self {
        Self {
            session_id: job.id.to_string(),
            status: job.state,
            tracks: job.tracks().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttStreamRequest {
    /// Base64 PCM16 or WAV bytes
    pub audio_data: String,
    pub chunk_index: u64,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl SttStreamRequest {
    pub fn into_chunk(self) -> Result<AudioChunk> {
        Ok(AudioChunk {
            index: self.chunk_index,
            payload: decode_base64(&self.audio_data)?,
            is_final: self.is_final,
            language: self.language,
            sample_rate: self.sample_rate,
        })
    }
}

/// One-shot transcription of a complete recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    /// Base64 PCM16 or WAV bytes
    pub audio_data: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl TranscriptionRequest {
    pub fn audio(&self) -> Result<Vec<u8>> {
        decode_base64(&self.audio_data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    pub language: String,
    pub confidence: Option<f32>,
    /// Seconds of audio
    pub duration: f64,
    pub processing_time: f64,
}

impl From<&Transcription> for TranscriptionResponse {
    fn from(result: &Transcription) -> Self {
        Self {
            text: result.text.clone(),
            language: result.language.clone(),
            confidence: result.confidence,
            duration: result.duration_secs,
            processing_time: result.processing_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttResponseType {
    Partial,
    Final,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttStreamResponse {
    #[serde(rename = "type")]
    pub kind: SttResponseType,
    pub text: String,
    pub chunk_index: u64,
    pub confidence: Option<f32>,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SttStreamResponse {
    pub fn error(chunk_index: u64, error: &SellerError) -> Self {
        Self {
            kind: SttResponseType::Error,
            text: String::new(),
            chunk_index,
            confidence: None,
            is_final: true,
            message: Some(error.to_string()),
        }
    }
}

impl From<&TranscriptEvent> for SttStreamResponse {
    fn from(event: &TranscriptEvent) -> Self {
        Self {
            kind: if event.is_final() {
                SttResponseType::Final
            } else {
                SttResponseType::Partial
            },
            text: event.text().to_string(),
            chunk_index: event.chunk_index(),
            confidence: event.confidence(),
            is_final: event.is_final(),
            message: None,
        }
    }
}

impl From<&SttStreamEvent> for SttStreamResponse {
    fn from(event: &SttStreamEvent) -> Self {
        match event {
            SttStreamEvent::Transcript(transcript) => transcript.into(),
            SttStreamEvent::Error { chunk_index, error } => Self::error(*chunk_index, error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsStreamRequest {
    pub text: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl From<TtsStreamRequest> for SynthesisRequest {
    fn from(request: TtsStreamRequest) -> Self {
        SynthesisRequest::new(request.text, request.language, request.chunk_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TtsStreamResponse {
    AudioChunk {
        /// Base64 PCM16 little-endian
        data: String,
        chunk_index: u64,
    },
    Complete,
    Error {
        message: String,
    },
}

impl From<&StreamEvent> for TtsStreamResponse {
    fn from(event: &StreamEvent) -> Self {
        match event {
            StreamEvent::AudioChunk { index, data, .. } => TtsStreamResponse::AudioChunk {
                data: encode_base64(data),
                chunk_index: *index,
            },
            StreamEvent::Complete => TtsStreamResponse::Complete,
            StreamEvent::Error(error) => TtsStreamResponse::Error {
                message: error.to_string(),
            },
        }
    }
}

/// Body of a failed request/response call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: bool,
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl From<&SellerError> for ErrorPayload {
    fn from(error: &SellerError) -> Self {
        Self {
            error: true,
            code: error.code(),
            message: error.to_string(),
            status: error.status_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InteractionStep;
    use serde_json::json;

    #[test]
    fn test_chat_message_defaults() {
        let msg: ChatMessageIn = serde_json::from_value(json!({"message": "hi"})).unwrap();
        assert_eq!(msg.session_uuid().unwrap(), None);

        let msg: ChatMessageIn =
            serde_json::from_value(json!({"message": "hi", "session_id": "not-a-uuid"})).unwrap();
        assert!(matches!(msg.session_uuid(), Err(SellerError::NotFound { .. })));
    }

    #[test]
    fn test_chat_response_shape() {
        let reply = ChatReply {
            response: "Aisle 4".to_string(),
            session_id: Uuid::nil(),
            processing_time: 0.5,
            confidence: 0.85,
        };
        let value = serde_json::to_value(ChatResponseOut::from(&reply)).unwrap();
        assert_eq!(value["response"], "Aisle 4");
        assert_eq!(value["session_id"], Uuid::nil().to_string());
        assert_eq!(value["processing_time"], 0.5);
        assert_eq!(value.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_stt_request_defaults() {
        let request: SttStreamRequest =
            serde_json::from_value(json!({"audio_data": encode_base64(&[0, 0, 1, 0]), "chunk_index": 1}))
                .unwrap();
        assert!(!request.is_final);
        assert_eq!(request.language, "ar");
        assert_eq!(request.sample_rate, 16000);

        let chunk = request.into_chunk().unwrap();
        assert_eq!(chunk.index, 1);
        assert_eq!(chunk.payload, vec![0, 0, 1, 0]);
    }

    #[test]
    fn test_stt_request_bad_base64() {
        let request = SttStreamRequest {
            audio_data: "%%%".to_string(),
            chunk_index: 0,
            is_final: false,
            language: "ar".to_string(),
            sample_rate: 16000,
        };
        assert!(matches!(request.into_chunk(), Err(SellerError::InvalidParameters(_))));
    }

    #[test]
    fn test_transcription_shapes() {
        let request: TranscriptionRequest =
            serde_json::from_value(json!({"audio_data": encode_base64(&[1, 0])})).unwrap();
        assert_eq!(request.language, "ar");
        assert_eq!(request.sample_rate, 16000);
        assert_eq!(request.audio().unwrap(), vec![1, 0]);

        let result = Transcription {
            text: "fresh dates".to_string(),
            language: "en".to_string(),
            confidence: None,
            duration_secs: 1.5,
            processing_time: 0.25,
        };
        assert_eq!(
            serde_json::to_value(TranscriptionResponse::from(&result)).unwrap(),
            json!({
                "text": "fresh dates",
                "language": "en",
                "confidence": null,
                "duration": 1.5,
                "processing_time": 0.25
            })
        );
    }

    #[test]
    fn test_stt_response_shapes() {
        let event = TranscriptEvent::Final {
            text: "hello".to_string(),
            chunk_index: 3,
            confidence: Some(0.9),
        };
        let value = serde_json::to_value(SttStreamResponse::from(&event)).unwrap();
        assert_eq!(value["type"], "final");
        assert_eq!(value["is_final"], true);
        assert_eq!(value["chunk_index"], 3);
        assert!(value.get("message").is_none());

        let error = SttStreamEvent::Error {
            chunk_index: 2,
            error: SellerError::OutOfOrderChunk {
                expected: 1,
                received: 2,
            },
        };
        let value = serde_json::to_value(SttStreamResponse::from(&error)).unwrap();
        assert_eq!(value["type"], "error");
        assert!(value["message"].as_str().unwrap().contains("expected index 1"));
    }

    #[test]
    fn test_tts_shapes() {
        let request: TtsStreamRequest = serde_json::from_value(json!({"text": "hello"})).unwrap();
        let request = SynthesisRequest::from(request);
        assert_eq!(request.language, "ar");
        assert_eq!(request.chunk_size, 1024);

        let chunk = StreamEvent::AudioChunk {
            index: 0,
            data: vec![1, 2, 3],
            sample_rate: 22050,
        };
        assert_eq!(
            serde_json::to_value(TtsStreamResponse::from(&chunk)).unwrap(),
            json!({"type": "audio_chunk", "data": "AQID", "chunk_index": 0})
        );
        assert_eq!(
            serde_json::to_value(TtsStreamResponse::from(&StreamEvent::Complete)).unwrap(),
            json!({"type": "complete"})
        );
        let error = StreamEvent::Error(SellerError::InferenceFailure("boom".to_string()));
        assert_eq!(
            serde_json::to_value(TtsStreamResponse::from(&error)).unwrap()["type"],
            "error"
        );
    }

    #[test]
    fn test_error_payload() {
        let err = SellerError::ModelNotReady {
            kind: crate::ModelKind::Synthesis,
            waited_ms: 10,
        }
        .at_step(InteractionStep::Speak);
        let value = serde_json::to_value(ErrorPayload::from(&err)).unwrap();
        assert_eq!(value["error"], true);
        assert_eq!(value["code"], "MODEL_NOT_READY");
        assert_eq!(value["status"], 503);
        assert!(value["message"].as_str().unwrap().starts_with("Step 'speak' failed"));
    }
}
