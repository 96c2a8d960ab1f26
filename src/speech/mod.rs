//! Streaming speech: chunked transcription input and chunked synthesis output.

pub mod codec;
pub mod segmenter;
pub mod stt;
pub mod tts;

pub use segmenter::{SynthesisUnit, TextSegmenter};
pub use stt::{
    AudioChunk, ChunkAssembler, SttStreamEvent, SttStreamHandle, TranscriptEvent, Transcription,
};
pub use tts::{ChunkEmitter, StreamEvent, SynthesisArtifact, SynthesisRequest, SynthesisStream};
