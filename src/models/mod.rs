//! Model lifecycle: one handle per capability kind, loaded on demand and
//! shared by every session.

pub mod kind;
pub mod provider;
pub mod registry;

pub use kind::{ModelHealth, ModelKind, ModelState};
pub use provider::{
    ChatCompletion, ChatModel, ChatPrompt, ChatTurn, Detection, Detector, LoadedModel,
    ModelProvider, PersonStatus, StatusAnalyzer, SynthesizedAudio, Synthesizer, TranscribeParams,
    Transcriber, Transcript,
};
pub use registry::{ModelHandle, ModelRegistry, ModelRegistryBuilder};
