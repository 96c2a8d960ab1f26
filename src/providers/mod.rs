//! Capability providers shipped with the crate.

pub mod scripted;

pub use scripted::{
    FixedStatusAnalyzer, ScriptedDetector, ScriptedTranscriber, StaticProvider, TemplateChatModel,
    ToneSynthesizer,
};
