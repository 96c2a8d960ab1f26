use crate::utils::perf::LatencyStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability kinds managed by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Transcription,
    Synthesis,
    Detection,
    Conversation,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Transcription,
        ModelKind::Synthesis,
        ModelKind::Detection,
        ModelKind::Conversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Transcription => "transcription",
            ModelKind::Synthesis => "synthesis",
            ModelKind::Detection => "detection",
            ModelKind::Conversation => "conversation",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a model handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Ready => "ready",
            ModelState::Failed => "failed",
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one handle, safe to read without waiting on a load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHealth {
    pub kind: ModelKind,
    pub state: ModelState,
    pub provider: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub load_error: Option<String>,
    /// Number of load attempts started for this kind
    pub load_count: u64,
    pub inference_count: u64,
    /// Over the most recent inference calls; `None` before the first one
    pub latency: Option<LatencyStats>,
    /// Whether inference calls for this kind are serialized
    pub serialized: bool,
}

impl ModelHealth {
    pub fn is_available(&self) -> bool {
        self.state == ModelState::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde_lowercase() {
        let json = serde_json::to_string(&ModelKind::Conversation).unwrap();
        assert_eq!(json, "\"conversation\"");
        let kind: ModelKind = serde_json::from_str("\"detection\"").unwrap();
        assert_eq!(kind, ModelKind::Detection);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ModelState::Loading.to_string(), "loading");
        assert_eq!(ModelKind::Synthesis.to_string(), "synthesis");
    }
}
