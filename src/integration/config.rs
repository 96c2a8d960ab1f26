//! Configuration for the orchestration layer
//!
//! Provides centralized configuration for all components. Values come from
//! defaults, then an optional TOML file, then `SELLER_*` environment variables.

use crate::llm::prompts::SYSTEM_PROMPT;
use crate::models::ModelKind;
use crate::tracking::types::{CONFIDENCE_RANGE, MAX_TRACKS_RANGE};
use crate::{Result, SellerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound for every seconds-valued setting (ten years)
pub const MAX_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

pub const DEFAULT_LOAD_TIMEOUT_SECS: u64 = 120;

/// Convert a fractional seconds setting, rejecting values no `Duration` can hold
fn seconds_setting(field: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 || secs > MAX_SECONDS as f64 {
        return Err(SellerError::ConfigError(format!(
            "{} must be within 0..={} seconds, got {}",
            field, MAX_SECONDS, secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| SellerError::ConfigError(format!("{}: {}", field, e)))
}

/// Model registry settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// How long a caller waits for a loading model before `ModelNotReady`
    pub load_timeout_secs: f64,

    /// When false nothing is treated as accelerator-bound
    pub use_gpu: bool,

    /// Kinds whose inference calls run one at a time
    pub serialized_kinds: Vec<ModelKind>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            load_timeout_secs: DEFAULT_LOAD_TIMEOUT_SECS as f64,
            use_gpu: true,
            serialized_kinds: vec![
                ModelKind::Transcription,
                ModelKind::Synthesis,
                ModelKind::Detection,
            ],
        }
    }
}

impl ModelsConfig {
    pub fn load_timeout(&self) -> Result<Duration> {
        let timeout = seconds_setting("models.load_timeout_secs", self.load_timeout_secs)?;
        if timeout.is_zero() {
            return Err(SellerError::ConfigError(
                "models.load_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(timeout)
    }

    pub fn effective_serialized_kinds(&self) -> Vec<ModelKind> {
        if self.use_gpu {
            self.serialized_kinds.clone()
        } else {
            Vec::new()
        }
    }
}

/// Streaming transcription settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    pub default_language: String,
    pub sample_rate: u32,

    /// Run a partial decode after this many chunks (0 disables)
    pub partial_every_chunks: usize,

    /// Run a partial decode after this much new audio (0 disables)
    pub partial_every_secs: f32,

    /// Streams without a chunk for this long are dropped
    pub max_stream_idle_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            default_language: "ar".to_string(),
            sample_rate: 16000,
            partial_every_chunks: 5,
            partial_every_secs: 0.0,
            max_stream_idle_secs: 300,
        }
    }
}

/// Synthesis settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub default_language: String,
    pub default_chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub max_text_chars: usize,

    /// Fallback rate reported when no audio was produced
    pub sample_rate: u32,

    /// Chunks buffered ahead of a slow reader
    pub channel_capacity: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            default_language: "ar".to_string(),
            default_chunk_size: 1024,
            min_chunk_size: 512,
            max_chunk_size: 8192,
            max_text_chars: 1000,
            sample_rate: 22050,
            channel_capacity: 4,
        }
    }
}

/// Conversation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub system_prompt: String,

    /// Prior messages included in each prompt
    pub context_messages: usize,

    pub max_message_chars: usize,

    /// Reported when the model gives no confidence of its own
    pub default_confidence: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: SYSTEM_PROMPT.to_string(),
            context_messages: 10,
            max_message_chars: 1000,
            default_confidence: 0.85,
        }
    }
}

/// Tracking job defaults
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub confidence_threshold: f32,
    pub max_tracks: usize,
    pub supported_formats: Vec<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            max_tracks: 100,
            supported_formats: ["mp4", "avi", "mov", "mkv", "webm", "flv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl TrackingConfig {
    pub fn is_supported_format(&self, extension: &str) -> bool {
        let extension = extension.trim_start_matches('.');
        self.supported_formats
            .iter()
            .any(|f| f.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }
}

/// Expiry of idle records
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Chat sessions idle longer than this are removed
    pub ttl_secs: u64,

    /// Finished tracking jobs older than this are removed
    pub job_ttl_secs: u64,

    pub reap_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            job_ttl_secs: 86_400,
            reap_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "seller_agent=debug,info".to_string(),
        }
    }
}

/// Configuration for the complete service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelsConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub chat: ChatConfig,
    pub tracking: TrackingConfig,
    pub sessions: SessionConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file, or defaults when `path` is `None`, then apply
    /// environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                info!("Loading configuration from {:?}", path);
                let text = std::fs::read_to_string(path)?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SELLER_*` overrides from key/value pairs
    pub fn apply_overrides(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (key, value) in vars {
            let applied = match key.as_str() {
                "SELLER_LOG" => {
                    self.logging.filter = value.clone();
                    true
                }
                "SELLER_MODEL_LOAD_TIMEOUT_SECS" => {
                    self.models.load_timeout_secs = parse_var(&key, &value)?;
                    true
                }
                "SELLER_USE_GPU" => {
                    self.models.use_gpu = parse_var(&key, &value)?;
                    true
                }
                "SELLER_STT_LANGUAGE" => {
                    self.stt.default_language = value.clone();
                    true
                }
                "SELLER_SESSION_TTL_SECS" => {
                    self.sessions.ttl_secs = parse_var(&key, &value)?;
                    true
                }
                _ => false,
            };
            if applied {
                debug!("Config override {}={}", key, value);
            }
        }
        Ok(())
    }

    /// Set the model load timeout
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.models.load_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Run every model kind concurrently
    pub fn without_gpu(mut self) -> Self {
        self.models.use_gpu = false;
        self
    }

    pub fn with_partial_every_chunks(mut self, chunks: usize) -> Self {
        self.stt.partial_every_chunks = chunks;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.sessions.ttl_secs = ttl.as_secs();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(SellerError::ConfigError(msg));

        self.models.load_timeout()?;
        seconds_setting("stt.partial_every_secs", f64::from(self.stt.partial_every_secs))?;
        for (field, secs) in [
            ("stt.max_stream_idle_secs", self.stt.max_stream_idle_secs),
            ("sessions.ttl_secs", self.sessions.ttl_secs),
            ("sessions.job_ttl_secs", self.sessions.job_ttl_secs),
            ("sessions.reap_interval_secs", self.sessions.reap_interval_secs),
        ] {
            if secs > MAX_SECONDS {
                return fail(format!(
                    "{} must be at most {} seconds, got {}",
                    field, MAX_SECONDS, secs
                ));
            }
        }
        if self.stt.sample_rate == 0 {
            return fail("stt.sample_rate must be positive".to_string());
        }
        if self.tts.min_chunk_size == 0 || self.tts.min_chunk_size > self.tts.max_chunk_size {
            return fail(format!(
                "tts chunk size range {}..={} is empty",
                self.tts.min_chunk_size, self.tts.max_chunk_size
            ));
        }
        if !(self.tts.min_chunk_size..=self.tts.max_chunk_size).contains(&self.tts.default_chunk_size) {
            return fail(format!(
                "tts.default_chunk_size {} is outside {}..={}",
                self.tts.default_chunk_size, self.tts.min_chunk_size, self.tts.max_chunk_size
            ));
        }
        if self.tts.sample_rate == 0 {
            return fail("tts.sample_rate must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.chat.default_confidence) {
            return fail("chat.default_confidence must be within 0..=1".to_string());
        }
        if self.chat.max_message_chars == 0 {
            return fail("chat.max_message_chars must be positive".to_string());
        }
        if !CONFIDENCE_RANGE.contains(&self.tracking.confidence_threshold) {
            return fail(format!(
                "tracking.confidence_threshold {} is outside {:?}",
                self.tracking.confidence_threshold, CONFIDENCE_RANGE
            ));
        }
        if !MAX_TRACKS_RANGE.contains(&self.tracking.max_tracks) {
            return fail(format!(
                "tracking.max_tracks {} is outside {:?}",
                self.tracking.max_tracks, MAX_TRACKS_RANGE
            ));
        }
        if self.tracking.supported_formats.is_empty() {
            return fail("tracking.supported_formats must not be empty".to_string());
        }
        if self.sessions.reap_interval_secs == 0 {
            return fail("sessions.reap_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SellerError::ConfigError(format!("invalid value for {}: '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stt.default_language, "ar");
        assert_eq!(config.stt.sample_rate, 16000);
        assert_eq!(config.tts.default_chunk_size, 1024);
        assert_eq!(config.tracking.max_tracks, 100);
        assert_eq!(config.models.load_timeout().unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml_str(
            r#"
            [models]
            load_timeout_secs = 5
            serialized_kinds = ["transcription"]

            [tracking]
            confidence_threshold = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.models.load_timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(config.models.serialized_kinds, vec![ModelKind::Transcription]);
        assert_eq!(config.tracking.confidence_threshold, 0.5);
        // Untouched sections keep defaults
        assert_eq!(config.tts, TtsConfig::default());
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            AppConfig::from_toml_str("[models]\nuse_gpu = \"maybe\""),
            Err(SellerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(vec![
                ("SELLER_USE_GPU".to_string(), "false".to_string()),
                ("SELLER_STT_LANGUAGE".to_string(), "en".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ])
            .unwrap();
        assert!(!config.models.use_gpu);
        assert!(config.models.effective_serialized_kinds().is_empty());
        assert_eq!(config.stt.default_language, "en");

        let err = config.apply_overrides(vec![(
            "SELLER_MODEL_LOAD_TIMEOUT_SECS".to_string(),
            "soon".to_string(),
        )]);
        assert!(err.is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        config.tracking.max_tracks = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tts.default_chunk_size = 100;
        assert!(config.validate().is_err());

        let config = AppConfig::default().with_load_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unrepresentable_timeouts_rejected() {
        for raw in ["1e30", "nan", "inf", "-3"] {
            let toml = format!("[models]\nload_timeout_secs = {}", raw);
            let config = AppConfig::from_toml_str(&toml).unwrap();
            assert!(
                matches!(config.models.load_timeout(), Err(SellerError::ConfigError(_))),
                "load_timeout_secs = {}",
                raw
            );
            assert!(matches!(config.validate(), Err(SellerError::ConfigError(_))));
        }

        let mut config = AppConfig::default();
        config
            .apply_overrides(vec![(
                "SELLER_MODEL_LOAD_TIMEOUT_SECS".to_string(),
                "1e30".to_string(),
            )])
            .unwrap();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stt.partial_every_secs = f32::INFINITY;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sessions.ttl_secs = u64::MAX;
        assert!(config.validate().is_err());
        config.sessions.ttl_secs = MAX_SECONDS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_supported_formats() {
        let config = TrackingConfig::default();
        assert!(config.is_supported_format("MP4"));
        assert!(config.is_supported_format(".webm"));
        assert!(!config.is_supported_format("gif"));
    }
}
