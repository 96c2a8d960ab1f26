pub mod integration;
pub mod llm;
pub mod messages;
pub mod models;
pub mod providers;
pub mod speech;
pub mod tracking;
pub mod utils;
pub mod wire;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use integration::orchestrator::InteractionStep;
pub use models::ModelKind;

#[derive(Error, Debug, Clone)]
pub enum SellerError {
    #[error("Failed to load {kind} model: {cause}")]
    ModelLoad { kind: ModelKind, cause: String },

    #[error("{kind} model not ready after {waited_ms}ms")]
    ModelNotReady { kind: ModelKind, waited_ms: u64 },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Already processing: {0}")]
    AlreadyProcessing(String),

    #[error("Out of order chunk: expected index {expected}, received {received}")]
    OutOfOrderChunk { expected: u64, received: u64 },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Inference failure: {0}")]
    InferenceFailure(String),

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: InteractionStep,
        #[source]
        source: Box<SellerError>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IOError(String),
}

/// Stable, machine-readable error code derived from the error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ModelLoadError,
    ModelNotReady,
    NotFound,
    InvalidState,
    AlreadyProcessing,
    OutOfOrderChunk,
    InvalidParameters,
    InferenceFailure,
    ConfigError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ModelLoadError => "MODEL_LOAD_ERROR",
            ErrorCode::ModelNotReady => "MODEL_NOT_READY",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::AlreadyProcessing => "ALREADY_PROCESSING",
            ErrorCode::OutOfOrderChunk => "OUT_OF_ORDER_CHUNK",
            ErrorCode::InvalidParameters => "INVALID_PARAMETERS",
            ErrorCode::InferenceFailure => "INFERENCE_FAILURE",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<std::io::Error> for SellerError {
    fn from(e: std::io::Error) -> Self {
        SellerError::IOError(e.to_string())
    }
}

impl From<toml::de::Error> for SellerError {
    fn from(e: toml::de::Error) -> Self {
        SellerError::ConfigError(e.to_string())
    }
}

impl From<serde_json::Error> for SellerError {
    fn from(e: serde_json::Error) -> Self {
        SellerError::InvalidParameters(e.to_string())
    }
}

impl SellerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        SellerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Wrap an error with the orchestration step that produced it
    pub fn at_step(self, step: InteractionStep) -> Self {
        SellerError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any step tags
    pub fn root(&self) -> &SellerError {
        match self {
            SellerError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Taxonomy code; step-tagged errors report the code of their cause
    pub fn code(&self) -> ErrorCode {
        match self.root() {
            SellerError::ModelLoad { .. } => ErrorCode::ModelLoadError,
            SellerError::ModelNotReady { .. } => ErrorCode::ModelNotReady,
            SellerError::NotFound { .. } => ErrorCode::NotFound,
            SellerError::InvalidState(_) => ErrorCode::InvalidState,
            SellerError::AlreadyProcessing(_) => ErrorCode::AlreadyProcessing,
            SellerError::OutOfOrderChunk { .. } => ErrorCode::OutOfOrderChunk,
            SellerError::InvalidParameters(_) => ErrorCode::InvalidParameters,
            SellerError::InferenceFailure(_) => ErrorCode::InferenceFailure,
            SellerError::ConfigError(_) => ErrorCode::ConfigError,
            SellerError::IOError(_) | SellerError::Step { .. } => ErrorCode::InternalError,
        }
    }

    /// HTTP-style status a transport layer should answer with
    pub fn status_code(&self) -> u16 {
        match self.code() {
            ErrorCode::ModelLoadError | ErrorCode::ModelNotReady => 503,
            ErrorCode::NotFound => 404,
            ErrorCode::InvalidState | ErrorCode::AlreadyProcessing => 409,
            ErrorCode::OutOfOrderChunk | ErrorCode::InvalidParameters => 400,
            ErrorCode::InferenceFailure => 502,
            ErrorCode::ConfigError | ErrorCode::InternalError => 500,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self.root() {
            // Sticky until an explicit reload
            SellerError::ModelLoad { .. } => false,
            SellerError::ModelNotReady { .. } => true,
            SellerError::NotFound { .. } => false,
            SellerError::InvalidState(_) => false,
            SellerError::AlreadyProcessing(_) => true,
            // The stream is gone, a new one has to be opened
            SellerError::OutOfOrderChunk { .. } => false,
            SellerError::InvalidParameters(_) => false,
            SellerError::InferenceFailure(_) => true,
            SellerError::ConfigError(_) => false,
            SellerError::IOError(_) => false,
            SellerError::Step { .. } => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self.root() {
            SellerError::ModelLoad { kind, .. } => {
                format!("The {} model is unavailable. Please try again later.", kind)
            }
            SellerError::ModelNotReady { kind, .. } => {
                format!("The {} model is still loading. Please retry shortly.", kind)
            }
            SellerError::NotFound { entity, .. } => format!("The requested {} does not exist.", entity),
            SellerError::InvalidState(_) => "This operation is not allowed right now.".to_string(),
            SellerError::AlreadyProcessing(_) => {
                "This item is already being processed. Please wait.".to_string()
            }
            SellerError::OutOfOrderChunk { .. } => {
                "Audio arrived out of order. Please restart the recording.".to_string()
            }
            SellerError::InvalidParameters(_) => "The request parameters are invalid.".to_string(),
            SellerError::InferenceFailure(_) => "Processing failed. Please try again.".to_string(),
            SellerError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            SellerError::IOError(_) | SellerError::Step { .. } => {
                "System error occurred. Please try again.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SellerError>;
