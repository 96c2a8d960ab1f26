//! Integration layer: configuration, the interaction orchestrator and
//! background expiry.

pub mod config;
pub mod janitor;
pub mod orchestrator;

pub use config::AppConfig;
pub use janitor::{Janitor, SweepReport, SweepTargets};
pub use orchestrator::{
    InteractionEvent, InteractionInput, InteractionOrchestrator, InteractionOutcome,
    InteractionStep,
};
