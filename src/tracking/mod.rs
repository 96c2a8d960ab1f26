//! Person tracking jobs over uploaded video assets.

pub mod controller;
pub mod types;

pub use controller::{build_tracks, TrackingController};
pub use types::{AssetRef, JobState, ParamOverrides, Track, TrackingJob, TrackingParams, TrackingSummary};
