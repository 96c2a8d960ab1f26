use crate::{Result, SellerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const CONFIDENCE_RANGE: std::ops::RangeInclusive<f32> = 0.1..=1.0;
pub const MAX_TRACKS_RANGE: std::ops::RangeInclusive<usize> = 1..=1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Uploaded => "uploaded",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an uploaded video lives; storing the bytes is the caller's business
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    pub filename: String,
    pub location: PathBuf,
}

impl AssetRef {
    pub fn new(filename: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            location: location.into(),
        }
    }

    /// Lowercased file extension of the original filename
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingParams {
    pub confidence_threshold: f32,
    pub max_tracks: usize,
}

impl TrackingParams {
    pub fn validate(&self) -> Result<()> {
        if !CONFIDENCE_RANGE.contains(&self.confidence_threshold) {
            return Err(SellerError::InvalidParameters(format!(
                "confidence_threshold must be between {} and {}, got {}",
                CONFIDENCE_RANGE.start(),
                CONFIDENCE_RANGE.end(),
                self.confidence_threshold
            )));
        }
        if !MAX_TRACKS_RANGE.contains(&self.max_tracks) {
            return Err(SellerError::InvalidParameters(format!(
                "max_tracks must be between {} and {}, got {}",
                MAX_TRACKS_RANGE.start(),
                MAX_TRACKS_RANGE.end(),
                self.max_tracks
            )));
        }
        Ok(())
    }
}

/// Caller-supplied parameters; unset fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamOverrides {
    pub confidence_threshold: Option<f32>,
    pub max_tracks: Option<usize>,
}

impl ParamOverrides {
    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = Some(threshold);
        self
    }

    pub fn with_max_tracks(mut self, max_tracks: usize) -> Self {
        self.max_tracks = Some(max_tracks);
        self
    }

    pub fn apply(&self, base: &TrackingParams) -> TrackingParams {
        TrackingParams {
            confidence_threshold: self.confidence_threshold.unwrap_or(base.confidence_threshold),
            max_tracks: self.max_tracks.unwrap_or(base.max_tracks),
        }
    }
}

/// One tracked person in a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: u32,
    pub person_id: String,
    pub confidence: f32,
    pub frames_tracked: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingJob {
    pub id: Uuid,
    pub state: JobState,
    pub asset: AssetRef,
    pub params: TrackingParams,
    pub result: Option<Vec<Track>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Seconds spent in the last processing run
    pub processing_time: Option<f64>,
}

impl TrackingJob {
    pub fn new(asset: AssetRef, params: TrackingParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: JobState::Uploaded,
            asset,
            params,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            processing_time: None,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        self.result.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingSummary {
    pub total: usize,
    pub uploaded: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension() {
        assert_eq!(AssetRef::new("clip.MP4", "/tmp/x").extension().as_deref(), Some("mp4"));
        assert_eq!(AssetRef::new("clip", "/tmp/x").extension(), None);
    }

    #[test]
    fn test_param_ranges() {
        let ok = TrackingParams {
            confidence_threshold: 0.5,
            max_tracks: 10,
        };
        assert!(ok.validate().is_ok());

        let low = ParamOverrides::default().with_confidence_threshold(0.05).apply(&ok);
        assert!(low.validate().is_err());

        let many = ParamOverrides::default().with_max_tracks(5000).apply(&ok);
        assert!(many.validate().is_err());
        assert_eq!(many.confidence_threshold, 0.5);
    }
}
