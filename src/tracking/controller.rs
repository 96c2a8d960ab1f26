//! Tracking job state machine.
//!
//! `uploaded -> processing -> completed | failed`, with `failed -> processing`
//! allowed on an explicit re-process. Only the controller moves a job between
//! states, and only one `process` run per job can be in flight.

use super::types::{
    AssetRef, JobState, ParamOverrides, Track, TrackingJob, TrackingParams, TrackingSummary,
};
use crate::integration::config::TrackingConfig;
use crate::models::{Detection, ModelKind, ModelRegistry};
use crate::utils::perf::Stopwatch;
use crate::{Result, SellerError};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

type JobEntry = Arc<Mutex<TrackingJob>>;

#[derive(Clone)]
pub struct TrackingController {
    registry: Arc<ModelRegistry>,
    jobs: Arc<RwLock<HashMap<Uuid, JobEntry>>>,
    config: TrackingConfig,
}

impl TrackingController {
    pub fn new(registry: Arc<ModelRegistry>, config: TrackingConfig) -> Self {
        Self {
            registry,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    fn entry(&self, id: Uuid) -> Result<JobEntry> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SellerError::not_found("tracking job", id))
    }

    pub fn default_params(&self) -> TrackingParams {
        TrackingParams {
            confidence_threshold: self.config.confidence_threshold,
            max_tracks: self.config.max_tracks,
        }
    }

    /// Register an uploaded asset as a new job in `uploaded`
    pub fn upload(&self, asset: AssetRef, overrides: ParamOverrides) -> Result<TrackingJob> {
        match asset.extension() {
            Some(ext) if self.config.is_supported_format(&ext) => {}
            _ => {
                return Err(SellerError::InvalidParameters(format!(
                    "unsupported video format '{}', expected one of: {}",
                    asset.filename,
                    self.config.supported_formats.join(", ")
                )))
            }
        }

        let params = overrides.apply(&self.default_params());
        params.validate()?;

        let job = TrackingJob::new(asset, params);
        self.jobs
            .write()
            .insert(job.id, Arc::new(Mutex::new(job.clone())));
        info!("Uploaded tracking job {} ({})", job.id, job.asset.filename);
        Ok(job)
    }

    /// Run detection and tracking for one job.
    ///
    /// The work runs in its own task, so the job still reaches a terminal
    /// state if the caller stops waiting.
    pub async fn process(&self, id: Uuid, overrides: ParamOverrides) -> Result<TrackingJob> {
        let entry = self.entry(id)?;

        let (asset, params) = {
            let mut job = entry.lock();
            match job.state {
                JobState::Processing => {
                    return Err(SellerError::AlreadyProcessing(format!("tracking job {}", id)))
                }
                JobState::Completed => {
                    return Err(SellerError::InvalidState(format!(
                        "tracking job {} is already completed",
                        id
                    )))
                }
                JobState::Uploaded | JobState::Failed => {}
            }

            let params = overrides.apply(&job.params);
            params.validate()?;

            job.params = params.clone();
            job.state = JobState::Processing;
            job.error = None;
            job.updated_at = Utc::now();
            (job.asset.clone(), params)
        };
        info!(
            "Processing tracking job {} (threshold {}, max tracks {})",
            id, params.confidence_threshold, params.max_tracks
        );

        let registry = self.registry.clone();
        let task = tokio::spawn(async move {
            let stopwatch = Stopwatch::start();
            let outcome = run_tracking(&registry, &asset, &params).await;

            let mut job = entry.lock();
            job.updated_at = Utc::now();
            job.processing_time = Some(stopwatch.elapsed().as_secs_f64());
            match outcome {
                Ok(tracks) => {
                    info!(
                        "Tracking job {} completed with {} tracks in {}ms",
                        id,
                        tracks.len(),
                        stopwatch.elapsed_ms()
                    );
                    job.state = JobState::Completed;
                    job.result = Some(tracks);
                    Ok(job.clone())
                }
                Err(e) => {
                    warn!("Tracking job {} failed: {}", id, e);
                    job.state = JobState::Failed;
                    job.error = Some(e.to_string());
                    Err(e)
                }
            }
        });

        task.await
            .map_err(|e| SellerError::InferenceFailure(format!("tracking task aborted: {}", e)))?
    }

    /// Upload and process in one call, returning the finished job.
    ///
    /// A failed run leaves the job in `failed`, listed and re-processable.
    pub async fn upload_and_process(
        &self,
        asset: AssetRef,
        overrides: ParamOverrides,
    ) -> Result<TrackingJob> {
        let job = self.upload(asset, overrides)?;
        self.process(job.id, ParamOverrides::default()).await
    }

    /// Current snapshot of a job
    pub fn get(&self, id: Uuid) -> Result<TrackingJob> {
        Ok(self.entry(id)?.lock().clone())
    }

    pub fn list(&self) -> Vec<TrackingJob> {
        let entries: Vec<_> = self.jobs.read().values().cloned().collect();
        let mut jobs: Vec<_> = entries.iter().map(|job| job.lock().clone()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn summary(&self) -> TrackingSummary {
        let entries: Vec<_> = self.jobs.read().values().cloned().collect();
        let mut summary = TrackingSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            match entry.lock().state {
                JobState::Uploaded => summary.uploaded += 1,
                JobState::Processing => summary.active += 1,
                JobState::Completed => summary.completed += 1,
                JobState::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Drop terminal jobs untouched for longer than `ttl`; running jobs stay
    pub fn reap_finished(&self, ttl: Duration) -> usize {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let cutoff = Utc::now() - ttl;
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| {
            let job = job.lock();
            !(job.state.is_terminal() && job.updated_at < cutoff)
        });
        let removed = before - jobs.len();
        if removed > 0 {
            info!("Reaped {} finished tracking jobs", removed);
        }
        removed
    }
}

async fn run_tracking(
    registry: &ModelRegistry,
    asset: &AssetRef,
    params: &TrackingParams,
) -> Result<Vec<Track>> {
    let handle = registry.acquire(ModelKind::Detection).await?;
    let detector = handle.detector()?;

    let source = asset.location.clone();
    let threshold = params.confidence_threshold;
    let detections = handle.run(move || detector.detect(&source, threshold)).await?;
    debug!("Detector returned {} observations for {}", detections.len(), asset.filename);

    Ok(build_tracks(&detections, params))
}

/// Aggregate per-frame detections into one record per tracker id.
///
/// Observations below the threshold are ignored; tracks come back ordered by
/// id and capped at `max_tracks`.
pub fn build_tracks(detections: &[Detection], params: &TrackingParams) -> Vec<Track> {
    struct Acc {
        confidence_sum: f32,
        observations: u32,
        frames: HashSet<u64>,
    }

    let mut by_track: BTreeMap<u32, Acc> = BTreeMap::new();
    for det in detections
        .iter()
        .filter(|d| d.confidence >= params.confidence_threshold)
    {
        let acc = by_track.entry(det.track_id).or_insert_with(|| Acc {
            confidence_sum: 0.0,
            observations: 0,
            frames: HashSet::new(),
        });
        acc.confidence_sum += det.confidence;
        acc.observations += 1;
        acc.frames.insert(det.frame);
    }

    by_track
        .into_iter()
        .take(params.max_tracks)
        .map(|(track_id, acc)| Track {
            track_id,
            person_id: format!("person_{}", track_id),
            confidence: acc.confidence_sum / acc.observations as f32,
            frames_tracked: acc.frames.len() as u64,
        })
        .collect()
}
