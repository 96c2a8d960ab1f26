//! Single-flight model registry.
//!
//! The registry owns exactly one slot per [`ModelKind`]. The first `acquire`
//! for a kind starts the provider's blocking load on the blocking pool; every
//! caller arriving while that load is in flight waits on the same outcome.
//! A failed load stays failed until [`ModelRegistry::reload`] is called.

use crate::integration::config::{ModelsConfig, DEFAULT_LOAD_TIMEOUT_SECS};
use crate::models::{
    ChatModel, Detector, LoadedModel, ModelHealth, ModelKind, ModelProvider, ModelState,
    Synthesizer, Transcriber,
};
use crate::utils::perf::LatencyWindow;
use crate::{Result, SellerError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

type LoadOutcome = Option<Result<LoadedModel>>;

/// Window size for inference latency statistics
const TIMING_WINDOW: usize = 64;

enum Phase {
    Unloaded,
    Loading(watch::Receiver<LoadOutcome>),
    Ready(LoadedModel),
    Failed(String),
}

impl Phase {
    fn state(&self) -> ModelState {
        match self {
            Phase::Unloaded => ModelState::Unloaded,
            Phase::Loading(_) => ModelState::Loading,
            Phase::Ready(_) => ModelState::Ready,
            Phase::Failed(_) => ModelState::Failed,
        }
    }
}

struct SlotInner {
    phase: Phase,
    /// Bumped on shutdown so stale loads cannot resurrect a slot
    generation: u64,
    last_used_at: Option<DateTime<Utc>>,
    load_count: u64,
    inference_count: u64,
    timings: LatencyWindow,
}

struct Slot {
    kind: ModelKind,
    provider: Option<Arc<dyn ModelProvider>>,
    /// Present for accelerator-bound kinds: one inference at a time
    gate: Option<Arc<Semaphore>>,
    inner: Mutex<SlotInner>,
}

impl Slot {
    fn new(kind: ModelKind, provider: Option<Arc<dyn ModelProvider>>, serialized: bool) -> Self {
        Self {
            kind,
            provider,
            gate: serialized.then(|| Arc::new(Semaphore::new(1))),
            inner: Mutex::new(SlotInner {
                phase: Phase::Unloaded,
                generation: 0,
                last_used_at: None,
                load_count: 0,
                inference_count: 0,
                timings: LatencyWindow::new(TIMING_WINDOW),
            }),
        }
    }

    fn touch(&self) {
        self.inner.lock().last_used_at = Some(Utc::now());
    }

    fn record_inference(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.inference_count += 1;
        inner.timings.record(elapsed);
        inner.last_used_at = Some(Utc::now());
    }

    fn finish_load(&self, generation: u64, outcome: &Result<LoadedModel>, elapsed: Duration) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!("Discarding stale {} load result", self.kind);
            return;
        }
        match outcome {
            Ok(model) => {
                info!("{} model ready in {}ms", self.kind, elapsed.as_millis());
                inner.phase = Phase::Ready(model.clone());
            }
            Err(e) => {
                let cause = match e {
                    SellerError::ModelLoad { cause, .. } => cause.clone(),
                    other => other.to_string(),
                };
                error!("{} model failed to load: {}", self.kind, cause);
                inner.phase = Phase::Failed(cause);
            }
        }
    }

    fn health(&self) -> ModelHealth {
        let inner = self.inner.lock();
        let load_error = match &inner.phase {
            Phase::Failed(cause) => Some(cause.clone()),
            _ => None,
        };
        ModelHealth {
            kind: self.kind,
            state: inner.phase.state(),
            provider: self.provider.as_ref().map(|p| p.name().to_string()),
            last_used_at: inner.last_used_at,
            load_error,
            load_count: inner.load_count,
            inference_count: inner.inference_count,
            latency: inner.timings.stats(),
            serialized: self.gate.is_some(),
        }
    }
}

/// Builder for [`ModelRegistry`]
pub struct ModelRegistryBuilder {
    providers: Vec<Arc<dyn ModelProvider>>,
    serialized: Vec<ModelKind>,
    load_timeout: Duration,
}

impl ModelRegistryBuilder {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            serialized: ModelsConfig::default().effective_serialized_kinds(),
            load_timeout: Duration::from_secs(DEFAULT_LOAD_TIMEOUT_SECS),
        }
    }

    /// Fails when the configured load timeout cannot be represented
    pub fn from_config(config: &ModelsConfig) -> Result<Self> {
        Ok(Self {
            providers: Vec::new(),
            serialized: config.effective_serialized_kinds(),
            load_timeout: config.load_timeout()?,
        })
    }

    pub fn with_provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Replace the set of kinds whose inference calls run one at a time
    pub fn with_serialized_kinds(mut self, kinds: impl IntoIterator<Item = ModelKind>) -> Self {
        self.serialized = kinds.into_iter().collect();
        self
    }

    pub fn build(self) -> Result<ModelRegistry> {
        let mut providers: HashMap<ModelKind, Arc<dyn ModelProvider>> = HashMap::new();
        for provider in self.providers {
            let kind = provider.kind();
            if providers.insert(kind, provider).is_some() {
                return Err(SellerError::ConfigError(format!(
                    "more than one provider registered for {}",
                    kind
                )));
            }
        }

        let slots = ModelKind::ALL
            .iter()
            .map(|&kind| {
                let slot = Slot::new(
                    kind,
                    providers.remove(&kind),
                    self.serialized.contains(&kind),
                );
                (kind, Arc::new(slot))
            })
            .collect();

        Ok(ModelRegistry {
            slots,
            load_timeout: self.load_timeout,
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for ModelRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Sole owner of model instances
pub struct ModelRegistry {
    slots: HashMap<ModelKind, Arc<Slot>>,
    load_timeout: Duration,
    closed: AtomicBool,
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::new()
    }

    pub fn load_timeout(&self) -> Duration {
        self.load_timeout
    }

    fn slot(&self, kind: ModelKind) -> Result<&Arc<Slot>> {
        self.slots.get(&kind).ok_or_else(|| SellerError::ModelLoad {
            kind,
            cause: "unknown model kind".to_string(),
        })
    }

    /// Get a ready handle, loading the model on first use.
    ///
    /// Waiting on an in-flight load is bounded by the configured timeout; the
    /// load itself keeps running after a caller gives up.
    pub async fn acquire(&self, kind: ModelKind) -> Result<ModelHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SellerError::ModelLoad {
                kind,
                cause: "registry is shut down".to_string(),
            });
        }

        let slot = self.slot(kind)?;
        let mut rx = {
            let mut guard = slot.inner.lock();
            let inner = &mut *guard;
            match &inner.phase {
                Phase::Ready(model) => {
                    let model = model.clone();
                    inner.last_used_at = Some(Utc::now());
                    return Ok(ModelHandle::new(slot.clone(), model));
                }
                Phase::Failed(cause) => {
                    return Err(SellerError::ModelLoad {
                        kind,
                        cause: cause.clone(),
                    });
                }
                Phase::Loading(rx) => {
                    debug!("Joining in-flight {} load", kind);
                    rx.clone()
                }
                Phase::Unloaded => {
                    let provider = slot.provider.clone().ok_or_else(|| SellerError::ModelLoad {
                        kind,
                        cause: "no provider registered".to_string(),
                    })?;
                    let (tx, rx) = watch::channel(None);
                    inner.phase = Phase::Loading(rx.clone());
                    inner.load_count += 1;
                    spawn_load(slot.clone(), provider, inner.generation, tx);
                    rx
                }
            }
        };

        self.wait_for_load(slot, &mut rx).await
    }

    async fn wait_for_load(
        &self,
        slot: &Arc<Slot>,
        rx: &mut watch::Receiver<LoadOutcome>,
    ) -> Result<ModelHandle> {
        let kind = slot.kind;
        let waited = tokio::time::timeout(self.load_timeout, rx.wait_for(|o| o.is_some())).await;
        let outcome = match waited {
            Err(_) => {
                warn!(
                    "Gave up waiting for {} model after {}ms",
                    kind,
                    self.load_timeout.as_millis()
                );
                return Err(SellerError::ModelNotReady {
                    kind,
                    waited_ms: self.load_timeout.as_millis() as u64,
                });
            }
            Ok(Err(_)) => None,
            Ok(Ok(outcome)) => (*outcome).clone(),
        };

        match outcome {
            Some(Ok(model)) => {
                slot.touch();
                Ok(ModelHandle::new(slot.clone(), model))
            }
            Some(Err(e)) => Err(e),
            None => Err(SellerError::ModelLoad {
                kind,
                cause: "load task ended without reporting a result".to_string(),
            }),
        }
    }

    /// Clear a sticky failure and try loading again
    pub async fn reload(&self, kind: ModelKind) -> Result<ModelHandle> {
        {
            let slot = self.slot(kind)?;
            let mut inner = slot.inner.lock();
            if let Phase::Failed(cause) = &inner.phase {
                info!("Reloading {} model after failure: {}", kind, cause);
                inner.phase = Phase::Unloaded;
                inner.timings.reset();
            }
        }
        self.acquire(kind).await
    }

    /// Current state of one kind; never waits on a load
    pub fn health(&self, kind: ModelKind) -> ModelHealth {
        match self.slots.get(&kind) {
            Some(slot) => slot.health(),
            None => Slot::new(kind, None, false).health(),
        }
    }

    pub fn health_all(&self) -> Vec<ModelHealth> {
        ModelKind::ALL.iter().map(|&kind| self.health(kind)).collect()
    }

    pub fn is_available(&self, kind: ModelKind) -> bool {
        self.health(kind).is_available()
    }

    /// Kinds that have a provider registered
    pub fn registered_kinds(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .iter()
            .copied()
            .filter(|kind| {
                self.slots
                    .get(kind)
                    .map(|slot| slot.provider.is_some())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Load every registered kind concurrently.
    ///
    /// Failures are logged and reported through health, not returned: the
    /// service starts degraded rather than refusing to start.
    pub async fn initialize(&self) -> Vec<ModelHealth> {
        let kinds = self.registered_kinds();
        info!("Initializing {} model kinds", kinds.len());

        let results = futures::future::join_all(kinds.iter().map(|&kind| self.acquire(kind))).await;
        for (kind, result) in kinds.iter().zip(results) {
            match result {
                Ok(_) => info!("{} model initialized", kind),
                Err(e) => warn!("{} model unavailable, continuing degraded: {}", kind, e),
            }
        }

        let health = self.health_all();
        let ready = health.iter().filter(|h| h.is_available()).count();
        info!("Model initialization finished: {}/{} ready", ready, kinds.len());
        health
    }

    /// Drop every instance and refuse further acquires.
    ///
    /// Handles already given out keep their instance alive until dropped, so
    /// an in-flight inference call completes.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in self.slots.values() {
            let mut inner = slot.inner.lock();
            inner.generation += 1;
            inner.phase = Phase::Unloaded;
            inner.timings.reset();
        }
        info!("Model registry shut down");
    }
}

fn spawn_load(
    slot: Arc<Slot>,
    provider: Arc<dyn ModelProvider>,
    generation: u64,
    tx: watch::Sender<LoadOutcome>,
) {
    let kind = slot.kind;
    info!("Loading {} model ({})", kind, provider.name());

    tokio::spawn(async move {
        let started = Instant::now();
        let outcome = match tokio::task::spawn_blocking(move || provider.load()).await {
            Ok(Ok(model)) if model.kind() == kind => Ok(model),
            Ok(Ok(model)) => Err(SellerError::ModelLoad {
                kind,
                cause: format!("provider returned a {} model", model.kind()),
            }),
            Ok(Err(SellerError::ModelLoad { cause, .. })) => {
                Err(SellerError::ModelLoad { kind, cause })
            }
            Ok(Err(other)) => Err(SellerError::ModelLoad {
                kind,
                cause: other.to_string(),
            }),
            Err(e) => Err(SellerError::ModelLoad {
                kind,
                cause: format!("load task panicked: {}", e),
            }),
        };

        slot.finish_load(generation, &outcome, started.elapsed());
        let _ = tx.send(Some(outcome));
    });
}

/// A ready model checked out of the registry.
///
/// Dropping the handle is the release; it only updates bookkeeping.
pub struct ModelHandle {
    slot: Arc<Slot>,
    model: LoadedModel,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("kind", &self.slot.kind)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    fn new(slot: Arc<Slot>, model: LoadedModel) -> Self {
        Self { slot, model }
    }

    pub fn kind(&self) -> ModelKind {
        self.slot.kind
    }

    pub fn is_serialized(&self) -> bool {
        self.slot.gate.is_some()
    }

    fn mismatch(&self, wanted: ModelKind) -> SellerError {
        SellerError::InvalidState(format!(
            "handle holds a {} model, not {}",
            self.model.kind(),
            wanted
        ))
    }

    pub fn transcriber(&self) -> Result<Arc<dyn Transcriber>> {
        match &self.model {
            LoadedModel::Transcriber(m) => Ok(m.clone()),
            _ => Err(self.mismatch(ModelKind::Transcription)),
        }
    }

    pub fn synthesizer(&self) -> Result<Arc<dyn Synthesizer>> {
        match &self.model {
            LoadedModel::Synthesizer(m) => Ok(m.clone()),
            _ => Err(self.mismatch(ModelKind::Synthesis)),
        }
    }

    pub fn detector(&self) -> Result<Arc<dyn Detector>> {
        match &self.model {
            LoadedModel::Detector(m) => Ok(m.clone()),
            _ => Err(self.mismatch(ModelKind::Detection)),
        }
    }

    pub fn chat_model(&self) -> Result<Arc<dyn ChatModel>> {
        match &self.model {
            LoadedModel::Chat(m) => Ok(m.clone()),
            _ => Err(self.mismatch(ModelKind::Conversation)),
        }
    }

    /// Run one blocking inference call.
    ///
    /// Serialized kinds queue on their gate; the permit moves into the
    /// blocking task so it is held until the call returns even if the
    /// awaiting caller is dropped.
    pub async fn run<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let kind = self.kind();
        let permit = match &self.slot.gate {
            Some(gate) => Some(gate.clone().acquire_owned().await.map_err(|_| {
                SellerError::InferenceFailure(format!("{} inference gate closed", kind))
            })?),
            None => None,
        };

        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| SellerError::InferenceFailure(format!("{} inference panicked: {}", kind, e)))?;

        self.slot.record_inference(started.elapsed());
        result
    }

    /// Explicit release; equivalent to dropping the handle
    pub fn release(self) {}
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.slot.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TranscribeParams, Transcript};
    use crate::providers::StaticProvider;
    use std::sync::atomic::AtomicUsize;

    struct PeakTranscriber {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl PeakTranscriber {
        fn new() -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl Transcriber for PeakTranscriber {
        fn transcribe(&self, _audio: &[f32], _params: &TranscribeParams) -> Result<Transcript> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Transcript {
                text: "ok".to_string(),
                confidence: None,
            })
        }
    }

    fn params() -> TranscribeParams {
        TranscribeParams {
            language: "ar".to_string(),
            sample_rate: 16000,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_loads_once() {
        let provider = Arc::new(
            StaticProvider::new(
                "slow",
                LoadedModel::Transcriber(Arc::new(PeakTranscriber::new())),
            )
            .with_delay(Duration::from_millis(50)),
        );
        let registry = Arc::new(
            ModelRegistry::builder()
                .with_provider(provider.clone())
                .build()
                .unwrap(),
        );

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.acquire(ModelKind::Transcription).await
            }));
        }
        for task in tasks {
            let handle = task.await.unwrap().unwrap();
            assert_eq!(handle.kind(), ModelKind::Transcription);
        }

        assert_eq!(provider.load_count(), 1);
        assert_eq!(registry.health(ModelKind::Transcription).state, ModelState::Ready);
        assert_eq!(registry.health(ModelKind::Transcription).load_count, 1);
    }

    #[tokio::test]
    async fn test_failure_is_sticky_until_reload() {
        let provider = Arc::new(
            StaticProvider::new(
                "flaky",
                LoadedModel::Transcriber(Arc::new(PeakTranscriber::new())),
            )
            .failing_first(1),
        );
        let registry = ModelRegistry::builder()
            .with_provider(provider.clone())
            .build()
            .unwrap();

        let err = registry.acquire(ModelKind::Transcription).await.unwrap_err();
        assert!(matches!(err, SellerError::ModelLoad { .. }));

        // No new load attempt while failed
        let err = registry.acquire(ModelKind::Transcription).await.unwrap_err();
        assert!(matches!(err, SellerError::ModelLoad { .. }));
        assert_eq!(provider.load_count(), 1);

        let health = registry.health(ModelKind::Transcription);
        assert_eq!(health.state, ModelState::Failed);
        assert!(health.load_error.is_some());

        registry.reload(ModelKind::Transcription).await.unwrap();
        assert_eq!(provider.load_count(), 2);
        assert!(registry.is_available(ModelKind::Transcription));
    }

    #[tokio::test]
    async fn test_wait_times_out_but_load_completes() {
        let provider = Arc::new(
            StaticProvider::new(
                "slow",
                LoadedModel::Transcriber(Arc::new(PeakTranscriber::new())),
            )
            .with_delay(Duration::from_millis(200)),
        );
        let registry = ModelRegistry::builder()
            .with_provider(provider)
            .with_load_timeout(Duration::from_millis(20))
            .build()
            .unwrap();

        let err = registry.acquire(ModelKind::Transcription).await.unwrap_err();
        assert!(matches!(err, SellerError::ModelNotReady { .. }));
        assert_eq!(registry.health(ModelKind::Transcription).state, ModelState::Loading);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.health(ModelKind::Transcription).state, ModelState::Ready);
    }

    #[tokio::test]
    async fn test_missing_provider() {
        let registry = ModelRegistry::builder().build().unwrap();
        let err = registry.acquire(ModelKind::Detection).await.unwrap_err();
        assert!(matches!(err, SellerError::ModelLoad { .. }));
        assert_eq!(registry.health(ModelKind::Detection).state, ModelState::Unloaded);
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let model = LoadedModel::Transcriber(Arc::new(PeakTranscriber::new()));
        let result = ModelRegistry::builder()
            .with_provider(Arc::new(StaticProvider::new("a", model.clone())))
            .with_provider(Arc::new(StaticProvider::new("b", model)))
            .build();
        assert!(matches!(result, Err(SellerError::ConfigError(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serialized_kind_runs_one_at_a_time() {
        let transcriber = Arc::new(PeakTranscriber::new());
        let registry = Arc::new(
            ModelRegistry::builder()
                .with_provider(Arc::new(StaticProvider::new(
                    "peak",
                    LoadedModel::Transcriber(transcriber.clone()),
                )))
                .with_serialized_kinds([ModelKind::Transcription])
                .build()
                .unwrap(),
        );

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let handle = registry.acquire(ModelKind::Transcription).await?;
                let model = handle.transcriber()?;
                handle.run(move || model.transcribe(&[0.0; 16], &params())).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(transcriber.peak.load(Ordering::SeqCst), 1);
        let health = registry.health(ModelKind::Transcription);
        assert_eq!(health.inference_count, 4);
        assert!(health.serialized);
        let latency = health.latency.unwrap();
        assert_eq!(latency.samples, 4);
        assert!(latency.max_ms >= 20);
        assert!(latency.mean_ms <= latency.p95_ms && latency.p95_ms <= latency.max_ms);

        // Latency belongs to the dropped instance
        registry.shutdown();
        let health = registry.health(ModelKind::Transcription);
        assert_eq!(health.latency, None);
        assert_eq!(health.inference_count, 4);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_acquire() {
        let registry = ModelRegistry::builder()
            .with_provider(Arc::new(StaticProvider::new(
                "peak",
                LoadedModel::Transcriber(Arc::new(PeakTranscriber::new())),
            )))
            .build()
            .unwrap();

        let handle = registry.acquire(ModelKind::Transcription).await.unwrap();
        registry.shutdown();
        assert_eq!(registry.health(ModelKind::Transcription).state, ModelState::Unloaded);
        assert!(registry.acquire(ModelKind::Transcription).await.is_err());

        // A handle taken before shutdown still works
        let model = handle.transcriber().unwrap();
        let out = handle.run(move || model.transcribe(&[], &params())).await.unwrap();
        assert_eq!(out.text, "ok");
    }

    #[test]
    fn test_builder_rejects_unrepresentable_timeout() {
        let config = ModelsConfig {
            load_timeout_secs: 1e30,
            ..ModelsConfig::default()
        };
        assert!(matches!(
            ModelRegistryBuilder::from_config(&config),
            Err(SellerError::ConfigError(_))
        ));

        let config = ModelsConfig {
            load_timeout_secs: 2.5,
            ..ModelsConfig::default()
        };
        let registry = ModelRegistryBuilder::from_config(&config).unwrap().build().unwrap();
        assert_eq!(registry.load_timeout(), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_handle_kind_mismatch() {
        let registry = ModelRegistry::builder()
            .with_provider(Arc::new(StaticProvider::new(
                "peak",
                LoadedModel::Transcriber(Arc::new(PeakTranscriber::new())),
            )))
            .build()
            .unwrap();
        let handle = registry.acquire(ModelKind::Transcription).await.unwrap();
        assert!(handle.synthesizer().is_err());
        assert!(handle.transcriber().is_ok());
        handle.release();
        assert!(registry.health(ModelKind::Transcription).last_used_at.is_some());
    }
}
