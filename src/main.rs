use anyhow::{Context, Result};
use seller_agent::integration::{
    AppConfig, InteractionEvent, InteractionInput, InteractionOrchestrator, Janitor, SweepTargets,
};
use seller_agent::llm::ChatService;
use seller_agent::messages::SessionStore;
use seller_agent::models::{LoadedModel, ModelRegistry, ModelRegistryBuilder};
use seller_agent::providers::{
    FixedStatusAnalyzer, ScriptedDetector, ScriptedTranscriber, StaticProvider, TemplateChatModel,
    ToneSynthesizer,
};
use seller_agent::speech::codec::f32_to_pcm16;
use seller_agent::speech::{AudioChunk, ChunkAssembler, ChunkEmitter};
use seller_agent::tracking::{AssetRef, ParamOverrides, TrackingController};
use seller_agent::wire::{ChatResponseOut, ErrorPayload, TrackingProcessResponse, TrackingUploadResponse};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn build_registry(config: &AppConfig) -> seller_agent::Result<ModelRegistry> {
    ModelRegistryBuilder::from_config(&config.models)?
        .with_provider(Arc::new(StaticProvider::new(
            "scripted-stt",
            LoadedModel::Transcriber(Arc::new(ScriptedTranscriber::new(
                "أبحث عن تمر طازج من فضلك",
            ))),
        )))
        .with_provider(Arc::new(StaticProvider::new(
            "tone-tts",
            LoadedModel::Synthesizer(Arc::new(
                ToneSynthesizer::default().with_sample_rate(config.tts.sample_rate),
            )),
        )))
        .with_provider(Arc::new(StaticProvider::new(
            "scripted-detector",
            LoadedModel::Detector(Arc::new(ScriptedDetector::shoppers())),
        )))
        .with_provider(Arc::new(StaticProvider::new(
            "template-chat",
            LoadedModel::Chat(Arc::new(TemplateChatModel)),
        )))
        .build()
}

/// One and a half seconds of low noise split into half-second chunks
fn demo_utterance(config: &AppConfig) -> Vec<AudioChunk> {
    let rate = config.stt.sample_rate;
    (0..3u64)
        .map(|index| AudioChunk {
            index,
            payload: f32_to_pcm16(&vec![0.05; rate as usize / 2]),
            is_final: index == 2,
            language: config.stt.default_language.clone(),
            sample_rate: rate,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting seller agent");

    let registry = Arc::new(build_registry(&config)?);
    for health in registry.initialize().await {
        if !health.is_available() {
            warn!(
                "{} model unavailable: {}",
                health.kind,
                health.load_error.as_deref().unwrap_or("not loaded")
            );
        }
    }

    let sessions = Arc::new(SessionStore::new());
    let tracking = Arc::new(TrackingController::new(registry.clone(), config.tracking.clone()));
    let assembler = Arc::new(ChunkAssembler::new(registry.clone(), config.stt.clone()));
    let emitter = Arc::new(ChunkEmitter::new(registry.clone(), config.tts.clone()));
    let chat = Arc::new(ChatService::new(sessions.clone(), registry.clone(), config.chat.clone()));

    let janitor = Janitor::spawn(
        SweepTargets::from_config(&config, sessions.clone(), tracking.clone(), assembler.clone()),
        config.sessions.reap_interval(),
    )?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let orchestrator = InteractionOrchestrator::new(
        tracking.clone(),
        assembler,
        emitter,
        chat,
        Arc::new(FixedStatusAnalyzer::default()),
    )
    .with_event_sender(event_tx);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let InteractionEvent::StepFailed { step, error } = event {
                warn!("Interaction step {} failed: {}", step, error.user_message());
            }
        }
    });

    let job = tracking.upload(
        AssetRef::new("video.mp4", std::env::temp_dir().join("video.mp4")),
        ParamOverrides::default(),
    )?;
    println!("{}", serde_json::to_string_pretty(&TrackingUploadResponse::from(&job))?);

    let input = InteractionInput {
        job_id: job.id,
        language: config.stt.default_language.clone(),
        audio: demo_utterance(&config),
        frame: vec![0u8; 64],
        session_id: None,
    };

    match orchestrator.run(input).await {
        Ok(outcome) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&TrackingProcessResponse::from(&outcome.detection))?
            );
            println!("{}", serde_json::to_string_pretty(&ChatResponseOut::from(&outcome.reply))?);
            info!(
                "Greeting {:.2}s, reply {:.2}s of audio; shopper waited {}ms for the answer",
                outcome.greeting.duration_secs,
                outcome.speech.duration_secs,
                outcome.metrics.response_latency_ms().unwrap_or(0)
            );
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&ErrorPayload::from(&e))?);
        }
    }

    for health in registry.health_all() {
        match health.latency {
            Some(latency) => info!(
                "{}: {}, {} inferences, mean {}ms, p95 {}ms, max {}ms",
                health.kind,
                health.state.as_str(),
                health.inference_count,
                latency.mean_ms,
                latency.p95_ms,
                latency.max_ms
            ),
            None => info!("{}: {}, no inferences", health.kind, health.state.as_str()),
        }
    }

    janitor.stop();
    registry.shutdown();
    info!("Seller agent stopped");
    Ok(())
}
