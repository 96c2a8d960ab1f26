//! Background expiry of idle records
//!
//! A worker thread wakes every reap interval and removes idle chat sessions,
//! finished tracking jobs and abandoned transcription streams.

use crate::integration::config::AppConfig;
use crate::messages::SessionStore;
use crate::speech::ChunkAssembler;
use crate::tracking::TrackingController;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Commands accepted by the janitor thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JanitorCommand {
    /// Sweep immediately instead of waiting for the next tick
    SweepNow,

    Shutdown,
}

/// Records removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub jobs: usize,
    pub streams: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.sessions + self.jobs + self.streams
    }
}

/// The stores a sweep visits and how long each kind of record may idle
#[derive(Clone)]
pub struct SweepTargets {
    pub sessions: Arc<SessionStore>,
    pub tracking: Arc<TrackingController>,
    pub assembler: Arc<ChunkAssembler>,
    pub session_ttl: Duration,
    pub job_ttl: Duration,
    pub stream_ttl: Duration,
}

impl SweepTargets {
    /// Targets with the TTLs from the configuration
    pub fn from_config(
        config: &AppConfig,
        sessions: Arc<SessionStore>,
        tracking: Arc<TrackingController>,
        assembler: Arc<ChunkAssembler>,
    ) -> Self {
        Self {
            sessions,
            tracking,
            assembler,
            session_ttl: config.sessions.ttl(),
            job_ttl: config.sessions.job_ttl(),
            stream_ttl: Duration::from_secs(config.stt.max_stream_idle_secs),
        }
    }

    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            sessions: self.sessions.reap_idle(self.session_ttl),
            jobs: self.tracking.reap_finished(self.job_ttl),
            streams: self.assembler.reap_idle(self.stream_ttl),
        };
        if report.total() > 0 {
            info!(
                "Expired {} sessions, {} tracking jobs, {} streams",
                report.sessions, report.jobs, report.streams
            );
        }
        report
    }
}

pub struct Janitor {
    command_tx: Sender<JanitorCommand>,
    report_rx: Receiver<SweepReport>,
    worker: Option<JoinHandle<()>>,
}

impl Janitor {
    /// Start the worker thread
    pub fn spawn(targets: SweepTargets, interval: Duration) -> std::io::Result<Self> {
        let (command_tx, command_rx) = bounded(8);
        let (report_tx, report_rx) = bounded(16);

        let worker = std::thread::Builder::new()
            .name("seller-janitor".to_string())
            .spawn(move || run_worker(targets, interval, command_rx, report_tx))?;
        info!("Janitor started (interval {:?})", interval);

        Ok(Self {
            command_tx,
            report_rx,
            worker: Some(worker),
        })
    }

    /// Request an immediate sweep
    pub fn sweep_now(&self) {
        if self.command_tx.send(JanitorCommand::SweepNow).is_err() {
            warn!("Janitor is not running");
        }
    }

    /// Reports of completed sweeps; old reports are dropped when nobody reads
    pub fn reports(&self) -> Receiver<SweepReport> {
        self.report_rx.clone()
    }

    /// Stop the worker and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.command_tx.send(JanitorCommand::Shutdown);
            if worker.join().is_err() {
                warn!("Janitor thread panicked");
            }
            info!("Janitor stopped");
        }
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    targets: SweepTargets,
    interval: Duration,
    commands: Receiver<JanitorCommand>,
    reports: Sender<SweepReport>,
) {
    loop {
        match commands.recv_timeout(interval) {
            Ok(JanitorCommand::SweepNow) | Err(RecvTimeoutError::Timeout) => {
                let report = targets.sweep();
                debug!("Sweep finished: {:?}", report);
                let _ = reports.try_send(report);
            }
            Ok(JanitorCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
