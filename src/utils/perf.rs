//! Latency bookkeeping for model calls and shopper interactions

use crate::InteractionStep;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// The most recent inference durations of one model kind
#[derive(Debug)]
pub struct LatencyWindow {
    recent: VecDeque<Duration>,
    capacity: usize,
}

/// Aggregates over a [`LatencyWindow`], in whole milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub mean_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add one call; the oldest call falls out once the window is full
    pub fn record(&mut self, took: Duration) {
        while self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(took);
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    /// Forget every sample, e.g. when the model instance is replaced
    pub fn reset(&mut self) {
        self.recent.clear();
    }

    /// `None` until something was recorded. The p95 uses nearest rank.
    pub fn stats(&self) -> Option<LatencyStats> {
        if self.recent.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self
            .recent
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        sorted.sort_unstable();

        let samples = sorted.len();
        let total: u64 = sorted.iter().sum();
        let rank = (samples * 95).div_ceil(100).max(1);
        Some(LatencyStats {
            samples,
            mean_ms: total / samples as u64,
            p95_ms: sorted[rank - 1],
            max_ms: sorted[samples - 1],
        })
    }
}

/// Wall-clock timer. `lap` splits the run into consecutive legs.
#[derive(Debug)]
pub struct Stopwatch {
    started: Instant,
    last_lap: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_lap: now,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    /// Time since the previous lap, or since start for the first one
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let leg = now.saturating_duration_since(self.last_lap);
        self.last_lap = now;
        leg
    }
}

/// Per-step latency of one shopper interaction
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionMetrics {
    pub detect_ms: Option<u64>,
    pub greet_ms: Option<u64>,
    pub listen_ms: Option<u64>,
    pub analyze_ms: Option<u64>,
    pub chat_ms: Option<u64>,
    pub speak_ms: Option<u64>,
}

impl InteractionMetrics {
    pub fn record(&mut self, step: InteractionStep, took: Duration) {
        *self.slot_mut(step) = Some(took.as_millis() as u64);
    }

    pub fn get(&self, step: InteractionStep) -> Option<u64> {
        match step {
            InteractionStep::Detect => self.detect_ms,
            InteractionStep::Greet => self.greet_ms,
            InteractionStep::Listen => self.listen_ms,
            InteractionStep::Analyze => self.analyze_ms,
            InteractionStep::Chat => self.chat_ms,
            InteractionStep::Speak => self.speak_ms,
        }
    }

    fn slot_mut(&mut self, step: InteractionStep) -> &mut Option<u64> {
        match step {
            InteractionStep::Detect => &mut self.detect_ms,
            InteractionStep::Greet => &mut self.greet_ms,
            InteractionStep::Listen => &mut self.listen_ms,
            InteractionStep::Analyze => &mut self.analyze_ms,
            InteractionStep::Chat => &mut self.chat_ms,
            InteractionStep::Speak => &mut self.speak_ms,
        }
    }

    pub fn total_ms(&self) -> u64 {
        InteractionStep::ALL.iter().filter_map(|&step| self.get(step)).sum()
    }

    /// What the shopper waits after they stop talking: reply generation
    /// plus speaking it. `None` until both steps ran.
    pub fn response_latency_ms(&self) -> Option<u64> {
        Some(self.chat_ms? + self.speak_ms?)
    }

    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = InteractionStep::ALL
            .iter()
            .filter_map(|&step| self.get(step).map(|ms| format!("{} {}ms", step, ms)))
            .collect();
        if let Some(reply) = self.response_latency_ms() {
            parts.push(format!("reply {}ms", reply));
        }
        parts.push(format!("total {}ms", self.total_ms()));
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_of(millis: &[u64], capacity: usize) -> LatencyWindow {
        let mut window = LatencyWindow::new(capacity);
        for &ms in millis {
            window.record(Duration::from_millis(ms));
        }
        window
    }

    #[test]
    fn test_latency_stats() {
        assert_eq!(LatencyWindow::new(8).stats(), None);

        let stats = window_of(&[40, 10, 30, 20], 8).stats().unwrap();
        assert_eq!(stats.samples, 4);
        assert_eq!(stats.mean_ms, 25);
        assert_eq!(stats.p95_ms, 40);
        assert_eq!(stats.max_ms, 40);

        // Nearest rank over twenty samples lands on the 19th
        let ramp: Vec<u64> = (1..=20).collect();
        assert_eq!(window_of(&ramp, 32).stats().unwrap().p95_ms, 19);
    }

    #[test]
    fn test_latency_window_evicts_oldest() {
        let mut window = window_of(&[500, 10, 20, 30], 3);
        assert_eq!(window.len(), 3);
        assert_eq!(window.stats().unwrap().max_ms, 30);

        window.reset();
        assert!(window.is_empty());
        assert_eq!(window.stats(), None);
    }

    #[test]
    fn test_stopwatch_laps() {
        let mut sw = Stopwatch::start();
        std::thread::sleep(Duration::from_millis(10));
        let first = sw.lap();
        let second = sw.lap();

        assert!(first >= Duration::from_millis(10));
        assert!(second < first);
        assert!(sw.elapsed() >= first + second);
    }

    #[test]
    fn test_interaction_metrics() {
        let mut metrics = InteractionMetrics::default();
        metrics.record(InteractionStep::Detect, Duration::from_millis(120));
        metrics.record(InteractionStep::Chat, Duration::from_millis(450));
        assert_eq!(metrics.response_latency_ms(), None);

        metrics.record(InteractionStep::Speak, Duration::from_millis(250));
        assert_eq!(metrics.get(InteractionStep::Listen), None);
        assert_eq!(metrics.total_ms(), 820);
        assert_eq!(metrics.response_latency_ms(), Some(700));
        assert_eq!(
            metrics.summary(),
            "detect 120ms, chat 450ms, speak 250ms, reply 700ms, total 820ms"
        );
    }
}
