//! Per-turn throughput measurement.
//!
//! A [`TurnTimer`] is started once the prompt is encoded, marked when
//! prefill completes and after every decode step, and finished with the
//! working-memory length the turn reached. The resulting
//! [`GenerationReport`] goes to the turn's [`TelemetryHook`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Summary of one prompt-to-response turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationReport {
    /// Tokens fed during prefill.
    pub prompt_tokens: usize,
    /// Tokens produced by decode steps, stop token included.
    pub generated_tokens: usize,
    /// Time until prefill finished, in milliseconds.
    pub ttft_ms: f64,
    /// Decode throughput. Excludes prefill.
    pub tokens_per_sec: f64,
    pub total_time_ms: f64,
    /// Working-memory length before the prompt was fed.
    pub start_offset: usize,
    /// Working-memory length after the last generated token.
    pub end_offset: usize,
}

impl GenerationReport {
    /// Positions this turn added to working memory.
    pub fn memory_growth(&self) -> usize {
        self.end_offset.saturating_sub(self.start_offset)
    }
}

/// Observer for a generation turn. Every callback is optional.
pub trait TelemetryHook: Send + Sync {
    fn on_prefill(&self, _prompt_tokens: usize, _elapsed: Duration) {}

    /// Called after each decode step with the running token count.
    fn on_step(&self, _generated: usize) {}

    fn on_turn(&self, _report: &GenerationReport) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Logs each finished turn and keeps the most recent report.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    latest: Arc<Mutex<Option<GenerationReport>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_report(&self) -> Option<GenerationReport> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_prefill(&self, prompt_tokens: usize, elapsed: Duration) {
        tracing::debug!(prompt_tokens, elapsed_ms = millis(elapsed), "Prefill done");
    }

    fn on_turn(&self, report: &GenerationReport) {
        tracing::info!(
            generated_tokens = report.generated_tokens,
            tokens_per_sec = report.tokens_per_sec,
            memory_growth = report.memory_growth(),
            "Turn finished"
        );
        let mut latest = self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *latest = Some(report.clone());
    }
}

/// Clock for a single turn.
pub struct TurnTimer {
    started: Instant,
    ttft: Option<Duration>,
    prompt_tokens: usize,
    generated: usize,
    start_offset: usize,
    hook: Box<dyn TelemetryHook>,
}

impl TurnTimer {
    pub fn start(prompt_tokens: usize, start_offset: usize, hook: Box<dyn TelemetryHook>) -> Self {
        Self {
            started: Instant::now(),
            ttft: None,
            prompt_tokens,
            generated: 0,
            start_offset,
            hook,
        }
    }

    pub fn prefill_done(&mut self) {
        let elapsed = self.started.elapsed();
        self.ttft = Some(elapsed);
        self.hook.on_prefill(self.prompt_tokens, elapsed);
    }

    pub fn step_done(&mut self) {
        self.generated += 1;
        self.hook.on_step(self.generated);
    }

    /// Close the turn at working-memory length `end_offset`.
    pub fn finish(self, end_offset: usize) -> GenerationReport {
        let total = self.started.elapsed();
        let ttft = self.ttft.unwrap_or_default();
        let decode = total.saturating_sub(ttft);

        let tokens_per_sec = match decode.as_secs_f64() {
            secs if secs > 0.0 && self.generated > 0 => self.generated as f64 / secs,
            _ => 0.0,
        };

        let report = GenerationReport {
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.generated,
            ttft_ms: millis(ttft),
            tokens_per_sec,
            total_time_ms: millis(total),
            start_offset: self.start_offset,
            end_offset,
        };
        self.hook.on_turn(&report);
        report
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
