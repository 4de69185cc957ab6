//! Per-run timing counters and telemetry hooks.
//!
//! Provides:
//! - [`RunTimings`] — load, sample, prompt-eval and eval counters for one prompt
//! - [`TelemetryHook`] trait — callback interface for real-time reporting
//! - [`RunTimer`] — accumulates durations into a [`RunTimings`] and fires hooks
//! - [`NoopTelemetry`] / [`LogTelemetry`] — built-in hook implementations

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Timing counters of a single prompt run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTimings {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Time to create the run's engine context.
    pub load_ms: f64,
    pub sample_ms: f64,
    pub sample_count: usize,
    pub prompt_eval_ms: f64,
    pub prompt_eval_count: usize,
    pub eval_ms: f64,
    /// Generated tokens that were decoded. At least 1 once a token was
    /// sampled, so an EOS-first run still counts one.
    pub eval_count: usize,
}

impl RunTimings {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            ended_at: started_at,
            load_ms: 0.0,
            sample_ms: 0.0,
            sample_count: 0,
            prompt_eval_ms: 0.0,
            prompt_eval_count: 0,
            eval_ms: 0.0,
            eval_count: 0,
        }
    }

    /// Wall-clock duration of the run in milliseconds.
    pub fn wall_ms(&self) -> f64 {
        (self.ended_at - self.started_at)
            .num_microseconds()
            .map_or(0.0, |us| us as f64 / 1000.0)
    }
}

/// Callback trait for real-time run telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called after a batch of prompt tokens was evaluated.
    fn on_prompt_evaluated(&self, _n_tokens: usize, _elapsed_ms: f64) {}

    /// Called after each sampled token. `token_idx` is 1-based.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when a run finishes, successfully or not, with its timings.
    fn on_run_complete(&self, _timings: &RunTimings) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Collects the timings of every completed run.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    runs: Arc<Mutex<Vec<RunTimings>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timings of all runs seen so far, in completion order.
    pub fn runs(&self) -> Vec<RunTimings> {
        match self.runs.lock() {
            Ok(runs) => runs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Timings of the most recent run.
    pub fn last_run(&self) -> Option<RunTimings> {
        self.runs().pop()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_run_complete(&self, timings: &RunTimings) {
        tracing::debug!(
            prompt_eval_count = timings.prompt_eval_count,
            eval_count = timings.eval_count,
            wall_ms = timings.wall_ms(),
            "run complete"
        );
        match self.runs.lock() {
            Ok(mut runs) => runs.push(timings.clone()),
            Err(poisoned) => poisoned.into_inner().push(timings.clone()),
        }
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Accumulates the timings of one run.
///
/// Usage:
/// 1. [`RunTimer::new`] at run start
/// 2. `record_*` as the generation loop progresses
/// 3. [`RunTimer::finish`] to stamp the end time and fire `on_run_complete`
pub struct RunTimer {
    timings: RunTimings,
    n_generated: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl RunTimer {
    pub fn new(hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            timings: RunTimings::new(Utc::now()),
            n_generated: 0,
            hook,
        }
    }

    pub fn record_load(&mut self, elapsed: Duration) {
        self.timings.load_ms += as_ms(elapsed);
    }

    pub fn record_sample(&mut self, elapsed: Duration) {
        self.timings.sample_ms += as_ms(elapsed);
        self.timings.sample_count += 1;
    }

    pub fn record_prompt_eval(&mut self, n_tokens: usize, elapsed: Duration) {
        let ms = as_ms(elapsed);
        self.timings.prompt_eval_ms += ms;
        self.timings.prompt_eval_count += n_tokens;
        self.hook.on_prompt_evaluated(n_tokens, ms);
    }

    /// A decoded batch of generated tokens.
    pub fn record_eval(&mut self, n_tokens: usize, elapsed: Duration) {
        self.timings.eval_ms += as_ms(elapsed);
        self.timings.eval_count += n_tokens;
    }

    /// A sampled token, whether or not it will be decoded.
    pub fn record_generated(&mut self) {
        self.n_generated += 1;
        let elapsed_ms = (Utc::now() - self.timings.started_at)
            .num_microseconds()
            .map_or(0.0, |us| us as f64 / 1000.0);
        self.hook.on_token_generated(self.n_generated, elapsed_ms);
    }

    /// Timings accumulated so far.
    pub fn snapshot(&self) -> &RunTimings {
        &self.timings
    }

    /// Stamp the end time and fire `on_run_complete`.
    pub fn finish(mut self) -> RunTimings {
        if self.n_generated > 0 {
            self.timings.eval_count = self.timings.eval_count.max(1);
        }
        self.timings.ended_at = Utc::now();
        self.hook.on_run_complete(&self.timings);
        self.timings
    }
}
