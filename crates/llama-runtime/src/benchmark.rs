//! Multi-prompt benchmark sessions and timing aggregation.

use std::fmt;
use std::sync::Arc;

use llama_engine::LlamaEngine;

use crate::config::{BenchConfig, ConfigWarning, ErrorPolicy};
use crate::error::BenchError;
use crate::generate::{GenerationLoop, RunOutcome};
use crate::prompts::{random_prompts, Prompt};
use crate::telemetry::{NoopTelemetry, RunTimer, RunTimings, TelemetryHook};

/// Tokens per second for `count` tokens over `ms` milliseconds; 0 when either is zero.
fn rate(count: usize, ms: f64) -> f64 {
    if count == 0 || ms <= 0.0 {
        0.0
    } else {
        count as f64 / ms * 1000.0
    }
}

fn ms_per_token(count: usize, ms: f64) -> f64 {
    if count == 0 {
        0.0
    } else {
        ms / count as f64
    }
}

/// Field-wise sums of [`RunTimings`] over a benchmark.
///
/// Rates are always computed from the sums, never averaged per run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateTimings {
    pub n_runs: usize,
    pub load_ms: f64,
    pub sample_ms: f64,
    pub sample_count: usize,
    pub prompt_eval_ms: f64,
    pub prompt_eval_count: usize,
    pub eval_ms: f64,
    pub eval_count: usize,
    /// Span from the earliest run start to the latest run end.
    pub total_ms: f64,
}

impl AggregateTimings {
    pub fn mean_load_ms(&self) -> f64 {
        if self.n_runs == 0 {
            0.0
        } else {
            self.load_ms / self.n_runs as f64
        }
    }

    pub fn sample_rate(&self) -> f64 {
        rate(self.sample_count, self.sample_ms)
    }

    pub fn prompt_eval_rate(&self) -> f64 {
        rate(self.prompt_eval_count, self.prompt_eval_ms)
    }

    pub fn eval_rate(&self) -> f64 {
        rate(self.eval_count, self.eval_ms)
    }

    pub fn sample_ms_per_token(&self) -> f64 {
        ms_per_token(self.sample_count, self.sample_ms)
    }

    pub fn prompt_eval_ms_per_token(&self) -> f64 {
        ms_per_token(self.prompt_eval_count, self.prompt_eval_ms)
    }

    pub fn eval_ms_per_token(&self) -> f64 {
        ms_per_token(self.eval_count, self.eval_ms)
    }
}

impl fmt::Display for AggregateTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "       load time = {:10.2} ms", self.mean_load_ms())?;
        writeln!(
            f,
            "     sample time = {:10.2} ms / {:5} runs   ({:8.2} ms per token, {:8.2} tokens per second)",
            self.sample_ms,
            self.sample_count,
            self.sample_ms_per_token(),
            self.sample_rate()
        )?;
        writeln!(
            f,
            "prompt eval time = {:10.2} ms / {:5} tokens ({:8.2} ms per token, {:8.2} tokens per second)",
            self.prompt_eval_ms,
            self.prompt_eval_count,
            self.prompt_eval_ms_per_token(),
            self.prompt_eval_rate()
        )?;
        writeln!(
            f,
            "       eval time = {:10.2} ms / {:5} runs   ({:8.2} ms per token, {:8.2} tokens per second)",
            self.eval_ms,
            self.eval_count,
            self.eval_ms_per_token(),
            self.eval_rate()
        )?;
        write!(f, "      total time = {:10.2} ms", self.total_ms)
    }
}

/// Collects per-run timings for one benchmark invocation.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkAggregator {
    runs: Vec<RunTimings>,
}

impl BenchmarkAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, timings: RunTimings) {
        self.runs.push(timings);
    }

    pub fn runs(&self) -> &[RunTimings] {
        &self.runs
    }

    pub fn summarize(&self) -> AggregateTimings {
        let mut agg = AggregateTimings {
            n_runs: self.runs.len(),
            ..AggregateTimings::default()
        };
        for run in &self.runs {
            agg.load_ms += run.load_ms;
            agg.sample_ms += run.sample_ms;
            agg.sample_count += run.sample_count;
            agg.prompt_eval_ms += run.prompt_eval_ms;
            agg.prompt_eval_count += run.prompt_eval_count;
            agg.eval_ms += run.eval_ms;
            agg.eval_count += run.eval_count;
        }

        let start = self.runs.iter().map(|r| r.started_at).min();
        let end = self.runs.iter().map(|r| r.ended_at).max();
        if let (Some(start), Some(end)) = (start, end) {
            agg.total_ms = (end - start)
                .num_microseconds()
                .map_or(0.0, |us| us as f64 / 1000.0);
        }
        agg
    }
}

/// Result of a benchmark session.
#[derive(Debug)]
pub struct BenchmarkReport {
    /// Aggregate over every run that produced timings, including partial runs.
    pub summary: AggregateTimings,
    pub runs: Vec<RunTimings>,
    pub outcomes: Vec<RunOutcome>,
    /// Prompts skipped under [`ErrorPolicy::SkipAndContinue`].
    pub failures: Vec<BenchError>,
    /// The failure that stopped the session under [`ErrorPolicy::FailFast`].
    pub aborted: Option<BenchError>,
}

impl BenchmarkReport {
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.failures.is_empty()
    }
}

/// Sequential multi-prompt benchmark over one engine.
pub struct Benchmark<'e> {
    engine: &'e dyn LlamaEngine,
    config: BenchConfig,
    warnings: Vec<ConfigWarning>,
    hook: Arc<dyn TelemetryHook>,
}

impl<'e> Benchmark<'e> {
    /// Normalize `config` against the engine; adjustments are logged.
    pub fn new(engine: &'e dyn LlamaEngine, mut config: BenchConfig) -> Self {
        let warnings = config.generation.normalize(engine.n_ctx_train());
        tracing::debug!("n_ctx: {}", config.generation.n_ctx);
        Self {
            engine,
            config,
            warnings,
            hook: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn warnings(&self) -> &[ConfigWarning] {
        &self.warnings
    }

    /// Tokenize `texts`, or random openers when `texts` is empty.
    pub fn prepare_prompts(&self, texts: Vec<String>) -> llama_engine::Result<Vec<Prompt>> {
        let texts = if texts.is_empty() {
            tracing::info!("randomly generate {} prompts", self.config.random_prompts);
            random_prompts(self.config.generation.sampling.seed, self.config.random_prompts)
        } else {
            texts
        };

        let add_bos = self
            .config
            .generation
            .add_bos
            .unwrap_or_else(|| self.engine.should_add_bos());
        tracing::debug!("add_bos: {}", add_bos);
        tracing::info!("tokenize {} prompts", texts.len());

        texts
            .into_iter()
            .map(|text| Prompt::tokenize(self.engine, text, add_bos))
            .collect()
    }

    /// Run every prompt in order, one engine context at a time.
    pub fn run(&self, prompts: &[Prompt]) -> BenchmarkReport {
        let generation = GenerationLoop::new(self.engine, self.config.generation.clone());
        let mut aggregator = BenchmarkAggregator::new();
        let mut outcomes = Vec::with_capacity(prompts.len());
        let mut failures = Vec::new();
        let mut aborted = None;

        let progress_step = (prompts.len() / 10).max(1);

        for (index, prompt) in prompts.iter().enumerate() {
            if index % progress_step == 0 {
                tracing::info!("process ({}/{}) prompt", index, prompts.len());
            }

            let mut timer = RunTimer::new(Arc::clone(&self.hook));
            match generation.run(prompt, &mut timer) {
                Ok(outcome) => {
                    aggregator.record(timer.finish());
                    outcomes.push(outcome);
                }
                Err(source) => {
                    if source.is_mid_run() {
                        aggregator.record(timer.finish());
                    }
                    let err = BenchError { index, source };
                    match self.config.error_policy {
                        ErrorPolicy::FailFast => {
                            tracing::error!("{}", err);
                            aborted = Some(err);
                            break;
                        }
                        ErrorPolicy::SkipAndContinue => {
                            tracing::warn!("{}, skipping", err);
                            failures.push(err);
                        }
                    }
                }
            }
        }

        let summary = aggregator.summarize();
        tracing::info!(
            n_runs = summary.n_runs,
            eval_rate = summary.eval_rate(),
            "benchmark finished"
        );

        BenchmarkReport {
            summary,
            runs: aggregator.runs().to_vec(),
            outcomes,
            failures,
            aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    fn timings(sample_count: usize, sample_ms: f64) -> RunTimings {
        let mut t = RunTimings::new(Utc::now());
        t.sample_count = sample_count;
        t.sample_ms = sample_ms;
        t
    }

    #[test]
    fn rates_use_summed_counters() {
        let mut agg = BenchmarkAggregator::new();
        agg.record(timings(0, 0.5));
        agg.record(timings(10, 4.5));

        let summary = agg.summarize();
        assert_eq!(summary.sample_count, 10);
        assert_eq!(summary.sample_ms, 5.0);
        assert_eq!(summary.sample_rate(), 10.0 / 5.0 * 1000.0);
        assert_eq!(summary.sample_ms_per_token(), 0.5);
    }

    #[test]
    fn zero_denominator_rates_are_zero() {
        let mut agg = BenchmarkAggregator::new();
        agg.record(timings(5, 0.0));
        agg.record(timings(3, 0.0));
        let summary = agg.summarize();
        assert_eq!(summary.sample_count, 8);
        assert_eq!(summary.sample_rate(), 0.0);
        assert_eq!(summary.eval_rate(), 0.0);
        assert_eq!(summary.prompt_eval_rate(), 0.0);
        assert_eq!(summary.eval_ms_per_token(), 0.0);
    }

    #[test]
    fn empty_aggregate_is_all_zero() {
        let summary = BenchmarkAggregator::new().summarize();
        assert_eq!(summary, AggregateTimings::default());
        assert_eq!(summary.mean_load_ms(), 0.0);
    }

    #[test]
    fn mean_load_and_total_span() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut a = RunTimings::new(start);
        a.load_ms = 4.0;
        a.ended_at = start + Duration::milliseconds(100);
        let mut b = RunTimings::new(start + Duration::milliseconds(150));
        b.load_ms = 8.0;
        b.ended_at = start + Duration::milliseconds(400);

        let mut agg = BenchmarkAggregator::new();
        agg.record(b);
        agg.record(a);
        let summary = agg.summarize();
        assert_eq!(summary.n_runs, 2);
        assert_eq!(summary.mean_load_ms(), 6.0);
        assert_eq!(summary.total_ms, 400.0);
    }

    #[test]
    fn report_layout() {
        let summary = AggregateTimings {
            n_runs: 2,
            load_ms: 10.0,
            sample_ms: 2.0,
            sample_count: 4,
            prompt_eval_ms: 8.0,
            prompt_eval_count: 16,
            eval_ms: 12.0,
            eval_count: 4,
            total_ms: 50.0,
        };
        let text = summary.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "       load time =       5.00 ms");
        assert!(lines[1].starts_with("     sample time =       2.00 ms /     4 runs"));
        assert!(lines[1].contains("2000.00 tokens per second"));
        assert!(lines[2].contains("16 tokens"));
        assert!(lines[2].contains("0.50 ms per token"));
        assert!(lines[3].contains("3.00 ms per token"));
        assert_eq!(lines[4], "      total time =      50.00 ms");
    }
}
