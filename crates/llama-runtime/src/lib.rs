//! # llama-runtime
//!
//! Bounded-context generation and benchmarking for llama.rs.
//!
//! - [`generate`]: the per-prompt generation loop with sliding eviction
//! - [`benchmark`]: sequential multi-prompt sessions and rate-correct aggregation
//! - [`telemetry`]: per-run timing counters and hooks
//! - [`config`]: generation and benchmark configuration
//! - [`prompts`]: prompt files and random prompts
//! - [`mock`]: deterministic in-process engine

pub mod benchmark;
pub mod config;
pub mod error;
pub mod generate;
pub mod mock;
pub mod prompts;
pub mod telemetry;

pub use benchmark::{AggregateTimings, Benchmark, BenchmarkAggregator, BenchmarkReport};
pub use config::{read_json_file, BenchConfig, ConfigWarning, ErrorPolicy, GenerationConfig};
pub use error::{BenchError, ConfigError, RunError, RunResult};
pub use generate::{generate, GenerationLoop, LoopState, RunOutcome, StopReason};
pub use mock::MockEngine;
pub use prompts::{load_prompt_file, random_prompts, Prompt};
pub use telemetry::{LogTelemetry, NoopTelemetry, RunTimer, RunTimings, TelemetryHook};
