//! Error types for generation runs and benchmark sessions.

use std::path::PathBuf;

use llama_engine::LlamaError;
use llama_kv::KVError;
use llama_sampling::SamplingError;

/// Errors from a single prompt run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("prompt is too long ({n_tokens} tokens, max {max})")]
    InputTooLong { n_tokens: usize, max: usize },
    #[error("failed to eval: {0}")]
    Eval(#[from] KVError),
    #[error("sampling failed: {0}")]
    Sampling(#[from] SamplingError),
    #[error("engine error: {0}")]
    Engine(#[from] LlamaError),
}

impl RunError {
    /// Whether the run had started generating when it failed.
    ///
    /// Such runs carry partial timings that still belong in the aggregate.
    pub fn is_mid_run(&self) -> bool {
        matches!(self, RunError::Eval(_) | RunError::Sampling(_))
    }
}

pub type RunResult<T> = std::result::Result<T, RunError>;

/// A run failure attributed to its prompt.
#[derive(Debug, thiserror::Error)]
#[error("prompt {index} failed: {source}")]
pub struct BenchError {
    pub index: usize,
    #[source]
    pub source: RunError,
}

/// Errors loading configuration or prompt files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}
