//! Configuration for generation runs and benchmark sessions.

use std::path::Path;

use llama_kv::{OverflowPolicy, MIN_CTX};
use llama_sampling::{SamplingConfig, DEFAULT_SEED};
use serde::Deserialize;

use crate::error::ConfigError;

/// `n_predict` value meaning "generate until EOS".
pub const N_PREDICT_UNBOUNDED: i32 = -1;

/// `n_predict` value meaning "generate until EOS or the context is full".
pub const N_PREDICT_UNTIL_FULL: i32 = -2;

/// Per-run generation parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Context size. 0 = the model's training context.
    pub n_ctx: usize,

    /// Maximum tokens per engine decode call.
    pub n_batch: usize,

    /// Leading prompt tokens protected from eviction.
    /// Negative or larger than the prompt = the whole prompt.
    pub n_keep: i32,

    /// Tokens to generate: `>= 0` limit, [`N_PREDICT_UNBOUNDED`],
    /// or [`N_PREDICT_UNTIL_FULL`].
    pub n_predict: i32,

    /// Prefix prompts with BOS. `None` = ask the engine.
    pub add_bos: Option<bool>,

    /// Log every prompt token and the protected prefix.
    pub verbose_prompt: bool,

    pub sampling: SamplingConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_batch: 512,
            n_keep: 0,
            n_predict: N_PREDICT_UNBOUNDED,
            add_bos: None,
            verbose_prompt: false,
            sampling: SamplingConfig::default(),
        }
    }
}

/// Adjustment made while normalizing a config. Non-fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigWarning {
    #[error("minimum context size is {min}, using minimum size (requested {requested})")]
    ContextClamped { requested: usize, min: usize },
    #[error("model was trained on only {n_ctx_train} context tokens ({n_ctx} specified)")]
    ExceedsTrainingContext { n_ctx: usize, n_ctx_train: usize },
    #[error("n_batch {requested} adjusted to {used}")]
    BatchClamped { requested: usize, used: usize },
}

impl GenerationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_n_ctx(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_n_keep(mut self, n_keep: i32) -> Self {
        self.n_keep = n_keep;
        self
    }

    pub fn with_n_predict(mut self, n_predict: i32) -> Self {
        self.n_predict = n_predict;
        self
    }

    pub fn with_add_bos(mut self, add_bos: bool) -> Self {
        self.add_bos = Some(add_bos);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    /// Generation budget; `None` is unbounded.
    pub fn max_tokens(&self) -> Option<usize> {
        usize::try_from(self.n_predict).ok()
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        if self.n_predict == N_PREDICT_UNTIL_FULL {
            OverflowPolicy::Stop
        } else {
            OverflowPolicy::Evict
        }
    }

    /// Protected prefix length for a prompt of `prompt_len` tokens.
    pub fn resolve_n_keep(&self, prompt_len: usize) -> usize {
        match usize::try_from(self.n_keep) {
            Ok(n) if n <= prompt_len => n,
            _ => prompt_len,
        }
    }

    /// Raise `n_ctx` to [`MIN_CTX`] and fit `n_batch` into `[1, n_ctx]`.
    ///
    /// Returns the adjustments made without logging them.
    pub fn clamp_limits(&mut self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.n_ctx < MIN_CTX {
            warnings.push(ConfigWarning::ContextClamped {
                requested: self.n_ctx,
                min: MIN_CTX,
            });
            self.n_ctx = MIN_CTX;
        }

        let n_batch = self.n_batch.clamp(1, self.n_ctx);
        if n_batch != self.n_batch {
            warnings.push(ConfigWarning::BatchClamped {
                requested: self.n_batch,
                used: n_batch,
            });
            self.n_batch = n_batch;
        }
        warnings
    }

    /// Fill in model-derived defaults and clamp out-of-range values.
    ///
    /// Returns the adjustments made; each is also logged.
    pub fn normalize(&mut self, n_ctx_train: usize) -> Vec<ConfigWarning> {
        if self.n_ctx == 0 {
            self.n_ctx = n_ctx_train;
        }
        let mut warnings = self.clamp_limits();
        if n_ctx_train > 0 && self.n_ctx > n_ctx_train {
            warnings.push(ConfigWarning::ExceedsTrainingContext {
                n_ctx: self.n_ctx,
                n_ctx_train,
            });
        }

        if self.sampling.seed == DEFAULT_SEED {
            self.sampling.seed = chrono::Utc::now().timestamp().unsigned_abs();
            tracing::info!(seed = self.sampling.seed, "seeding sampler from clock");
        }

        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        warnings
    }
}

/// What a benchmark does when a prompt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Abort the remaining prompts on the first failure.
    #[default]
    FailFast,
    /// Record the failure and move on to the next prompt.
    SkipAndContinue,
}

/// Benchmark session configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub generation: GenerationConfig,
    pub error_policy: ErrorPolicy,
    /// Number of random prompts generated when no prompt list is given.
    pub random_prompts: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            error_policy: ErrorPolicy::FailFast,
            random_prompts: 100,
        }
    }
}

impl BenchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json_value(read_json_file(path)?)
    }

    /// Build from an already parsed JSON document.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Read and parse a JSON file without interpreting it.
///
/// Callers that layer overrides on top of a file use the raw document to
/// tell fields the file sets from fields left at their defaults.
pub fn read_json_file(path: &Path) -> Result<serde_json::Value, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&data)?)
}
