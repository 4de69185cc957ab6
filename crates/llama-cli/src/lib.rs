//! # llama-cli
//!
//! Command-line benchmark driver for llama.rs.
//!
//! Wires: prompt source → tokenizer → generation loop → timing aggregate.
//! Runs against the deterministic in-process engine from `llama-runtime`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use llama_engine::LlamaError;
use llama_runtime::{
    load_prompt_file, read_json_file, Benchmark, BenchConfig, BenchmarkReport, ConfigError,
    ErrorPolicy, MockEngine,
};

/// Tokens per prompt when neither the command line nor the config file says.
pub const DEFAULT_N_PREDICT: i32 = 128;

/// Errors from the benchmark driver.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("engine error: {0}")]
    Engine(#[from] LlamaError),
}

/// llama.rs — bounded-context generation benchmark
#[derive(Debug, Parser)]
#[command(name = "llama-cli")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run every prompt through the generation loop and report timings.
    Bench(BenchArgs),
}

#[derive(Debug, Clone, Args)]
pub struct BenchArgs {
    /// File with one prompt per line. Random prompts are used when omitted.
    #[arg(short = 'f', long)]
    pub prompt_file: Option<PathBuf>,

    /// JSON config file; command-line flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of random prompts when no prompt file is given.
    #[arg(long)]
    pub random_prompts: Option<usize>,

    /// Context size (0 = model training context).
    #[arg(short = 'c', long)]
    pub n_ctx: Option<usize>,

    /// Batch size for prompt processing.
    #[arg(short = 'b', long)]
    pub n_batch: Option<usize>,

    /// Prompt tokens protected from eviction (-1 = whole prompt).
    #[arg(long = "keep", allow_negative_numbers = true)]
    pub n_keep: Option<i32>,

    /// Tokens to generate (-1 = until EOS, -2 = until EOS or context full) [default: 128].
    #[arg(short = 'n', long, allow_negative_numbers = true)]
    pub n_predict: Option<i32>,

    /// Sampling temperature (0 = greedy).
    #[arg(long)]
    pub temp: Option<f32>,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub top_p: Option<f32>,

    /// Penalty applied to recently seen tokens (1.0 = disabled).
    #[arg(long)]
    pub repeat_penalty: Option<f32>,

    /// How many recent tokens the repeat penalty looks at.
    #[arg(long)]
    pub repeat_last_n: Option<usize>,

    /// RNG seed (default: from the clock).
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Log every prompt token before generating.
    #[arg(long)]
    pub verbose_prompt: bool,

    /// Skip failing prompts instead of aborting the benchmark.
    #[arg(long)]
    pub skip_errors: bool,

    /// Vocabulary size of the demo engine.
    #[arg(long, default_value_t = 32_000)]
    pub n_vocab: usize,

    /// Training context length reported by the demo engine.
    #[arg(long, default_value_t = 2048)]
    pub n_ctx_train: usize,
}

impl BenchArgs {
    /// Merge the optional config file with command-line overrides.
    pub fn to_config(&self) -> Result<BenchConfig, CliError> {
        let (mut config, file_sets_n_predict) = match &self.config {
            Some(path) => {
                let file = read_json_file(path)?;
                let sets_n_predict = file.pointer("/generation/n_predict").is_some();
                (BenchConfig::from_json_value(file)?, sets_n_predict)
            }
            None => (BenchConfig::default(), false),
        };

        let generation = &mut config.generation;
        if let Some(n_ctx) = self.n_ctx {
            generation.n_ctx = n_ctx;
        }
        if let Some(n_batch) = self.n_batch {
            generation.n_batch = n_batch;
        }
        if let Some(n_keep) = self.n_keep {
            generation.n_keep = n_keep;
        }
        match self.n_predict {
            Some(n_predict) => generation.n_predict = n_predict,
            None if !file_sets_n_predict => generation.n_predict = DEFAULT_N_PREDICT,
            None => {}
        }
        generation.verbose_prompt |= self.verbose_prompt;

        let sampling = &mut generation.sampling;
        if let Some(temp) = self.temp {
            sampling.temperature = temp;
        }
        if let Some(top_k) = self.top_k {
            sampling.top_k = top_k;
        }
        if let Some(top_p) = self.top_p {
            sampling.top_p = top_p;
        }
        if let Some(penalty) = self.repeat_penalty {
            sampling.repetition_penalty = penalty;
        }
        if let Some(last_n) = self.repeat_last_n {
            sampling.penalty_last_n = last_n;
        }
        if let Some(seed) = self.seed {
            sampling.seed = seed;
        }

        if let Some(n) = self.random_prompts {
            config.random_prompts = n;
        }
        if self.skip_errors {
            config.error_policy = ErrorPolicy::SkipAndContinue;
        }
        Ok(config)
    }

    pub fn engine(&self) -> MockEngine {
        MockEngine::new(self.n_vocab).with_n_ctx_train(self.n_ctx_train)
    }
}

/// Load prompts, run the benchmark and return its report.
pub fn run_bench(args: &BenchArgs) -> Result<BenchmarkReport, CliError> {
    let config = args.to_config()?;
    let texts = match &args.prompt_file {
        Some(path) => load_prompt_file(path)?,
        None => Vec::new(),
    };

    let engine = args.engine();
    let bench = Benchmark::new(&engine, config);
    let prompts = bench.prepare_prompts(texts)?;
    Ok(bench.run(&prompts))
}
