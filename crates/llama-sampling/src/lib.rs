//! # llama-sampling
//!
//! Sampling and decoding strategies for llama.rs.
//!
//! Supports:
//! - Greedy (argmax, `temperature == 0`)
//! - Temperature scaling
//! - Top-k filtering
//! - Top-p (nucleus) filtering
//! - Repetition penalty over a rolling window of accepted tokens
//! - Deterministic seeded RNG for reproducible generation
//!
//! [`SamplingContext`] is the per-run state: it owns a [`Sampler`] and the
//! history of accepted tokens. Prompt tokens are accepted without constraints,
//! so they act as penalty context but are never themselves checked.

use std::collections::{HashSet, VecDeque};

use llama_engine::TokenId;
use serde::Deserialize;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingError {
    InvalidLogits,
    InvalidTemperature,
    NoValidTokens,
}

impl std::fmt::Display for SamplingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplingError::InvalidLogits => write!(f, "Invalid logits array"),
            SamplingError::InvalidTemperature => write!(f, "Temperature must be >= 0"),
            SamplingError::NoValidTokens => write!(f, "No valid tokens after filtering"),
        }
    }
}

impl std::error::Error for SamplingError {}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Seed value meaning "pick one from the clock".
pub const DEFAULT_SEED: u64 = 0xFFFF_FFFF;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next raw 64-bit value.
    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for softmax scaling. 0.0 selects greedy argmax.
    pub temperature: f32,

    /// Top-K: restrict to the K most likely tokens. 0 = disabled.
    pub top_k: usize,

    /// Top-P (nucleus). 1.0 = disabled.
    pub top_p: f32,

    /// Repetition penalty (1.0 = none).
    pub repetition_penalty: f32,

    /// How many of the most recent accepted tokens the penalty looks at.
    pub penalty_last_n: usize,

    /// Capacity of the accepted-token history.
    pub n_prev: usize,

    /// RNG seed. [`DEFAULT_SEED`] is replaced by a clock-derived seed by callers.
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            repetition_penalty: 1.1,
            penalty_last_n: 64,
            n_prev: 64,
            seed: DEFAULT_SEED,
        }
    }
}

impl SamplingConfig {
    /// Greedy sampling without penalties.
    pub fn greedy() -> Self {
        SamplingConfig {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            ..Self::default()
        }
    }
}

/// Sampling strategy.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for softmax scaling. > 1.0 = more random, < 1.0 = more deterministic.
    pub temperature: f32,

    /// Top-k: only sample from top k logits.
    pub top_k: Option<usize>,

    /// Top-p (nucleus sampling): sample from smallest set of tokens with cumulative prob >= p.
    pub top_p: Option<f32>,

    /// Repetition penalty: penalize tokens that appear in history.
    pub repetition_penalty: Option<f32>,

    /// RNG state for reproducible sampling. Mutated on each call.
    rng: SeededRng,
}

impl Sampler {
    /// Create a sampler with default settings (temperature 1.0, no filters).
    pub fn new() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: None,
            rng: SeededRng::new(42),
        }
    }

    /// Build a sampler from a [`SamplingConfig`]; disabled knobs become `None`.
    pub fn from_config(config: &SamplingConfig) -> Self {
        let mut sampler = Self::new()
            .with_temperature(config.temperature)
            .with_seed(config.seed);
        if config.top_k > 0 {
            sampler = sampler.with_top_k(config.top_k);
        }
        if config.top_p < 1.0 {
            sampler = sampler.with_top_p(config.top_p);
        }
        if (config.repetition_penalty - 1.0).abs() > f32::EPSILON {
            sampler = sampler.with_repetition_penalty(config.repetition_penalty);
        }
        sampler
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = Some(penalty);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SeededRng::new(seed);
        self
    }

    /// Sample a token index from logits using configured strategy.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        self.sample_with_history(logits, &[])
    }

    /// Sample with `history` (token indices) feeding the repetition penalty.
    ///
    /// Pipeline: penalty, then greedy shortcut, then top-k, temperature,
    /// softmax and top-p over a sorted candidate list.
    pub fn sample_with_history(
        &mut self,
        logits: &[f32],
        history: &[usize],
    ) -> SamplingResult<usize> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        if self.temperature < 0.0 || self.temperature.is_nan() {
            return Err(SamplingError::InvalidTemperature);
        }

        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| Candidate { id, logit, p: 0.0 })
            .collect();

        if let Some(penalty) = self.repetition_penalty {
            penalize(&mut candidates, history, penalty);
        }

        if self.temperature == 0.0 {
            return candidates
                .iter()
                .max_by(|a, b| a.logit.total_cmp(&b.logit))
                .map(|c| c.id)
                .ok_or(SamplingError::NoValidTokens);
        }

        candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
        if let Some(k) = self.top_k.filter(|&k| k > 0) {
            candidates.truncate(k);
        }
        for c in &mut candidates {
            c.logit /= self.temperature;
        }
        softmax(&mut candidates);

        if self.temperature < 1e-3 {
            return Ok(candidates[0].id);
        }
        if let Some(p) = self.top_p {
            top_p(&mut candidates, p);
        }

        self.pick(&candidates)
    }

    /// Draw one candidate proportionally to its probability.
    fn pick(&mut self, candidates: &[Candidate]) -> SamplingResult<usize> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;
        for c in candidates {
            cumsum += c.p;
            if r < cumsum {
                return Ok(c.id);
            }
        }
        // Rounding left `r` past the last bucket.
        candidates
            .iter()
            .rev()
            .find(|c| c.p > 0.0)
            .map(|c| c.id)
            .ok_or(SamplingError::NoValidTokens)
    }
}

/// A vocabulary entry under consideration.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    id: usize,
    logit: f32,
    p: f32,
}

/// Penalize each distinct history token once. `candidates` must be in id order.
fn penalize(candidates: &mut [Candidate], history: &[usize], penalty: f32) {
    let seen: HashSet<usize> = history.iter().copied().collect();
    for id in seen {
        if let Some(c) = candidates.get_mut(id) {
            if c.logit > 0.0 {
                c.logit /= penalty;
            } else {
                c.logit *= penalty;
            }
        }
    }
}

/// Fill `p` from the logits. `candidates` must be sorted by descending logit.
fn softmax(candidates: &mut [Candidate]) {
    let Some(max) = candidates.first().map(|c| c.logit) else {
        return;
    };
    let mut sum = 0.0;
    for c in candidates.iter_mut() {
        c.p = (c.logit - max).exp();
        sum += c.p;
    }
    let n = candidates.len() as f32;
    for c in candidates.iter_mut() {
        c.p = if sum > 0.0 { c.p / sum } else { 1.0 / n };
    }
}

/// Keep the smallest prefix whose mass reaches `p`, then renormalize.
/// `candidates` must be sorted by descending probability.
fn top_p(candidates: &mut Vec<Candidate>, p: f32) {
    let mut cumsum = 0.0;
    let mut keep = candidates.len();
    for (i, c) in candidates.iter().enumerate() {
        cumsum += c.p;
        if cumsum >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));

    let mass: f32 = candidates.iter().map(|c| c.p).sum();
    if mass > 0.0 {
        for c in candidates.iter_mut() {
            c.p /= mass;
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// A token recorded by [`SamplingContext::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedToken {
    pub token: TokenId,
    /// Whether penalty/grammar rules were enforced for this token.
    pub constrained: bool,
}

/// Per-run sampling state: strategy plus rolling accepted-token history.
#[derive(Debug, Clone)]
pub struct SamplingContext {
    sampler: Sampler,
    history: VecDeque<AcceptedToken>,
    n_prev: usize,
    penalty_last_n: usize,
    n_accepted: usize,
}

impl SamplingContext {
    pub fn new(config: &SamplingConfig) -> Self {
        let n_prev = config.n_prev.max(1);
        Self {
            sampler: Sampler::from_config(config),
            history: VecDeque::with_capacity(n_prev),
            n_prev,
            penalty_last_n: config.penalty_last_n,
            n_accepted: 0,
        }
    }

    /// Record `token` in the history.
    ///
    /// With `apply_constraints == false` (prompt tokens) the token only serves
    /// as context for later penalties.
    pub fn accept(&mut self, token: TokenId, apply_constraints: bool) {
        if self.history.len() == self.n_prev {
            self.history.pop_front();
        }
        self.history.push_back(AcceptedToken {
            token,
            constrained: apply_constraints,
        });
        self.n_accepted += 1;
    }

    /// Pick the next token from `logits` given the accepted history.
    ///
    /// The caller must `accept` the result before queueing it for evaluation.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        let window: Vec<usize> = self
            .history
            .iter()
            .rev()
            .take(self.penalty_last_n)
            .filter(|a| a.token >= 0)
            .map(|a| a.token as usize)
            .collect();

        let idx = self.sampler.sample_with_history(logits, &window)?;
        TokenId::try_from(idx).map_err(|_| SamplingError::InvalidLogits)
    }

    /// Most recently accepted token.
    pub fn last(&self) -> Option<TokenId> {
        self.history.back().map(|a| a.token)
    }

    /// Accepted tokens, oldest first (bounded by `n_prev`).
    pub fn history(&self) -> impl Iterator<Item = &AcceptedToken> {
        self.history.iter()
    }

    /// Accepted tokens for which constraints were enforced.
    pub fn constrained_history(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.history
            .iter()
            .filter(|a| a.constrained)
            .map(|a| a.token)
    }

    /// Total number of tokens accepted over the run.
    pub fn n_accepted(&self) -> usize {
        self.n_accepted
    }
}
