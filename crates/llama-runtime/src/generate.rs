//! The bounded-context generation loop.
//!
//! One [`GenerationLoop::run`] call processes one prompt: it creates a fresh
//! engine context, feeds the prompt in `n_batch` chunks, then samples until
//! EOS, the token budget, or (under stop-on-full) a full context. When the
//! window fills under the default policy, half of the unprotected positions
//! are evicted and generation continues.

use std::sync::Arc;
use std::time::Instant;

use llama_engine::{tokens_to_pretty, ContextParams, LlamaEngine, Session, TokenId};
use llama_kv::{max_input_len, CapacityCheck, ContextWindow, Eviction, KVError};
use llama_sampling::SamplingContext;
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::error::{RunError, RunResult};
use crate::prompts::Prompt;
use crate::telemetry::{NoopTelemetry, RunTimer, RunTimings, TelemetryHook};

/// Why a run stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The sampler produced the end-of-sequence token.
    Eos,
    /// The token budget ran out.
    MaxTokens,
    /// The context filled up and the window is set to stop rather than evict.
    ContextFull,
}

/// Generation loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    FeedingPrompt,
    Sampling,
    Done(StopReason),
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub session_id: Uuid,
    pub stop_reason: StopReason,
    /// Prompt length after BOS substitution.
    pub prompt_tokens: usize,
    pub n_keep: usize,
    /// Sampled tokens in order, including a terminating EOS.
    pub generated: Vec<TokenId>,
    pub evictions: Vec<Eviction>,
    /// Tokens dropped by front truncation of pending batches.
    pub truncated: usize,
}

/// Runs prompts against an engine with a fixed configuration.
pub struct GenerationLoop<'e> {
    engine: &'e dyn LlamaEngine,
    config: GenerationConfig,
}

impl<'e> GenerationLoop<'e> {
    /// An `n_ctx` of zero takes the engine's training context. Context and
    /// batch sizes are clamped as in [`GenerationConfig::normalize`]; the
    /// seed and the training-context warning are left to `normalize`.
    pub fn new(engine: &'e dyn LlamaEngine, mut config: GenerationConfig) -> Self {
        if config.n_ctx == 0 {
            config.n_ctx = engine.n_ctx_train();
        }
        for warning in config.clamp_limits() {
            tracing::warn!("{}", warning);
        }
        Self { engine, config }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate from one prompt, recording timings into `timer`.
    ///
    /// # Errors
    /// - `InputTooLong`: the prompt exceeds `n_ctx - 4` tokens; nothing was evaluated
    /// - `Engine`: the context could not be created
    /// - `Eval`: a decode failed; no retry
    /// - `Sampling`: the sampler rejected the logits
    ///
    /// On `Eval` and `Sampling` the timer holds the partial run.
    pub fn run(&self, prompt: &Prompt, timer: &mut RunTimer) -> RunResult<RunOutcome> {
        let session = Session::new();
        let config = &self.config;

        let mut tokens = prompt.tokens.clone();
        if tokens.is_empty() {
            tokens.push(self.engine.token_bos());
            tracing::debug!(
                "empty prompt, added BOS: {}",
                tokens_to_pretty(self.engine, &tokens)
            );
        }

        let max_input = max_input_len(config.n_ctx);
        if tokens.len() > max_input {
            tracing::error!(
                "prompt is too long ({} tokens, max {})",
                tokens.len(),
                max_input
            );
            return Err(RunError::InputTooLong {
                n_tokens: tokens.len(),
                max: max_input,
            });
        }

        let n_keep = config.resolve_n_keep(tokens.len());
        if config.verbose_prompt {
            self.log_prompt(&prompt.text, &tokens, n_keep);
        }

        let load_start = Instant::now();
        let ctx = self.engine.new_context(&ContextParams {
            n_ctx: config.n_ctx,
            n_batch: config.n_batch,
            seed: config.sampling.seed,
        })?;
        timer.record_load(load_start.elapsed());

        let mut window = ContextWindow::new(
            ctx,
            session.seq_id,
            n_keep,
            config.n_batch,
            config.overflow_policy(),
        );
        let mut sampling = SamplingContext::new(&config.sampling);
        let eos = self.engine.token_eos();

        tracing::debug!(
            "session {}: n_ctx = {}, n_batch = {}, n_predict = {}, n_keep = {}",
            session.id,
            window.n_ctx(),
            window.n_batch(),
            config.n_predict,
            n_keep
        );

        let mut n_remain = config.max_tokens();
        let mut state = if n_remain == Some(0) {
            LoopState::Done(StopReason::MaxTokens)
        } else {
            LoopState::FeedingPrompt
        };

        let mut n_consumed = 0;
        let mut batch: Vec<TokenId> = Vec::with_capacity(window.n_batch());
        let mut batch_is_prompt = true;
        let mut generated = Vec::new();
        let mut evictions = Vec::new();
        let mut truncated = 0;

        let stop_reason = loop {
            if let LoopState::Done(reason) = state {
                break reason;
            }

            if !batch.is_empty() {
                truncated += ContextWindow::truncate_front(&mut batch, max_input);

                match window.ensure_capacity(batch.len()) {
                    CapacityCheck::Fits => {}
                    CapacityCheck::Evicted(eviction) => evictions.push(eviction),
                    CapacityCheck::Full => {
                        state = LoopState::Done(StopReason::ContextFull);
                        continue;
                    }
                    CapacityCheck::Insufficient(eviction) => {
                        evictions.push(eviction);
                        return Err(RunError::Eval(KVError::CapacityExceeded {
                            seq_len: window.n_past() + batch.len(),
                            max: window.n_ctx(),
                        }));
                    }
                }

                tracing::trace!("eval: {}", tokens_to_pretty(self.engine, &batch));
                let eval_start = Instant::now();
                window.evaluate(&batch)?;
                if batch_is_prompt {
                    timer.record_prompt_eval(batch.len(), eval_start.elapsed());
                } else {
                    timer.record_eval(batch.len(), eval_start.elapsed());
                }
                tracing::trace!("n_past = {}", window.n_past());
                batch.clear();
            }

            state = match state {
                LoopState::FeedingPrompt => {
                    let end = (n_consumed + window.n_batch()).min(tokens.len());
                    for &token in &tokens[n_consumed..end] {
                        sampling.accept(token, false);
                        batch.push(token);
                    }
                    n_consumed = end;
                    batch_is_prompt = true;

                    if n_consumed == tokens.len() {
                        LoopState::Sampling
                    } else {
                        LoopState::FeedingPrompt
                    }
                }
                LoopState::Sampling => {
                    let sample_start = Instant::now();
                    let token = sampling.sample(window.logits())?;
                    timer.record_sample(sample_start.elapsed());

                    sampling.accept(token, true);
                    timer.record_generated();
                    generated.push(token);
                    batch.push(token);
                    batch_is_prompt = false;

                    if let Some(n) = n_remain.as_mut() {
                        *n -= 1;
                    }

                    if token == eos {
                        tracing::debug!("found EOS token");
                        LoopState::Done(StopReason::Eos)
                    } else if n_remain == Some(0) {
                        LoopState::Done(StopReason::MaxTokens)
                    } else {
                        LoopState::Sampling
                    }
                }
                done @ LoopState::Done(_) => done,
            };
        };

        tracing::debug!(
            "session {}: stopped ({:?}) after {} tokens, {} evictions",
            session.id,
            stop_reason,
            generated.len(),
            evictions.len()
        );

        Ok(RunOutcome {
            session_id: session.id,
            stop_reason,
            prompt_tokens: tokens.len(),
            n_keep,
            generated,
            evictions,
            truncated,
        })
    }

    fn log_prompt(&self, text: &str, tokens: &[TokenId], n_keep: usize) {
        tracing::info!("prompt: '{}'", text);
        tracing::info!("number of tokens in prompt = {}", tokens.len());
        for &token in tokens {
            tracing::info!("{:6} -> '{}'", token, self.engine.token_to_piece(token));
        }
        if n_keep > 0 {
            let kept: String = tokens[..n_keep]
                .iter()
                .map(|&t| self.engine.token_to_piece(t))
                .collect();
            tracing::info!("static prompt based on n_keep: '{}'", kept);
        }
    }
}

/// Run a single prompt without telemetry and return its outcome and timings.
pub fn generate(
    engine: &dyn LlamaEngine,
    config: GenerationConfig,
    prompt: &Prompt,
) -> RunResult<(RunOutcome, RunTimings)> {
    let hook: Arc<dyn TelemetryHook> = Arc::new(NoopTelemetry);
    let mut timer = RunTimer::new(hook);
    let outcome = GenerationLoop::new(engine, config).run(prompt, &mut timer)?;
    Ok((outcome, timer.finish()))
}
