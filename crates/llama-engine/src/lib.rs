//! # llama-engine
//!
//! The "narrow waist" of the llama.rs stack. Defines the [`LlamaEngine`] and
//! [`InferenceContext`] traits that the generation loop drives. Implementations
//! can swap CPU/Metal/FFI backends (or a deterministic mock) without changing
//! the loop.
//!
//! ## Design Notes
//!
//! ### Model vs. context
//! A [`LlamaEngine`] is the loaded model: tokenizer, special tokens and
//! training metadata. It is shared (`&self`) and must be `Send + Sync`.
//! An [`InferenceContext`] is the per-prompt session holding the KV cache and
//! the logits of the last evaluated batch. It is created by
//! [`LlamaEngine::new_context`], exclusively owned by one run, and released on
//! drop. Two contexts of the same prompt run are never alive at once.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative.

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Sequence ID inside a context's KV cache.
pub type SeqId = i32;

/// Top-level error type for all engine operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlamaError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Context creation failed: {0}")]
    Context(String),
    #[error("Decode failed at position {pos} ({n_tokens} tokens): {reason}")]
    Decode {
        pos: usize,
        n_tokens: usize,
        reason: String,
    },
}

/// Parameters for creating an [`InferenceContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    /// Context size (number of KV cache positions).
    pub n_ctx: usize,
    /// Maximum number of tokens submitted in one decode call.
    pub n_batch: usize,
    /// RNG seed forwarded to the backend.
    pub seed: u64,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_batch: 512,
            seed: 0,
        }
    }
}

/// Identity of one prompt run.
///
/// Sessions are intentionally not `Clone`: a session names exactly one live
/// context and one KV sequence.
#[derive(Debug)]
pub struct Session {
    /// Unique session ID for tracking and logging.
    pub id: uuid::Uuid,
    /// KV cache sequence the run writes to.
    pub seq_id: SeqId,
}

impl Session {
    /// Create a new session with a random UUID on sequence 0.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            seq_id: 0,
        }
    }

    /// Create a session with an explicit ID (useful for testing/replay).
    pub fn with_id(id: uuid::Uuid) -> Self {
        Self { id, seq_id: 0 }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-prompt inference state: KV cache plus the logits of the last decode.
///
/// Cache positions are logical: `decode` writes `tokens[i]` at
/// `start_pos + i`. Range arguments are half-open `[start, end)`.
pub trait InferenceContext: Send {
    /// Number of cache positions this context was created with.
    fn n_ctx(&self) -> usize;

    /// Evaluate `tokens` at positions starting from `start_pos` on `seq_id`.
    ///
    /// One synchronous call. On success, [`InferenceContext::logits`] holds
    /// the logits for the last token of the batch.
    fn decode(&mut self, tokens: &[TokenId], start_pos: usize, seq_id: SeqId) -> Result<()>;

    /// Remove cached positions `[start, end)` of `seq_id`.
    fn kv_remove(&mut self, seq_id: SeqId, start: usize, end: usize);

    /// Add `delta` to the positions of cached cells in `[start, end)` of `seq_id`.
    fn kv_shift(&mut self, seq_id: SeqId, start: usize, end: usize, delta: isize);

    /// Drop every cached cell.
    fn kv_clear(&mut self);

    /// Logits produced by the last successful decode (vocabulary sized).
    fn logits(&self) -> &[f32];
}

/// The core engine trait — everything else plugs into this.
pub trait LlamaEngine: Send + Sync {
    /// Convert text into a sequence of token IDs, optionally prefixed with BOS.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;

    /// Text piece for a single token (diagnostics only).
    fn token_to_piece(&self, token: TokenId) -> String;

    /// Beginning-of-sequence token.
    fn token_bos(&self) -> TokenId;

    /// End-of-sequence token.
    fn token_eos(&self) -> TokenId;

    /// Whether prompts should be tokenized with a leading BOS.
    fn should_add_bos(&self) -> bool {
        true
    }

    /// Context length the model was trained with.
    fn n_ctx_train(&self) -> usize;

    /// Vocabulary size (length of a logits row).
    fn n_vocab(&self) -> usize;

    /// Create a fresh per-prompt context.
    fn new_context<'a>(&'a self, params: &ContextParams)
        -> Result<Box<dyn InferenceContext + 'a>>;
}

/// Render tokens as `[ 'piece':id, ... ]` for log lines.
pub fn tokens_to_pretty(engine: &dyn LlamaEngine, tokens: &[TokenId]) -> String {
    let parts: Vec<String> = tokens
        .iter()
        .map(|&t| format!("'{}':{}", engine.token_to_piece(t), t))
        .collect();
    format!("[ {} ]", parts.join(", "))
}
