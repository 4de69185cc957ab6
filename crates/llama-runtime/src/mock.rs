//! Deterministic in-process engine for tests, demos and the CLI.
//!
//! [`MockEngine`] tokenizes on whitespace, keeps its KV state in a
//! [`TokenCache`], and produces logits that favour a configurable next token.
//! It records every decode call and how many contexts are alive, so callers
//! can check batching and context lifetime.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use llama_engine::{ContextParams, InferenceContext, LlamaEngine, LlamaError, Result, SeqId, TokenId};
use llama_kv::TokenCache;

pub const MOCK_BOS: TokenId = 1;
pub const MOCK_EOS: TokenId = 2;

/// First id handed out to words.
const FIRST_WORD_ID: TokenId = 3;

/// Picks the preferred next token from the cached sequence (ordered by position).
pub type NextTokenFn = Arc<dyn Fn(&[TokenId]) -> TokenId + Send + Sync>;

/// One recorded decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeCall {
    pub start_pos: usize,
    pub n_tokens: usize,
}

#[derive(Debug, Default)]
struct MockStats {
    decode_calls: AtomicUsize,
    contexts_created: AtomicUsize,
    live_contexts: AtomicUsize,
    max_live_contexts: AtomicUsize,
    decode_log: Mutex<Vec<DecodeCall>>,
    last_sequence: Mutex<Vec<(usize, TokenId)>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fnv1a(word: &str) -> u64 {
    word.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Whitespace-tokenizing engine with scripted logits.
pub struct MockEngine {
    n_vocab: usize,
    n_ctx_train: usize,
    add_bos: bool,
    next_token: NextTokenFn,
    fail_decode_at: Option<usize>,
    pieces: RwLock<HashMap<TokenId, String>>,
    stats: MockStats,
}

impl MockEngine {
    /// Engine with `n_vocab` ids (at least 4). By default it never prefers EOS.
    pub fn new(n_vocab: usize) -> Self {
        let n_vocab = n_vocab.max(FIRST_WORD_ID as usize + 1);
        let n_words = (n_vocab - FIRST_WORD_ID as usize) as TokenId;
        Self {
            n_vocab,
            n_ctx_train: 2048,
            add_bos: true,
            next_token: Arc::new(move |seq: &[TokenId]| {
                let last = seq.last().copied().unwrap_or(0).max(0);
                FIRST_WORD_ID + (last + 1) % n_words
            }),
            fail_decode_at: None,
            pieces: RwLock::new(HashMap::new()),
            stats: MockStats::default(),
        }
    }

    pub fn with_n_ctx_train(mut self, n_ctx_train: usize) -> Self {
        self.n_ctx_train = n_ctx_train;
        self
    }

    pub fn with_add_bos(mut self, add_bos: bool) -> Self {
        self.add_bos = add_bos;
        self
    }

    /// Replace the next-token rule.
    pub fn with_next_token<F>(mut self, f: F) -> Self
    where
        F: Fn(&[TokenId]) -> TokenId + Send + Sync + 'static,
    {
        self.next_token = Arc::new(f);
        self
    }

    /// Prefer EOS once the cached sequence holds `len` tokens.
    pub fn with_eos_at_len(self, len: usize) -> Self {
        let fallback = Arc::clone(&self.next_token);
        self.with_next_token(move |seq| {
            if seq.len() >= len {
                MOCK_EOS
            } else {
                fallback(seq)
            }
        })
    }

    /// Fail the `n`-th decode call (1-based, counted over the engine's life).
    pub fn with_decode_failure_at(mut self, n: usize) -> Self {
        self.fail_decode_at = Some(n);
        self
    }

    /// Word id a whitespace-separated `word` maps to.
    pub fn word_id(&self, word: &str) -> TokenId {
        let n_words = (self.n_vocab - FIRST_WORD_ID as usize) as u64;
        FIRST_WORD_ID + (fnv1a(word) % n_words) as TokenId
    }

    pub fn decode_calls(&self) -> usize {
        self.stats.decode_calls.load(Ordering::SeqCst)
    }

    pub fn decode_log(&self) -> Vec<DecodeCall> {
        lock(&self.stats.decode_log).clone()
    }

    pub fn contexts_created(&self) -> usize {
        self.stats.contexts_created.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
        self.stats.live_contexts.load(Ordering::SeqCst)
    }

    /// Highest number of contexts alive at the same time.
    pub fn max_live_contexts(&self) -> usize {
        self.stats.max_live_contexts.load(Ordering::SeqCst)
    }

    /// Cache contents `(pos, token)` after the most recent successful decode.
    pub fn last_sequence(&self) -> Vec<(usize, TokenId)> {
        lock(&self.stats.last_sequence).clone()
    }

    fn logits_for(&self, seq: &[TokenId]) -> Vec<f32> {
        let mut logits: Vec<f32> = (0..self.n_vocab)
            .map(|i| ((i * 31 + 7) % 97) as f32 / 97.0)
            .collect();
        logits[MOCK_EOS as usize] = -100.0;

        let preferred = (self.next_token)(seq);
        if let Some(l) = usize::try_from(preferred)
            .ok()
            .and_then(|i| logits.get_mut(i))
        {
            *l = 10.0;
        }
        logits
    }
}

impl fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEngine")
            .field("n_vocab", &self.n_vocab)
            .field("n_ctx_train", &self.n_ctx_train)
            .field("add_bos", &self.add_bos)
            .field("fail_decode_at", &self.fail_decode_at)
            .field("stats", &self.stats)
            .finish()
    }
}

impl LlamaEngine for MockEngine {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(MOCK_BOS);
        }
        let mut pieces = self
            .pieces
            .write()
            .map_err(|_| LlamaError::Tokenization("vocabulary lock poisoned".to_string()))?;
        for word in text.split_whitespace() {
            let id = self.word_id(word);
            pieces.entry(id).or_insert_with(|| word.to_string());
            tokens.push(id);
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> String {
        match token {
            MOCK_BOS => "<s>".to_string(),
            MOCK_EOS => "</s>".to_string(),
            _ => self
                .pieces
                .read()
                .ok()
                .and_then(|p| p.get(&token).cloned())
                .unwrap_or_else(|| format!("<{token}>")),
        }
    }

    fn token_bos(&self) -> TokenId {
        MOCK_BOS
    }

    fn token_eos(&self) -> TokenId {
        MOCK_EOS
    }

    fn should_add_bos(&self) -> bool {
        self.add_bos
    }

    fn n_ctx_train(&self) -> usize {
        self.n_ctx_train
    }

    fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    fn new_context<'a>(&'a self, params: &ContextParams) -> Result<Box<dyn InferenceContext + 'a>> {
        if params.n_ctx == 0 {
            return Err(LlamaError::Context("n_ctx must be positive".to_string()));
        }
        self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);
        let live = self.stats.live_contexts.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live_contexts.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(MockContext {
            engine: self,
            cache: TokenCache::new(params.n_ctx),
            logits: vec![0.0; self.n_vocab],
        }))
    }
}

/// Per-run context of a [`MockEngine`].
pub struct MockContext<'a> {
    engine: &'a MockEngine,
    cache: TokenCache,
    logits: Vec<f32>,
}

impl InferenceContext for MockContext<'_> {
    fn n_ctx(&self) -> usize {
        self.cache.capacity()
    }

    fn decode(&mut self, tokens: &[TokenId], start_pos: usize, seq_id: SeqId) -> Result<()> {
        let stats = &self.engine.stats;
        let call = stats.decode_calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&stats.decode_log).push(DecodeCall {
            start_pos,
            n_tokens: tokens.len(),
        });

        if self.engine.fail_decode_at == Some(call) {
            return Err(LlamaError::Decode {
                pos: start_pos,
                n_tokens: tokens.len(),
                reason: format!("injected failure at call {call}"),
            });
        }

        self.cache
            .insert(seq_id, start_pos, tokens)
            .map_err(|e| LlamaError::Decode {
                pos: start_pos,
                n_tokens: tokens.len(),
                reason: e.to_string(),
            })?;

        let sequence = self.cache.sequence(seq_id);
        let seq_tokens: Vec<TokenId> = sequence.iter().map(|&(_, t)| t).collect();
        self.logits = self.engine.logits_for(&seq_tokens);
        *lock(&stats.last_sequence) = sequence;
        Ok(())
    }

    fn kv_remove(&mut self, seq_id: SeqId, start: usize, end: usize) {
        self.cache.remove(seq_id, start, end);
    }

    fn kv_shift(&mut self, seq_id: SeqId, start: usize, end: usize, delta: isize) {
        self.cache.shift(seq_id, start, end, delta);
    }

    fn kv_clear(&mut self) {
        self.cache.clear();
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }
}

impl Drop for MockContext<'_> {
    fn drop(&mut self) {
        self.engine.stats.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argmax(logits: &[f32]) -> usize {
        logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap()
    }

    #[test]
    fn tokenize_is_stable_and_records_pieces() {
        let engine = MockEngine::new(256);
        let a = engine.tokenize("once upon a time", true).unwrap();
        let b = engine.tokenize("once upon a time", true).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], MOCK_BOS);
        assert_eq!(a.len(), 5);
        assert!(a[1..].iter().all(|&t| t >= FIRST_WORD_ID && (t as usize) < 256));
        assert_eq!(engine.token_to_piece(a[1]), "once");
        assert_eq!(engine.token_to_piece(MOCK_EOS), "</s>");
    }

    #[test]
    fn empty_text_without_bos_is_empty() {
        let engine = MockEngine::new(64);
        assert!(engine.tokenize("   ", false).unwrap().is_empty());
    }

    #[test]
    fn logits_prefer_next_token() {
        let engine = MockEngine::new(64).with_next_token(|_| 42);
        let mut ctx = engine.new_context(&ContextParams::default()).unwrap();
        ctx.decode(&[1, 5, 6], 0, 0).unwrap();
        assert_eq!(argmax(ctx.logits()), 42);
        assert_eq!(ctx.logits().len(), 64);
    }

    #[test]
    fn default_rule_never_prefers_eos() {
        let engine = MockEngine::new(8);
        let mut ctx = engine.new_context(&ContextParams::default()).unwrap();
        for pos in 0..20 {
            ctx.decode(&[pos as TokenId % 8], pos, 0).unwrap();
            assert_ne!(argmax(ctx.logits()) as TokenId, MOCK_EOS);
        }
    }

    #[test]
    fn eos_at_len() {
        let engine = MockEngine::new(64).with_eos_at_len(3);
        let mut ctx = engine.new_context(&ContextParams::default()).unwrap();
        ctx.decode(&[1, 5], 0, 0).unwrap();
        assert_ne!(argmax(ctx.logits()) as TokenId, MOCK_EOS);
        ctx.decode(&[6], 2, 0).unwrap();
        assert_eq!(argmax(ctx.logits()) as TokenId, MOCK_EOS);
    }

    #[test]
    fn decode_failure_injection() {
        let engine = MockEngine::new(64).with_decode_failure_at(2);
        let mut ctx = engine.new_context(&ContextParams::default()).unwrap();
        ctx.decode(&[1], 0, 0).unwrap();
        let err = ctx.decode(&[5], 1, 0).unwrap_err();
        assert!(matches!(err, LlamaError::Decode { pos: 1, n_tokens: 1, .. }));
        assert_eq!(engine.decode_calls(), 2);
        assert_eq!(
            engine.decode_log(),
            vec![
                DecodeCall { start_pos: 0, n_tokens: 1 },
                DecodeCall { start_pos: 1, n_tokens: 1 },
            ]
        );
    }

    #[test]
    fn context_capacity_is_enforced() {
        let engine = MockEngine::new(64);
        let params = ContextParams {
            n_ctx: 4,
            ..ContextParams::default()
        };
        let mut ctx = engine.new_context(&params).unwrap();
        assert_eq!(ctx.n_ctx(), 4);
        assert!(ctx.decode(&[1, 2, 3, 4, 5], 0, 0).is_err());
    }

    #[test]
    fn live_context_counting() {
        let engine = MockEngine::new(64);
        let params = ContextParams::default();
        {
            let _a = engine.new_context(&params).unwrap();
            let _b = engine.new_context(&params).unwrap();
            assert_eq!(engine.live_contexts(), 2);
        }
        assert_eq!(engine.live_contexts(), 0);
        assert_eq!(engine.max_live_contexts(), 2);
        assert_eq!(engine.contexts_created(), 2);
    }

    #[test]
    fn zero_sized_context_is_rejected() {
        let engine = MockEngine::new(64);
        let params = ContextParams {
            n_ctx: 0,
            ..ContextParams::default()
        };
        assert!(matches!(engine.new_context(&params), Err(LlamaError::Context(_))));
    }
}
