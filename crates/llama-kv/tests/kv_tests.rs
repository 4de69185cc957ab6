//! Integration tests for llama-kv.
//!
//! Validates:
//! - The reference eviction boundaries (n_ctx=8, n_keep=2)
//! - Protected prefix `[0, n_keep)` survives any eviction
//! - Batches one eviction cannot make room for are reported, not hidden
//! - `ensure_capacity` never mutates when the batch fits
//! - Chunked evaluation never exceeds `n_batch` per engine call
//! - Window drop releases the cache

use std::sync::{Arc, Mutex};

use llama_engine::{InferenceContext, LlamaError, SeqId, TokenId};
use llama_kv::*;
use proptest::prelude::*;

/// Engine context backed by a `TokenCache` the test can inspect.
struct SharedContext {
    cache: Arc<Mutex<TokenCache>>,
    chunk_sizes: Arc<Mutex<Vec<usize>>>,
    logits: Vec<f32>,
}

fn shared_window(
    n_ctx: usize,
    n_keep: usize,
    n_batch: usize,
    overflow: OverflowPolicy,
) -> (ContextWindow<'static>, Arc<Mutex<TokenCache>>, Arc<Mutex<Vec<usize>>>) {
    let cache = Arc::new(Mutex::new(TokenCache::new(n_ctx)));
    let chunk_sizes = Arc::new(Mutex::new(Vec::new()));
    let ctx = Box::new(SharedContext {
        cache: Arc::clone(&cache),
        chunk_sizes: Arc::clone(&chunk_sizes),
        logits: vec![0.0; 8],
    });
    (ContextWindow::new(ctx, 0, n_keep, n_batch, overflow), cache, chunk_sizes)
}

impl InferenceContext for SharedContext {
    fn n_ctx(&self) -> usize {
        self.cache.lock().unwrap().capacity()
    }

    fn decode(&mut self, tokens: &[TokenId], start_pos: usize, seq_id: SeqId) -> llama_engine::Result<()> {
        self.chunk_sizes.lock().unwrap().push(tokens.len());
        self.cache
            .lock()
            .unwrap()
            .insert(seq_id, start_pos, tokens)
            .map_err(|e| LlamaError::Decode {
                pos: start_pos,
                n_tokens: tokens.len(),
                reason: e.to_string(),
            })
    }

    fn kv_remove(&mut self, seq_id: SeqId, start: usize, end: usize) {
        self.cache.lock().unwrap().remove(seq_id, start, end);
    }

    fn kv_shift(&mut self, seq_id: SeqId, start: usize, end: usize, delta: isize) {
        self.cache.lock().unwrap().shift(seq_id, start, end, delta);
    }

    fn kv_clear(&mut self) {
        self.cache.lock().unwrap().clear();
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }
}

// ===========================================================================
// Reference eviction scenario
// ===========================================================================

#[test]
fn reference_eviction_n_ctx_8_n_keep_2() {
    let (mut window, cache, _) = shared_window(8, 2, 512, OverflowPolicy::Evict);
    window.evaluate(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

    let check = window.ensure_capacity(1);
    let CapacityCheck::Evicted(ev) = check else {
        panic!("expected an eviction, got {check:?}");
    };
    assert_eq!(ev.n_left, 5);
    assert_eq!(ev.n_discard, 2);
    assert_eq!(ev.removed, 3..5);
    assert_eq!(ev.shifted, 5..8);
    assert_eq!(window.n_past(), 6);

    // Tokens at positions 3 and 4 (values 4, 5) are gone; 6..=8 moved down.
    let seq = cache.lock().unwrap().sequence(0);
    assert_eq!(seq, vec![(0, 1), (1, 2), (2, 3), (3, 6), (4, 7), (5, 8)]);

    // The freed position is writable.
    window.evaluate(&[9]).unwrap();
    assert_eq!(window.n_past(), 7);
    assert_eq!(cache.lock().unwrap().sequence(0).last(), Some(&(6, 9)));
}

#[test]
fn repeated_evictions_keep_generation_going() {
    let (mut window, cache, _) = shared_window(8, 2, 512, OverflowPolicy::Evict);
    window.evaluate(&[1, 2, 3]).unwrap();

    for token in 100..140 {
        window.ensure_capacity(1);
        window.evaluate(&[token]).unwrap();
        assert!(window.n_past() <= window.n_ctx());
    }

    let seq = cache.lock().unwrap().sequence(0);
    assert_eq!(&seq[..3], &[(0, 1), (1, 2), (2, 3)]);
    assert_eq!(seq.last().map(|&(_, t)| t), Some(139));
    let positions: Vec<usize> = seq.iter().map(|&(p, _)| p).collect();
    let expected: Vec<usize> = (0..window.n_past()).collect();
    assert_eq!(positions, expected, "positions must stay contiguous");
}

#[test]
fn stop_policy_leaves_cache_untouched() {
    let (mut window, cache, _) = shared_window(8, 2, 512, OverflowPolicy::Stop);
    window.evaluate(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    let before = cache.lock().unwrap().sequence(0);

    assert_eq!(window.ensure_capacity(1), CapacityCheck::Full);
    assert_eq!(cache.lock().unwrap().sequence(0), before);
}

#[test]
fn evaluate_splits_into_n_batch_chunks() {
    let (mut window, _, chunks) = shared_window(32, 0, 4, OverflowPolicy::Evict);
    window.evaluate(&(0..10).collect::<Vec<TokenId>>()).unwrap();
    assert_eq!(*chunks.lock().unwrap(), vec![4, 4, 2]);
    assert_eq!(window.n_past(), 10);
}

#[test]
fn dropping_window_clears_cache() {
    let (mut window, cache, _) = shared_window(8, 0, 8, OverflowPolicy::Evict);
    window.evaluate(&[1, 2, 3]).unwrap();
    assert_eq!(cache.lock().unwrap().len(), 3);
    drop(window);
    assert!(cache.lock().unwrap().is_empty());
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    /// A full window under the evict policy always makes room for the next
    /// generated token and never touches the protected prefix.
    #[test]
    fn eviction_frees_room_and_protects_prefix(
        n_ctx in MIN_CTX..128usize,
        keep_frac in 0.0f64..=1.0,
    ) {
        let max_keep = max_input_len(n_ctx);
        let n_keep = ((max_keep as f64) * keep_frac) as usize;
        let (mut window, cache, _) = shared_window(n_ctx, n_keep, 512, OverflowPolicy::Evict);

        let tokens: Vec<TokenId> = (0..n_ctx as TokenId).map(|t| t + 1000).collect();
        window.evaluate(&tokens).unwrap();
        let before = cache.lock().unwrap().sequence(0);

        let check = window.ensure_capacity(1);
        prop_assert!(matches!(check, CapacityCheck::Evicted(ref ev) if !ev.is_degenerate()));
        prop_assert!(window.n_past() + 1 <= window.n_ctx());

        let after = cache.lock().unwrap().sequence(0);
        prop_assert_eq!(&after[..n_keep], &before[..n_keep]);
        prop_assert_eq!(after.len(), window.n_past());
    }

    /// Any admissible batch against a full window either fits after one
    /// eviction or is reported as still not fitting; the prefix survives both.
    #[test]
    fn eviction_outcome_matches_remaining_room(
        n_ctx in MIN_CTX..128usize,
        keep_frac in 0.0f64..=1.0,
        pending_frac in 0.0f64..=1.0,
    ) {
        let max_input = max_input_len(n_ctx);
        let n_keep = ((max_input as f64) * keep_frac) as usize;
        let pending = 1 + ((max_input - 1) as f64 * pending_frac) as usize;
        let (mut window, cache, _) = shared_window(n_ctx, n_keep, 512, OverflowPolicy::Evict);

        let tokens: Vec<TokenId> = (0..n_ctx as TokenId).map(|t| t + 1000).collect();
        window.evaluate(&tokens).unwrap();
        let before = cache.lock().unwrap().sequence(0);

        match window.ensure_capacity(pending) {
            CapacityCheck::Evicted(ev) => {
                prop_assert!(window.n_past() + pending <= window.n_ctx());
                prop_assert!(pending <= ev.n_discard);
            }
            CapacityCheck::Insufficient(ev) => {
                prop_assert!(window.n_past() + pending > window.n_ctx());
                prop_assert!(pending > ev.n_discard);
            }
            other => return Err(TestCaseError::fail(format!("unexpected {other:?}"))),
        }

        let after = cache.lock().unwrap().sequence(0);
        prop_assert_eq!(&after[..n_keep], &before[..n_keep]);
        prop_assert_eq!(after.len(), window.n_past());
    }

    /// When the pending batch fits, nothing changes.
    #[test]
    fn ensure_capacity_is_noop_when_batch_fits(
        n_ctx in MIN_CTX..128usize,
        fill_frac in 0.0f64..=1.0,
        n_keep in 0usize..4,
    ) {
        let n_past = ((n_ctx as f64) * fill_frac) as usize;
        let (mut window, cache, _) = shared_window(n_ctx, n_keep, 512, OverflowPolicy::Evict);
        let tokens: Vec<TokenId> = (0..n_past as TokenId).collect();
        window.evaluate(&tokens).unwrap();
        let before = cache.lock().unwrap().sequence(0);

        let pending = n_ctx - n_past;
        prop_assert_eq!(window.ensure_capacity(pending), CapacityCheck::Fits);
        prop_assert_eq!(window.n_past(), n_past);
        prop_assert_eq!(cache.lock().unwrap().sequence(0), before);
    }

    /// n_discard follows the exact integer floor of (n_past - n_keep - 1) / 2.
    #[test]
    fn n_discard_is_half_of_unprotected_tail(
        n_ctx in MIN_CTX..96usize,
        n_keep in 0usize..4,
    ) {
        let (mut window, _, _) = shared_window(n_ctx, n_keep, 512, OverflowPolicy::Evict);
        let tokens: Vec<TokenId> = (0..n_ctx as TokenId).collect();
        window.evaluate(&tokens).unwrap();

        let CapacityCheck::Evicted(ev) = window.ensure_capacity(1) else {
            return Err(TestCaseError::fail("expected eviction"));
        };
        let n_left = n_ctx - n_keep - 1;
        prop_assert_eq!(ev.n_discard, n_left / 2);
        prop_assert_eq!(ev.removed, n_keep + 1..n_keep + 1 + n_left / 2);
        prop_assert_eq!(ev.shifted, n_keep + 1 + n_left / 2..n_ctx);
        prop_assert_eq!(window.n_past(), n_ctx - n_left / 2);
    }
}
