//! # llama-kv
//!
//! Bounded KV cache bookkeeping for llama.rs.
//!
//! Supports:
//! - **Context window**: [`ContextWindow`] tracks `n_past` against a fixed `n_ctx`
//!   and protects the first `n_keep` prompt tokens from eviction
//! - **Sliding eviction**: when a pending batch does not fit, half of the
//!   unprotected positions are removed and the tail is shifted left
//! - **Batched evaluation**: batches are submitted to the engine in chunks of
//!   at most `n_batch` tokens
//! - **Reference cache**: [`TokenCache`] stores `(position, token)` cells per
//!   sequence with the same remove/shift semantics a tensor backend implements

use std::fmt;
use std::ops::Range;

use llama_engine::{InferenceContext, LlamaError, SeqId, TokenId};

/// Smallest context size the generation loop accepts.
pub const MIN_CTX: usize = 8;

/// Positions reserved past the longest accepted input (`n_ctx - 4`).
pub const INPUT_MARGIN: usize = 4;

/// Largest prompt or pending batch a window of `n_ctx` accepts.
pub fn max_input_len(n_ctx: usize) -> usize {
    n_ctx.saturating_sub(INPUT_MARGIN)
}

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {seq_len} > {max}")]
    CapacityExceeded { seq_len: usize, max: usize },

    #[error("decode failed with n_past={n_past}: {source}")]
    DecodeFailure {
        n_past: usize,
        #[source]
        source: LlamaError,
    },
}

pub type KVResult<T> = Result<T, KVError>;

/// What to do when a pending batch does not fit in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Discard half of the unprotected positions and keep going.
    #[default]
    Evict,
    /// Report [`CapacityCheck::Full`] and let the caller stop.
    Stop,
}

/// One sliding eviction, as applied to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// `n_past - n_keep - 1` at the time of the eviction.
    pub n_left: isize,
    /// Number of positions removed (`n_left / 2`, zero when degenerate).
    pub n_discard: usize,
    /// Positions removed from the cache.
    pub removed: Range<usize>,
    /// Positions moved left by `n_discard` after the removal.
    pub shifted: Range<usize>,
}

impl Eviction {
    /// Whether the window was too small relative to `n_keep` to free anything.
    pub fn is_degenerate(&self) -> bool {
        self.n_discard == 0
    }
}

/// Result of [`ContextWindow::ensure_capacity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityCheck {
    /// The pending batch already fits; nothing was touched.
    Fits,
    /// An eviction ran and the pending batch now fits.
    Evicted(Eviction),
    /// An eviction ran (possibly degenerate) but the pending batch still
    /// does not fit. Evaluating it would fail with `CapacityExceeded`.
    Insufficient(Eviction),
    /// No room and the window is configured to stop.
    Full,
}

/// Logical cache-position bookkeeping for one prompt run.
///
/// Owns the engine context for the run; dropping the window clears the cache
/// and releases the context.
///
/// # Invariants
/// - `n_past <= n_ctx` after every operation
/// - positions `[0, n_keep)` are never removed or shifted
pub struct ContextWindow<'a> {
    ctx: Box<dyn InferenceContext + 'a>,
    seq_id: SeqId,
    n_ctx: usize,
    n_batch: usize,
    n_keep: usize,
    n_past: usize,
    overflow: OverflowPolicy,
}

impl<'a> ContextWindow<'a> {
    /// Wrap a fresh engine context.
    ///
    /// `n_ctx` is taken from the context. `n_batch` of zero is treated as one.
    pub fn new(
        ctx: Box<dyn InferenceContext + 'a>,
        seq_id: SeqId,
        n_keep: usize,
        n_batch: usize,
        overflow: OverflowPolicy,
    ) -> Self {
        let n_ctx = ctx.n_ctx();
        Self {
            ctx,
            seq_id,
            n_ctx,
            n_batch: n_batch.max(1),
            n_keep,
            n_past: 0,
            overflow,
        }
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn n_keep(&self) -> usize {
        self.n_keep
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Logits of the last evaluated chunk.
    pub fn logits(&self) -> &[f32] {
        self.ctx.logits()
    }

    /// Make room for `pending` more tokens.
    ///
    /// No-op when `n_past + pending <= n_ctx`. Otherwise either reports
    /// [`CapacityCheck::Full`] (stop policy) or removes
    /// `[n_keep + 1, n_keep + 1 + n_discard)` and shifts
    /// `[n_keep + 1 + n_discard, n_past)` left by `n_discard`, in that order.
    /// One eviction at most; [`CapacityCheck::Insufficient`] reports a batch
    /// that still does not fit afterwards.
    pub fn ensure_capacity(&mut self, pending: usize) -> CapacityCheck {
        if self.n_past + pending <= self.n_ctx {
            return CapacityCheck::Fits;
        }

        if self.overflow == OverflowPolicy::Stop {
            tracing::info!(
                n_past = self.n_past,
                pending,
                n_ctx = self.n_ctx,
                "context full, stopping"
            );
            return CapacityCheck::Full;
        }

        let n_left = self.n_past as isize - self.n_keep as isize - 1;
        let n_discard = n_left / 2;

        tracing::debug!(
            n_past = self.n_past,
            n_left,
            n_ctx = self.n_ctx,
            n_keep = self.n_keep,
            n_discard,
            "context full, swapping"
        );

        let eviction = if n_discard <= 0 {
            tracing::warn!(
                n_ctx = self.n_ctx,
                n_keep = self.n_keep,
                "context too small to evict anything past n_keep"
            );
            Eviction {
                n_left,
                n_discard: 0,
                removed: 0..0,
                shifted: 0..0,
            }
        } else {
            let n_discard = n_discard as usize;
            let first = self.n_keep + 1;
            let removed = first..first + n_discard;
            let shifted = first + n_discard..self.n_past;

            self.ctx.kv_remove(self.seq_id, removed.start, removed.end);
            self.ctx
                .kv_shift(self.seq_id, shifted.start, shifted.end, -(n_discard as isize));
            self.n_past -= n_discard;

            tracing::debug!(n_past = self.n_past, "after swap");

            Eviction {
                n_left,
                n_discard,
                removed,
                shifted,
            }
        };

        if self.n_past + pending <= self.n_ctx {
            CapacityCheck::Evicted(eviction)
        } else {
            tracing::warn!(
                n_past = self.n_past,
                pending,
                n_ctx = self.n_ctx,
                "eviction did not free enough room for the pending batch"
            );
            CapacityCheck::Insufficient(eviction)
        }
    }

    /// Append `batch` at `n_past`, one engine call per `n_batch` chunk.
    ///
    /// `n_past` advances after each successful chunk. On failure the counters
    /// stay as of the last successful chunk; nothing is retried.
    pub fn evaluate(&mut self, batch: &[TokenId]) -> KVResult<()> {
        for chunk in batch.chunks(self.n_batch) {
            let seq_len = self.n_past + chunk.len();
            if seq_len > self.n_ctx {
                return Err(KVError::CapacityExceeded {
                    seq_len,
                    max: self.n_ctx,
                });
            }

            self.ctx
                .decode(chunk, self.n_past, self.seq_id)
                .map_err(|source| KVError::DecodeFailure {
                    n_past: self.n_past,
                    source,
                })?;

            self.n_past = seq_len;
            tracing::trace!(n_past = self.n_past, n_eval = chunk.len(), "evaluated chunk");
        }
        Ok(())
    }

    /// Drop tokens from the front of `batch` until it holds at most `max_size`.
    ///
    /// Returns the number of tokens dropped.
    pub fn truncate_front(batch: &mut Vec<TokenId>, max_size: usize) -> usize {
        if batch.len() <= max_size {
            return 0;
        }
        let skipped = batch.len() - max_size;
        batch.drain(..skipped);
        tracing::warn!(
            skipped,
            "input too long: skipped {} token{}",
            skipped,
            if skipped != 1 { "s" } else { "" }
        );
        skipped
    }

    /// Clear the cache and reset `n_past`.
    pub fn clear(&mut self) {
        self.ctx.kv_clear();
        self.n_past = 0;
    }
}

impl Drop for ContextWindow<'_> {
    fn drop(&mut self) {
        self.ctx.kv_clear();
    }
}

impl fmt::Debug for ContextWindow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextWindow")
            .field("seq_id", &self.seq_id)
            .field("n_ctx", &self.n_ctx)
            .field("n_batch", &self.n_batch)
            .field("n_keep", &self.n_keep)
            .field("n_past", &self.n_past)
            .field("overflow", &self.overflow)
            .finish()
    }
}

/// One cached token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCell {
    pub seq_id: SeqId,
    pub pos: usize,
    pub token: TokenId,
}

/// In-memory KV cache holding token ids instead of K/V tensors.
///
/// Capacity is counted in cells, like a tensor cache's slot count. Remove and
/// shift only touch the addressed sequence.
#[derive(Debug, Clone)]
pub struct TokenCache {
    cells: Vec<KvCell>,
    capacity: usize,
}

impl TokenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied cells across all sequences.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Store `tokens` at positions `start_pos..` of `seq_id`.
    ///
    /// # Errors
    /// - `CapacityExceeded`: not enough free cells; the cache is unchanged
    pub fn insert(&mut self, seq_id: SeqId, start_pos: usize, tokens: &[TokenId]) -> KVResult<()> {
        let seq_len = self.cells.len() + tokens.len();
        if seq_len > self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len,
                max: self.capacity,
            });
        }
        self.cells.extend(tokens.iter().enumerate().map(|(i, &token)| KvCell {
            seq_id,
            pos: start_pos + i,
            token,
        }));
        Ok(())
    }

    /// Remove cells of `seq_id` with `start <= pos < end`.
    pub fn remove(&mut self, seq_id: SeqId, start: usize, end: usize) {
        self.cells
            .retain(|c| c.seq_id != seq_id || c.pos < start || c.pos >= end);
    }

    /// Add `delta` to positions in `[start, end)` of `seq_id`.
    ///
    /// Cells whose position would become negative are dropped.
    pub fn shift(&mut self, seq_id: SeqId, start: usize, end: usize, delta: isize) {
        self.cells.retain_mut(|c| {
            if c.seq_id != seq_id || c.pos < start || c.pos >= end {
                return true;
            }
            let pos = c.pos as isize + delta;
            if pos < 0 {
                return false;
            }
            c.pos = pos as usize;
            true
        });
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Cells of `seq_id` ordered by position.
    pub fn sequence(&self, seq_id: SeqId) -> Vec<(usize, TokenId)> {
        let mut seq: Vec<(usize, TokenId)> = self
            .cells
            .iter()
            .filter(|c| c.seq_id == seq_id)
            .map(|c| (c.pos, c.token))
            .collect();
        seq.sort_by_key(|&(pos, _)| pos);
        seq
    }

    /// Highest occupied position of `seq_id`.
    pub fn max_pos(&self, seq_id: SeqId) -> Option<usize> {
        self.cells
            .iter()
            .filter(|c| c.seq_id == seq_id)
            .map(|c| c.pos)
            .max()
    }
}
