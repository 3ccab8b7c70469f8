//! Generation loop over one context sequence: prompt prefill with cache reuse,
//! sample/decode steps, context shift and UTF-8-safe streaming.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use strand_abi::{Pos, SeqId, Token};
use tracing::info;

use crate::backend::ComputeBackend;
use crate::batch::Batch;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::sampling::Sampler;

// Child modules add `impl Generator<B>` blocks and can reach private fields.
mod decode;
mod prefill;
mod utils;

/// Env override clamping the number of decode steps per call.
pub const MAX_DECODE_TOKENS_ENV: &str = "STRAND_MAX_DECODE_TOKENS";

/// Why a generation call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced an end-of-generation token.
    EndOfGeneration,
    StepLimit,
    /// The stop handle was flipped.
    Stopped,
}

/// Result of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Generated tokens, excluding the prompt and the final EOG token.
    pub tokens: Vec<Token>,
    pub stop: StopReason,
    pub n_prompt: usize,
    /// Prompt tokens whose cache cells were reused from the previous call.
    pub n_reused: usize,
}

/// Drives a [`Context`] and a [`Sampler`] for one logical session.
pub struct Generator<B: ComputeBackend> {
    ctx: Context<B>,
    sampler: Sampler,
    seq: SeqId,
    batch: Batch,
    /// Tokens whose cells sit in the cache for `seq`, at positions `0..len`.
    history: Vec<Token>,
    /// Leading tokens a context shift never discards.
    n_keep: usize,
    max_tokens: Option<usize>,
    stop_flag: Arc<AtomicBool>,
}

impl<B: ComputeBackend> Generator<B> {
    pub fn new(ctx: Context<B>, sampler: Sampler) -> Self {
        let batch = Batch::new(ctx.n_batch(), 0, ctx.n_seq_max());
        Self {
            ctx,
            sampler,
            seq: 0,
            batch,
            history: Vec::new(),
            n_keep: 0,
            max_tokens: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Generate into sequence `seq` instead of 0.
    pub fn with_sequence(mut self, seq: SeqId) -> Result<Self> {
        if seq < 0 || seq as usize >= self.ctx.n_seq_max() {
            return Err(Error::InvalidSequenceSet(format!(
                "sequence id {seq} outside [0, {})",
                self.ctx.n_seq_max()
            )));
        }
        self.seq = seq;
        Ok(self)
    }

    pub fn with_n_keep(mut self, n_keep: usize) -> Self {
        self.n_keep = n_keep;
        self
    }

    /// Cap decode steps per call (at least 1).
    pub fn set_max_tokens(&mut self, max_tokens: Option<usize>) {
        self.max_tokens = max_tokens.map(|n| n.max(1));
    }

    /// Handle you can keep and flip to cancel generation (`store(true)`).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    #[inline]
    fn clear_stop(&self) {
        self.stop_flag.store(false, Ordering::Relaxed);
    }

    #[inline]
    fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    pub fn context(&self) -> &Context<B> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context<B> {
        &mut self.ctx
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut Sampler {
        &mut self.sampler
    }

    /// Tokens currently cached for this generator's sequence.
    pub fn history(&self) -> &[Token] {
        &self.history
    }

    pub fn into_context(self) -> Context<B> {
        self.ctx
    }

    /// Forget cached tokens for this sequence; the next prompt is evaluated in full.
    pub fn reset(&mut self) -> Result<()> {
        self.ctx.kv_cache_mut().remove(self.seq, 0, -1)?;
        self.history.clear();
        self.sampler.reset();
        Ok(())
    }

    /// Decide how many decode steps to allow this call.
    ///
    /// Env override: `STRAND_MAX_DECODE_TOKENS` (usize) clamps the cap.
    fn compute_step_limit(&self, prompt_len: usize) -> usize {
        let n_ctx = self.ctx.n_ctx();
        let mut step_limit = self.max_tokens.unwrap_or_else(|| {
            let reserve = n_ctx / 50; // ~2% safety
            n_ctx.saturating_sub(prompt_len).saturating_sub(reserve)
        });

        if let Ok(max_decode_str) = std::env::var(MAX_DECODE_TOKENS_ENV) {
            if let Ok(max_decode) = max_decode_str.parse::<usize>() {
                step_limit = step_limit.min(max_decode.max(1));
            }
        }
        if step_limit == 0 { 32 } else { step_limit }
    }

    /// The next token would not fit: the sequence fills `n_ctx` or the table is full.
    fn window_full(&self) -> bool {
        let kv = self.ctx.kv_cache();
        kv.seq_cell_count(self.seq) >= self.ctx.n_ctx() || kv.free_cells() == 0
    }

    /// Keep the first `n_keep` tokens, drop half of the rest and slide the
    /// remainder down so positions stay contiguous.
    fn shift_context(&mut self) -> Result<()> {
        let n_past = self.history.len();
        let n_keep = self.n_keep.min(n_past);
        let n_discard = (n_past - n_keep) / 2;
        if n_discard == 0 {
            return Err(Error::ContextOverflow {
                seq: self.seq,
                needed: n_past + 1,
                n_ctx: self.ctx.n_ctx(),
            });
        }
        let seq = self.seq;
        let kv = self.ctx.kv_cache_mut();
        kv.remove(seq, n_keep as Pos, (n_keep + n_discard) as Pos)?;
        kv.shift(seq, (n_keep + n_discard) as Pos, n_past as Pos, -(n_discard as Pos))?;
        self.history.drain(n_keep..n_keep + n_discard);
        info!(n_past, n_keep, n_discard, "context shift");
        Ok(())
    }
}
