//! Strand context: one KV cache, one RNG and the decode outputs of one session,
//! bound to a shared model and a compute backend.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use strand_abi::{Model, SeqId};
use tracing::debug;

use crate::backend::ComputeBackend;
use crate::error::{Error, Result};
use crate::hooks::{ContextHooks, NoHooks};
use crate::kv_cache::KvCache;
use crate::logging::{self, LogLevel};
use crate::params::{ContextParams, DEFAULT_SEED};
use crate::perf::{PerfCounters, Timings};

// Child modules add `impl Context<B>` blocks and can reach private fields.
mod decode;
mod state;

pub use state::RequiredSize;

/// Mutable inference state over a shared, immutable model.
/// All calls on one context must be serialized by the caller.
pub struct Context<B: ComputeBackend> {
    model: Arc<B::Model>,
    backend: B,
    params: ContextParams,
    kv: KvCache,
    seed: u32,
    rng: StdRng,

    // ========== last decode outputs ==========
    /// Batch index → output row, -1 for entries that asked for nothing.
    output_ids: Vec<i32>,
    n_outputs: usize,
    logits: Vec<f32>,
    embd: Vec<f32>,
    seq_embd: BTreeMap<SeqId, Vec<f32>>,

    perf: PerfCounters,
    hooks: Box<dyn ContextHooks>,
}

impl<B: ComputeBackend> Context<B> {
    /// Create a context with no hooks.
    pub fn new(model: Arc<B::Model>, backend: B, params: ContextParams) -> Result<Self> {
        Self::with_hooks(model, backend, params, Box::new(NoHooks))
    }

    pub fn with_hooks(
        model: Arc<B::Model>,
        backend: B,
        params: ContextParams,
        hooks: Box<dyn ContextHooks>,
    ) -> Result<Self> {
        let t0 = Instant::now();
        let params = params.resolved(model.info().n_ctx_train)?;
        let kv = KvCache::new(params.n_ctx as usize, params.n_seq_max as usize)
            .with_defrag_threshold(params.defrag_thold);
        let seed = if params.seed == DEFAULT_SEED {
            rand::rng().random()
        } else {
            params.seed
        };

        let ctx = Self {
            model,
            backend,
            kv,
            seed,
            rng: StdRng::seed_from_u64(u64::from(seed)),
            output_ids: Vec::with_capacity(params.n_batch as usize),
            n_outputs: 0,
            logits: Vec::new(),
            embd: Vec::new(),
            seq_embd: BTreeMap::new(),
            perf: PerfCounters::new(params.no_perf, t0.elapsed()),
            hooks,
            params,
        };
        ctx.log(
            LogLevel::Info,
            &format!(
                "context created: n_ctx = {}, n_batch = {}, n_seq_max = {}, arch = {}",
                ctx.params.n_ctx,
                ctx.params.n_batch,
                ctx.params.n_seq_max,
                ctx.model.info().architecture
            ),
        );
        Ok(ctx)
    }

    // ========== CONFIGURATION ==========

    pub fn model(&self) -> &Arc<B::Model> {
        &self.model
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Parameters after model-dependent resolution.
    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    #[inline]
    pub fn n_ctx(&self) -> usize {
        self.params.n_ctx as usize
    }

    #[inline]
    pub fn n_batch(&self) -> usize {
        self.params.n_batch as usize
    }

    #[inline]
    pub fn n_seq_max(&self) -> usize {
        self.params.n_seq_max as usize
    }

    #[inline]
    pub fn n_vocab(&self) -> usize {
        self.model.n_vocab()
    }

    // ========== KV CACHE ==========

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv
    }

    /// Sequence algebra (remove/copy/keep/shift/divide/defragment) lives on the cache.
    pub fn kv_cache_mut(&mut self) -> &mut KvCache {
        &mut self.kv
    }

    /// Apply pending position shifts through the backend, then any pending defrag.
    pub fn update(&mut self) -> Result<()> {
        if self.kv.shift_pending() {
            let model = &*self.model;
            let backend = &mut self.backend;
            self.kv
                .apply_shift(|state, pos, delta| backend.shift_cell_state(model, state, pos, delta));
            debug!("applied pending kv shift");
        }
        if self.kv.defrag_pending() {
            let moved = self.kv.run_defrag();
            debug!(moved, used = self.kv.used_cells(), "kv defrag");
        }
        Ok(())
    }

    // ========== RNG ==========

    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Reseed; `DEFAULT_SEED` picks a random one.
    pub fn set_rng_seed(&mut self, seed: u32) {
        self.seed = if seed == DEFAULT_SEED {
            rand::rng().random()
        } else {
            seed
        };
        self.rng = StdRng::seed_from_u64(u64::from(self.seed));
    }

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    // ========== OUTPUTS ==========

    /// Number of output rows produced by the last decode.
    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// All output rows of the last decode, `n_outputs * n_vocab` values.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn output_row(&self, i: i32) -> Result<usize> {
        let row = if i < 0 {
            let j = self.n_outputs as i64 + i64::from(i);
            if j < 0 {
                return Err(Error::InvalidArgument(format!(
                    "output index {i} out of range ({} outputs)",
                    self.n_outputs
                )));
            }
            j as usize
        } else {
            match self.output_ids.get(i as usize) {
                Some(&row) if row >= 0 => row as usize,
                Some(_) => {
                    return Err(Error::InvalidArgument(format!(
                        "batch entry {i} did not request logits"
                    )));
                }
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "batch entry {i} out of range ({} entries)",
                        self.output_ids.len()
                    )));
                }
            }
        };
        Ok(row)
    }

    /// Logits of batch entry `i` of the last decode; negative `i` counts from the last output.
    pub fn logits_ith(&self, i: i32) -> Result<&[f32]> {
        let row = self.output_row(i)?;
        let n_vocab = self.n_vocab();
        self.logits
            .get(row * n_vocab..(row + 1) * n_vocab)
            .ok_or_else(|| Error::InvalidArgument(format!("no logits for output row {row}")))
    }

    /// Embedding of batch entry `i`; requires `embeddings` in the params.
    pub fn embeddings_ith(&self, i: i32) -> Result<&[f32]> {
        let row = self.output_row(i)?;
        let n_embd = self.model.n_embd();
        self.embd
            .get(row * n_embd..(row + 1) * n_embd)
            .ok_or_else(|| Error::InvalidArgument(format!("no embeddings for output row {row}")))
    }

    /// Pooled embedding of `seq` from the last decode (pooling must be enabled).
    pub fn embeddings_seq(&self, seq: SeqId) -> Option<&[f32]> {
        self.seq_embd.get(&seq).map(Vec::as_slice)
    }

    // ========== PERF & LOGGING ==========

    pub fn timings(&self) -> Timings {
        self.perf.snapshot()
    }

    pub fn reset_timings(&mut self) {
        self.perf.reset();
    }

    pub fn perf_summary(&self) -> String {
        self.perf.snapshot().summary()
    }

    pub(crate) fn perf_mut(&mut self) -> &mut PerfCounters {
        &mut self.perf
    }

    /// Send a message to this context's hooks and the process-wide sink.
    pub(crate) fn log(&self, level: LogLevel, message: &str) {
        self.hooks.on_log(level, message);
        logging::emit(level, message);
    }
}
