use std::sync::Arc;

use strand_abi::{BackendError, Model, Pos};

use crate::batch::Batch;
use crate::kv_cache::KvCache;

/// What one decode call hands back to the context.
#[derive(Debug, Clone, Default)]
pub struct BackendOutput {
    /// One state vector per batch entry, stored in the entry's new cache cell.
    pub cells: Vec<Arc<[f32]>>,
    /// `n_outputs * n_vocab` logits, rows in batch order of entries asking for them.
    pub logits: Vec<f32>,
    /// `n_outputs * n_embd` embeddings, same row order. May be empty.
    pub embeddings: Vec<f32>,
}

/// Tensor math behind the session engine. Called once per batch.
///
/// The backend sees the cache read-only: committing cells is the context's job,
/// so a failed or aborted decode leaves no trace.
pub trait ComputeBackend {
    type Model: strand_abi::Model;

    /// Evaluate every entry of `batch`. Each entry attends only to cache cells
    /// and earlier batch entries that share one of its sequence ids.
    /// `abort` should be polled periodically; when it returns `true`, fail with
    /// [`BackendError::Aborted`].
    fn decode(
        &mut self,
        model: &Self::Model,
        cache: &KvCache,
        batch: &Batch,
        abort: &mut dyn FnMut() -> bool,
    ) -> Result<BackendOutput, BackendError>;

    /// Re-encode a cached state after its position moved by `delta`.
    /// `None` keeps the state unchanged.
    fn shift_cell_state(
        &mut self,
        _model: &Self::Model,
        _state: &[f32],
        _pos: Pos,
        _delta: Pos,
    ) -> Option<Vec<f32>> {
        None
    }
}

/// Row count a well-formed [`BackendOutput`] must have for `batch`.
pub(crate) fn expected_rows(model: &dyn Model, batch: &Batch) -> (usize, usize) {
    let n_out = batch.n_outputs();
    (n_out * model.n_vocab(), n_out * model.n_embd())
}
