use std::collections::BTreeMap;
use std::time::Instant;

use strand_abi::{BackendError, Model, SeqId};
use tracing::debug;

use super::Context;
use crate::backend::{ComputeBackend, expected_rows};
use crate::batch::Batch;
use crate::error::{Error, Result};
use crate::hooks::EvalEvent;
use crate::logging::LogLevel;
use crate::params::PoolingType;

impl<B: ComputeBackend> Context<B> {
    /// Submit every entry of `batch` to the backend as one unit.
    ///
    /// Atomic: on any error the cache content (owners and positions of every
    /// cell) and the previous outputs are untouched. A pending shift or defrag
    /// is applied before the backend runs and stays applied after a failure;
    /// it moves or re-encodes cells without changing what they hold.
    pub fn decode(&mut self, batch: &Batch) -> Result<()> {
        let n = batch.len();
        if n == 0 {
            return Err(Error::InvalidArgument("empty batch".into()));
        }
        if n > self.n_batch() {
            return Err(Error::InvalidArgument(format!(
                "batch of {n} entries exceeds n_batch = {}",
                self.n_batch()
            )));
        }
        self.validate_batch(batch)?;
        self.check_capacity(batch)?;

        // Pending shift/defrag must land before new cells are placed.
        self.update()?;
        let slot = match self.kv.find_slot(n) {
            Some(slot) => slot,
            None => {
                let moved = self.kv.run_defrag();
                debug!(moved, "kv fragmented: compacted before decode");
                self.kv.find_slot(n).ok_or_else(|| Error::ContextOverflow {
                    seq: batch.seq_ids(0)[0],
                    needed: self.kv.used_cells() + n,
                    n_ctx: self.n_ctx(),
                })?
            }
        };

        let t0 = Instant::now();
        let result = {
            let hooks = &self.hooks;
            let mut abort = || hooks.should_abort();
            self.backend
                .decode(&*self.model, &self.kv, batch, &mut abort)
        };
        let out = match result {
            Ok(out) => out,
            Err(e) => {
                let err = Error::from(e);
                self.log(LogLevel::Warn, &format!("decode failed: {err}"));
                return Err(err);
            }
        };

        let (n_logits, n_embd_vals) = expected_rows(&*self.model, batch);
        if out.cells.len() != n || out.logits.len() != n_logits {
            return Err(Error::BackendFailure(BackendError::Compute(format!(
                "backend returned {} cells / {} logits, expected {n} / {n_logits}",
                out.cells.len(),
                out.logits.len()
            ))));
        }
        if self.params.embeddings && out.embeddings.len() != n_embd_vals {
            return Err(Error::BackendFailure(BackendError::Compute(format!(
                "backend returned {} embedding values, expected {n_embd_vals}",
                out.embeddings.len()
            ))));
        }

        // ----- commit -----
        self.kv.commit(slot, batch, out.cells);

        self.output_ids.clear();
        let mut row = 0;
        for i in 0..n {
            if batch.wants_logits(i) {
                self.output_ids.push(row);
                row += 1;
            } else {
                self.output_ids.push(-1);
            }
        }
        self.n_outputs = row as usize;
        self.logits = out.logits;
        self.embd = if self.params.embeddings {
            out.embeddings
        } else {
            Vec::new()
        };
        self.pool_embeddings(batch);

        let elapsed = t0.elapsed();
        self.perf.record_decode(n, elapsed);
        self.hooks.on_eval(&EvalEvent {
            n_tokens: n,
            n_outputs: self.n_outputs,
            kv_used: self.kv.used_cells(),
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        });
        self.kv.schedule_defrag_if_fragmented();
        debug!(
            n_tokens = n,
            n_outputs = self.n_outputs,
            kv_used = self.kv.used_cells(),
            "decode"
        );
        Ok(())
    }

    fn validate_batch(&self, batch: &Batch) -> Result<()> {
        let n_seq_max = self.n_seq_max();
        if batch.is_embedding() && batch.n_embd() != self.model.n_embd() {
            return Err(Error::InvalidArgument(format!(
                "embedding batch width {} != model n_embd {}",
                batch.n_embd(),
                self.model.n_embd()
            )));
        }
        let n_vocab = self.n_vocab();
        for i in 0..batch.len() {
            if let Some(tok) = batch.token(i) {
                if tok.index().is_none_or(|t| t >= n_vocab) {
                    return Err(Error::InvalidArgument(format!(
                        "token {} at entry {i} outside vocabulary of {n_vocab}",
                        tok.0
                    )));
                }
            }
            if let Some(s) = batch
                .seq_ids(i)
                .iter()
                .find(|s| **s < 0 || **s as usize >= n_seq_max)
            {
                return Err(Error::InvalidSequenceSet(format!(
                    "sequence id {s} at entry {i} outside [0, {n_seq_max})"
                )));
            }
            if batch.pos(i) < 0 {
                return Err(Error::InvalidArgument(format!(
                    "negative position {} at entry {i}",
                    batch.pos(i)
                )));
            }
        }
        Ok(())
    }

    /// Every touched sequence must fit in `n_ctx`, and the table must have room.
    fn check_capacity(&self, batch: &Batch) -> Result<()> {
        let n_ctx = self.n_ctx();
        let mut incoming: BTreeMap<SeqId, usize> = BTreeMap::new();
        for i in 0..batch.len() {
            for s in batch.seq_ids(i) {
                *incoming.entry(*s).or_default() += 1;
            }
        }
        for (seq, add) in incoming {
            let needed = self.kv.seq_cell_count(seq) + add;
            if needed > n_ctx {
                return Err(Error::ContextOverflow { seq, needed, n_ctx });
            }
        }
        if self.kv.free_cells() < batch.len() {
            return Err(Error::ContextOverflow {
                seq: batch.seq_ids(0)[0],
                needed: self.kv.used_cells() + batch.len(),
                n_ctx,
            });
        }
        Ok(())
    }

    fn pool_embeddings(&mut self, batch: &Batch) {
        self.seq_embd.clear();
        let pooling = self.params.pooling_type;
        if !self.params.embeddings || matches!(pooling, PoolingType::None | PoolingType::Unspecified)
        {
            return;
        }
        let n_embd = self.model.n_embd();
        let mut rows: BTreeMap<SeqId, Vec<usize>> = BTreeMap::new();
        for i in 0..batch.len() {
            if let Ok(row) = usize::try_from(self.output_ids[i]) {
                for s in batch.seq_ids(i) {
                    rows.entry(*s).or_default().push(row);
                }
            }
        }
        for (seq, rows) in rows {
            let row_of = |r: usize| &self.embd[r * n_embd..(r + 1) * n_embd];
            let pooled = match pooling {
                PoolingType::Cls => row_of(rows[0]).to_vec(),
                PoolingType::Last => row_of(rows[rows.len() - 1]).to_vec(),
                _ => {
                    let mut acc = vec![0.0f32; n_embd];
                    for r in &rows {
                        for (a, v) in acc.iter_mut().zip(row_of(*r)) {
                            *a += v;
                        }
                    }
                    let inv = 1.0 / rows.len() as f32;
                    acc.iter_mut().for_each(|a| *a *= inv);
                    acc
                }
            };
            self.seq_embd.insert(seq, pooled);
        }
    }
}
