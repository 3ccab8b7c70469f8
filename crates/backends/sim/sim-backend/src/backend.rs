use std::sync::Arc;

use strand_abi::{BackendError, Model, Pos, SeqId, Token};
use strand_core::backend::{BackendOutput, ComputeBackend};
use strand_core::batch::Batch;
use strand_core::kv_cache::KvCache;
use tracing::trace;

use crate::model::SimModel;

/// splitmix64 finalizer.
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Deterministic value in [-1, 1).
fn unit(a: u64, b: u64) -> f32 {
    let h = mix(a ^ mix(b));
    ((h >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

const EMBED_SALT: u64 = 0x5EED_0001;
const UNEMBED_SALT: u64 = 0x5EED_0002;

/// Hash-based stand-in for a transformer.
///
/// Each entry's hidden state is its token embedding plus a distance-weighted
/// average of the states it attends to: cached cells of its sequences and
/// earlier entries of the same batch, both at positions `<= pos`. Cached
/// state is the raw token embedding, so only relative positions matter.
#[derive(Debug, Default)]
pub struct SimBackend {
    fail_next: Option<String>,
    n_decode: usize,
    n_tokens: usize,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next decode fail with a compute error.
    pub fn fail_next(&mut self, message: impl Into<String>) {
        self.fail_next = Some(message.into());
    }

    /// Successful decode calls so far.
    pub fn decode_calls(&self) -> usize {
        self.n_decode
    }

    /// Batch entries evaluated by successful decodes so far.
    pub fn tokens_evaluated(&self) -> usize {
        self.n_tokens
    }

    fn token_embedding(token: Token, n_embd: usize) -> Vec<f32> {
        let id = token.0 as u32 as u64;
        (0..n_embd)
            .map(|d| unit(EMBED_SALT ^ (id << 16), d as u64))
            .collect()
    }

    fn logits_for(hidden: &[f32], n_vocab: usize, out: &mut Vec<f32>) {
        for v in 0..n_vocab {
            let mut acc = 0.0f32;
            for (d, h) in hidden.iter().enumerate() {
                acc += h * unit(UNEMBED_SALT ^ ((v as u64) << 16), d as u64);
            }
            out.push(acc);
        }
    }
}

struct Source<'a> {
    pos: Pos,
    state: &'a [f32],
}

fn attend(own: &[f32], pos: Pos, mut sources: Vec<Source<'_>>) -> Vec<f32> {
    // stable: equal positions keep table-then-batch order
    sources.sort_by_key(|s| s.pos);
    let mut hidden = own.to_vec();
    let mut acc = vec![0.0f32; own.len()];
    let mut total = 0.0f32;
    for s in &sources {
        let w = 1.0 / (1.0 + (pos - s.pos) as f32);
        for (a, v) in acc.iter_mut().zip(s.state) {
            *a += w * v;
        }
        total += w;
    }
    if total > 0.0 {
        for (h, a) in hidden.iter_mut().zip(&acc) {
            *h += a / total;
        }
    }
    hidden
}

fn shares(a: &[SeqId], b: &[SeqId]) -> bool {
    a.iter().any(|s| b.contains(s))
}

impl ComputeBackend for SimBackend {
    type Model = SimModel;

    fn decode(
        &mut self,
        model: &SimModel,
        cache: &KvCache,
        batch: &Batch,
        abort: &mut dyn FnMut() -> bool,
    ) -> Result<BackendOutput, BackendError> {
        if let Some(msg) = self.fail_next.take() {
            return Err(BackendError::Compute(msg));
        }
        let n_embd = model.n_embd();
        let n_vocab = model.n_vocab();

        let own: Vec<Vec<f32>> = (0..batch.len())
            .map(|i| match batch.embedding(i) {
                Some(e) => e.to_vec(),
                None => Self::token_embedding(batch.token(i).unwrap_or(Token::NULL), n_embd),
            })
            .collect();

        let mut out = BackendOutput::default();
        for i in 0..batch.len() {
            if abort() {
                return Err(BackendError::Aborted);
            }
            let pos = batch.pos(i);
            let seqs = batch.seq_ids(i);
            let mut sources: Vec<Source<'_>> = cache
                .visible(seqs, pos)
                .map(|c| Source {
                    pos: c.pos(),
                    state: c.state(),
                })
                .collect();
            for j in 0..i {
                if batch.pos(j) <= pos && shares(batch.seq_ids(j), seqs) {
                    sources.push(Source {
                        pos: batch.pos(j),
                        state: &own[j],
                    });
                }
            }
            let hidden = attend(&own[i], pos, sources);

            if batch.wants_logits(i) {
                Self::logits_for(&hidden, n_vocab, &mut out.logits);
                out.embeddings.extend_from_slice(&hidden);
            }
            out.cells.push(Arc::from(own[i].as_slice()));
        }

        self.n_decode += 1;
        self.n_tokens += batch.len();
        trace!(n_tokens = batch.len(), n_outputs = batch.n_outputs(), "sim decode");
        Ok(out)
    }
}
