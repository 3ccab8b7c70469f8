use strand_abi::{Pos, Token};
use tracing::debug;

use super::Generator;
use super::utils::lcp_len;
use crate::backend::ComputeBackend;
use crate::error::Result;

pub(super) struct Prefill {
    pub(super) n_reused: usize,
    pub(super) stopped: bool,
}

impl<B: ComputeBackend> Generator<B> {
    /// Evaluate `prompt` into the sequence, reusing cached cells for the
    /// longest common prefix with what is already there.
    pub(super) fn prefill(&mut self, prompt: &[Token]) -> Result<Prefill> {
        let mut lcp = lcp_len(&self.history, prompt);
        // the last prompt token is always evaluated so its logits exist
        if lcp == prompt.len() {
            lcp = lcp.saturating_sub(1);
        }
        if lcp < self.history.len() {
            debug!(
                lcp,
                prev_len = self.history.len(),
                new_len = prompt.len(),
                "prompt diverged; truncating cached sequence"
            );
            self.ctx.kv_cache_mut().remove(self.seq, lcp as Pos, -1)?;
            self.history.truncate(lcp);
        } else if lcp > 0 {
            debug!(lcp, new_len = prompt.len(), "reusing cached prefix");
        }

        let n_batch = self.ctx.n_batch();
        for (i, chunk) in prompt[lcp..].chunks(n_batch).enumerate() {
            if self.stop_requested() {
                debug!(chunk = i, "stop requested during prefill");
                return Ok(Prefill {
                    n_reused: lcp,
                    stopped: true,
                });
            }
            let n_past = self.history.len() as Pos;
            debug!(chunk = i, len = chunk.len(), n_past, "prefill chunk");
            self.batch.fill_sequence(chunk, n_past, self.seq)?;
            self.ctx.decode(&self.batch)?;
            self.history.extend_from_slice(chunk);
        }
        Ok(Prefill {
            n_reused: lcp,
            stopped: false,
        })
    }
}
