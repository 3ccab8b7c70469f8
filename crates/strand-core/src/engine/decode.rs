use std::sync::Arc;

use strand_abi::{Model, Pos, Token};
use tracing::{debug, info};

use super::utils::utf8_ready_len;
use super::{Generation, Generator, StopReason};
use crate::backend::ComputeBackend;
use crate::debug::dump_str;
use crate::error::{Error, Result};

impl<B: ComputeBackend> Generator<B> {
    /// Tokenize `prompt` (adding BOS if the vocabulary has one) and generate.
    pub fn generate(&mut self, prompt: &str) -> Result<Generation> {
        self.generate_stream(prompt, |_| {})
    }

    /// Like [`Generator::generate`], calling `on_delta` with each UTF-8 chunk as it
    /// becomes complete.
    pub fn generate_stream<F>(&mut self, prompt: &str, on_delta: F) -> Result<Generation>
    where
        F: FnMut(&str),
    {
        let tokens = self.ctx.model().vocab().tokenize(prompt, true, true)?;
        debug!(n_tokens = tokens.len(), "tokenized prompt");
        self.generate_tokens(&tokens, on_delta)
    }

    /// Generate from an already-tokenized prompt.
    pub fn generate_tokens<F>(&mut self, prompt: &[Token], mut on_delta: F) -> Result<Generation>
    where
        F: FnMut(&str),
    {
        if prompt.is_empty() {
            return Err(Error::InvalidArgument("empty prompt".into()));
        }
        self.clear_stop();

        let step_limit = self.compute_step_limit(prompt.len());
        let prefill = self.prefill(prompt)?;
        info!(
            n_prompt = prompt.len(),
            n_reused = prefill.n_reused,
            step_limit,
            "prefill done"
        );

        let mut out = Generation {
            text: String::new(),
            tokens: Vec::new(),
            stop: StopReason::StepLimit,
            n_prompt: prompt.len(),
            n_reused: prefill.n_reused,
        };
        if prefill.stopped {
            out.stop = StopReason::Stopped;
            return Ok(out);
        }

        // prompt tokens feed the penalties but not the grammar
        self.sampler.reset();
        for t in prompt {
            self.sampler.accept(*t, false)?;
        }

        let model = Arc::clone(self.ctx.model());
        let vocab = model.vocab();
        let mut staging: Vec<u8> = Vec::with_capacity(64);

        for step in 0..step_limit {
            if self.stop_requested() {
                debug!(step, "stop requested");
                out.stop = StopReason::Stopped;
                break;
            }

            let token = self.sampler.sample(&mut self.ctx, -1)?;
            self.sampler.accept(token, true)?;
            if vocab.is_eog(token) {
                debug!(step, token = token.0, "end of generation");
                out.stop = StopReason::EndOfGeneration;
                break;
            }

            if self.window_full() {
                self.shift_context()?;
            }
            let n_past = self.history.len() as Pos;
            self.batch.fill_sequence(&[token], n_past, self.seq)?;
            self.ctx.decode(&self.batch)?;
            self.history.push(token);
            out.tokens.push(token);

            // emit only complete code points
            staging.extend_from_slice(&vocab.token_to_piece(token, false));
            let mut ready = utf8_ready_len(&staging);
            while ready > 0 {
                let taken: Vec<u8> = staging.drain(..ready).collect();
                let delta = String::from_utf8_lossy(&taken);
                dump_str("delta", &delta);
                on_delta(&delta);
                out.text.push_str(&delta);
                ready = utf8_ready_len(&staging);
            }
        }

        if !staging.is_empty() {
            // generation ended inside a multi-byte sequence
            let tail = String::from_utf8_lossy(&staging);
            on_delta(&tail);
            out.text.push_str(&tail);
        }

        info!(
            n_generated = out.tokens.len(),
            stop = ?out.stop,
            "generation complete"
        );
        Ok(out)
    }
}
