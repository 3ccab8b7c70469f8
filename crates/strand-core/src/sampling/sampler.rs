use rand::Rng;
use std::collections::VecDeque;
use std::time::Instant;

use strand_abi::{Model, SamplerStage, SamplingParams, Token};
use tracing::warn;

use super::candidates::{Candidates, TokenData};
use super::stages;
use crate::backend::ComputeBackend;
use crate::context::Context;
use crate::error::Result;
use crate::grammar::Grammar;

/// Token selection for one generation stream.
///
/// Holds the accepted-token ring used by penalties, the Mirostat `mu`
/// and an optional grammar. The random source belongs to the context.
#[derive(Clone)]
pub struct Sampler {
    params: SamplingParams,
    order: Vec<SamplerStage>,
    prev: VecDeque<Token>,
    mu: f32,
    grammar: Option<Grammar>,
    newline: Option<Token>,
    last_candidates: Vec<TokenData>,
}

impl Sampler {
    /// Build from params; conflicting knobs are resolved by [`SamplingParams::normalized`].
    pub fn new(params: SamplingParams) -> Self {
        let params = params.normalized();
        let order = params.stage_order();
        let mu = initial_mu(&params);
        Self {
            prev: VecDeque::with_capacity(params.n_prev),
            params,
            order,
            mu,
            grammar: None,
            newline: None,
            last_candidates: Vec::new(),
        }
    }

    pub fn with_grammar(mut self, grammar: Grammar) -> Self {
        self.grammar = Some(grammar);
        self
    }

    pub fn set_grammar(&mut self, grammar: Option<Grammar>) {
        self.grammar = grammar;
    }

    pub fn grammar(&self) -> Option<&Grammar> {
        self.grammar.as_ref()
    }

    /// Effective (normalized) parameters.
    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Token whose logit survives the penalties unless `penalize_newline` is set.
    /// [`Sampler::sample`] fills this from the model vocabulary.
    pub fn set_newline_token(&mut self, token: Option<Token>) {
        self.newline = token;
    }

    pub fn mu(&self) -> f32 {
        self.mu
    }

    /// Pick a token from output `idx` of the context's last decode.
    pub fn sample<B: ComputeBackend>(&mut self, ctx: &mut Context<B>, idx: i32) -> Result<Token> {
        let t0 = Instant::now();
        let logits = ctx.logits_ith(idx)?.to_vec();
        if self.newline.is_none() {
            self.newline = ctx.model().vocab().newline();
        }
        let token = self.sample_logits(&logits, ctx.rng_mut());
        ctx.perf_mut().record_sample(t0.elapsed());
        Ok(token)
    }

    /// Pick a token from a raw logit row, drawing from `rng`.
    pub fn sample_logits<R: Rng>(&mut self, logits: &[f32], rng: &mut R) -> Token {
        let mut c = Candidates::from_logits(logits);

        if let Some(bias) = &self.params.logit_bias {
            stages::logit_bias(&mut c, bias);
        }
        if let Some(pen) = &self.params.repetition_penalty {
            let nl = self
                .newline
                .and_then(|t| c.get_mut(t).map(|d| (t, d.logit)));
            let n = usize::try_from(pen.last_n).unwrap_or(0).min(self.prev.len());
            let recent: Vec<Token> = self.prev.iter().skip(self.prev.len() - n).copied().collect();
            stages::penalties(&mut c, &recent, pen);
            if !self.params.penalize_newline {
                if let Some((t, logit)) = nl {
                    if let Some(d) = c.get_mut(t) {
                        d.logit = logit;
                    }
                }
            }
        }

        if let Some(grammar) = &self.grammar {
            let best_unmasked = c.argmax();
            grammar.apply(&mut c);
            c.retain_finite();
            if c.is_empty() {
                // Nothing the grammar allows; keep the stream moving.
                warn!("grammar rejected every candidate; taking the best unmasked token");
                self.last_candidates.clear();
                return best_unmasked.map_or(Token::NULL, |d| d.id);
            }
        }

        let token = if self.params.greedy {
            c.argmax().map_or(Token::NULL, |d| d.id)
        } else if let Some(m) = self.params.mirostat.clone() {
            if let Some(t) = self.params.temperature {
                stages::temperature(&mut c, t);
            }
            let (idx, surprise) = if m.version == 1 {
                let m_top = m.m.unwrap_or(strand_abi::MirostatParams::DEFAULT_M).max(1) as usize;
                stages::mirostat_v1(&mut c, logits.len(), self.mu, m_top, rng)
            } else {
                stages::mirostat_v2(&mut c, self.mu, rng)
            };
            self.mu -= m.eta * (surprise - m.tau);
            c.as_slice()[idx].id
        } else {
            self.shape(&mut c);
            let idx = stages::draw(&mut c, rng);
            c.as_slice()[idx].id
        };

        self.keep_candidates(&mut c);
        token
    }

    /// Run the configured stages in order.
    fn shape(&self, c: &mut Candidates) {
        let p = &self.params;
        let mut scaled = false;
        for stage in &self.order {
            match stage {
                SamplerStage::TopK => {
                    if let Some(k) = p.top_k {
                        stages::top_k(c, k as usize, 1);
                    }
                }
                SamplerStage::TailFree => {
                    if let Some(z) = p.tfs_z {
                        stages::tail_free(c, z, 1);
                    }
                }
                SamplerStage::Typical => {
                    if let Some(tp) = p.typical_p {
                        stages::typical(c, tp, 1);
                    }
                }
                SamplerStage::TopP => {
                    if let Some(tp) = p.top_p {
                        stages::top_p(c, tp, 1);
                    }
                }
                SamplerStage::MinP => {
                    if let Some(mp) = p.min_p {
                        stages::min_p(c, mp, 1);
                    }
                }
                SamplerStage::Temperature => {
                    if let Some(t) = p.temperature {
                        stages::temperature(c, t);
                    }
                    scaled = true;
                }
            }
        }
        if !scaled {
            if let Some(t) = p.temperature {
                stages::temperature(c, t);
            }
        }
    }

    fn keep_candidates(&mut self, c: &mut Candidates) {
        self.last_candidates.clear();
        if self.params.n_probs == 0 {
            return;
        }
        c.softmax();
        let n = self.params.n_probs.min(c.len());
        self.last_candidates.extend_from_slice(&c.as_slice()[..n]);
    }

    /// Record `token` as generated. With `apply_grammar`, the grammar advances
    /// first and a rejected token leaves the sampler unchanged.
    pub fn accept(&mut self, token: Token, apply_grammar: bool) -> Result<()> {
        if apply_grammar {
            if let Some(grammar) = &mut self.grammar {
                grammar.accept_token(token)?;
            }
        }
        if self.params.n_prev == 0 {
            return Ok(());
        }
        if self.prev.len() == self.params.n_prev {
            self.prev.pop_front();
        }
        self.prev.push_back(token);
        Ok(())
    }

    /// Back to the freshly-built state: empty ring, initial `mu`, grammar at its root.
    pub fn reset(&mut self) {
        self.prev.clear();
        self.mu = initial_mu(&self.params);
        self.last_candidates.clear();
        if let Some(grammar) = &mut self.grammar {
            grammar.reset();
        }
    }

    /// Accepted tokens, oldest first.
    pub fn history(&self) -> impl Iterator<Item = Token> + '_ {
        self.prev.iter().copied()
    }

    pub fn last(&self) -> Option<Token> {
        self.prev.back().copied()
    }

    /// Top `n_probs` candidates of the last step, most likely first.
    pub fn candidates(&self) -> &[TokenData] {
        &self.last_candidates
    }
}

fn initial_mu(params: &SamplingParams) -> f32 {
    params.mirostat.as_ref().map_or(0.0, |m| 2.0 * m.tau)
}
