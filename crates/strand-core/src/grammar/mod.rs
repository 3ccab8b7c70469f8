//! Grammar-constrained sampling.
//!
//! A [`Grammar`] is parsed from GBNF text, compiled once and then tracks a
//! parse position as tokens are accepted. Before sampling it masks every
//! candidate whose text cannot extend the current position.

mod compile;
mod matcher;
mod parser;
mod vocab;

use std::sync::Arc;

use strand_abi::{Token, Vocabulary};
use tracing::trace;

use crate::error::{Error, Result};
use crate::sampling::Candidates;

pub use compile::CompiledGrammar;
pub use matcher::PartialUtf8;
pub use parser::{Alternative, Repeat, RuleDef, Term, parse};
pub use vocab::VocabIndex;

use matcher::{Stack, decode_utf8};

/// Parse position in a compiled grammar, bound to one vocabulary.
///
/// Cloning is cheap: rule tables and the vocabulary index are shared.
#[derive(Debug, Clone)]
pub struct Grammar {
    rules: Arc<CompiledGrammar>,
    vocab: Arc<VocabIndex>,
    stacks: Vec<Stack>,
    partial: PartialUtf8,
}

impl Grammar {
    /// Parse and compile `src` with `root` as the start rule.
    pub fn new(src: &str, root: &str, vocab: &dyn Vocabulary) -> Result<Self> {
        let rules = compile::compile(&parse(src)?, root)?;
        Ok(Self::from_parts(
            Arc::new(rules),
            Arc::new(VocabIndex::from_vocab(vocab)),
        ))
    }

    /// Start a fresh parse over already-compiled parts.
    pub fn from_parts(rules: Arc<CompiledGrammar>, vocab: Arc<VocabIndex>) -> Self {
        let stacks = rules.initial_stacks();
        Self {
            rules,
            vocab,
            stacks,
            partial: PartialUtf8::default(),
        }
    }

    pub fn rules(&self) -> &Arc<CompiledGrammar> {
        &self.rules
    }

    pub fn vocab_index(&self) -> &Arc<VocabIndex> {
        &self.vocab
    }

    /// True when the text accepted so far is a complete sentence.
    pub fn is_accepting(&self) -> bool {
        self.partial.n_remain == 0 && self.stacks.iter().any(Vec::is_empty)
    }

    /// True when `token` may come next.
    pub fn accepts(&self, token: Token) -> bool {
        if self.vocab.is_eog(token) {
            return self.is_accepting();
        }
        self.advance(token).is_some()
    }

    fn advance(&self, token: Token) -> Option<(Vec<Stack>, PartialUtf8)> {
        let piece = self.vocab.piece(token)?;
        if piece.is_empty() {
            return None;
        }
        let owned;
        let (cps, partial) = if self.partial.n_remain == 0 {
            let (cps, partial) = self.vocab.decoded(token)?;
            (cps.as_slice(), *partial)
        } else {
            owned = decode_utf8(piece, self.partial)?;
            (owned.0.as_slice(), owned.1)
        };

        let mut stacks: Option<Vec<Stack>> = None;
        for &cp in cps {
            let next = self
                .rules
                .step(stacks.as_deref().unwrap_or(&self.stacks[..]), cp);
            if next.is_empty() {
                return None;
            }
            stacks = Some(next);
        }
        let mut stacks = stacks.unwrap_or_else(|| self.stacks.clone());
        if partial.n_remain > 0 {
            stacks.retain(|s| self.rules.partial_fits(s, partial));
            if stacks.is_empty() {
                return None;
            }
        }
        Some((stacks, partial))
    }

    /// Set every disallowed entry of a full logit row to -inf.
    pub fn mask_logits(&self, logits: &mut [f32]) {
        for (i, l) in logits.iter_mut().enumerate() {
            if *l != f32::NEG_INFINITY && !self.accepts(Token(i as i32)) {
                *l = f32::NEG_INFINITY;
            }
        }
    }

    /// Mask disallowed candidates to -inf.
    pub fn apply(&self, candidates: &mut Candidates) {
        for d in &mut candidates.data {
            if d.logit != f32::NEG_INFINITY && !self.accepts(d.id) {
                d.logit = f32::NEG_INFINITY;
            }
        }
    }

    /// Advance past `token`. A rejected token leaves the position unchanged.
    pub fn accept_token(&mut self, token: Token) -> Result<()> {
        if self.vocab.is_eog(token) {
            if self.is_accepting() {
                self.stacks.retain(Vec::is_empty);
                return Ok(());
            }
            return Err(Error::GrammarReject(token));
        }
        let (stacks, partial) = self.advance(token).ok_or(Error::GrammarReject(token))?;
        trace!(token = token.0, n_stacks = stacks.len(), "grammar advanced");
        self.stacks = stacks;
        self.partial = partial;
        Ok(())
    }

    /// Back to the start of the root rule.
    pub fn reset(&mut self) {
        self.stacks = self.rules.initial_stacks();
        self.partial = PartialUtf8::default();
    }
}
