// Pre-allocated submission buffer for one decode round.
// - Allocated once with a fixed capacity; `clear()` only resets the count.
// - Homogeneous: token mode (`n_embd == 0`) or embedding mode, never mixed.
// - Entries are appended strictly in order; indices are batch positions.

use strand_abi::{Pos, SeqId, Token};

use crate::error::{Error, Result};

pub struct Batch {
    tokens: Vec<Token>,
    embd: Vec<f32>,
    pos: Vec<Pos>,
    seq_ids: Vec<Vec<SeqId>>,
    logits: Vec<bool>,
    n_tokens: usize,
    n_tokens_max: usize,
    n_embd: usize,
    n_seq_max: usize,
}

impl Batch {
    /// Create a batch with room for `n_tokens_max` entries.
    /// `n_embd = 0` is token mode; otherwise each entry carries `n_embd` floats.
    /// `n_seq_max` bounds the sequence ids an entry may name.
    pub fn new(n_tokens_max: usize, n_embd: usize, n_seq_max: usize) -> Self {
        let n_seq_max = n_seq_max.max(1);
        Self {
            tokens: if n_embd == 0 {
                vec![Token::NULL; n_tokens_max]
            } else {
                Vec::new()
            },
            embd: vec![0.0; n_tokens_max * n_embd],
            pos: vec![0; n_tokens_max],
            seq_ids: (0..n_tokens_max)
                .map(|_| Vec::with_capacity(n_seq_max))
                .collect(),
            logits: vec![false; n_tokens_max],
            n_tokens: 0,
            n_tokens_max,
            n_embd,
            n_seq_max,
        }
    }

    /// Token-mode batch for a single sequence.
    pub fn for_tokens(n_tokens_max: usize) -> Self {
        Self::new(n_tokens_max, 0, 1)
    }

    /// Append one token entry.
    pub fn add(&mut self, token: Token, pos: Pos, seq_ids: &[SeqId], logits: bool) -> Result<()> {
        if self.is_embedding() {
            return Err(Error::InvalidArgument(
                "token entry added to an embedding batch".into(),
            ));
        }
        let i = self.reserve_entry(pos, seq_ids, logits)?;
        self.tokens[i] = token;
        Ok(())
    }

    /// Append one embedding entry of exactly `n_embd` floats.
    pub fn add_embedding(
        &mut self,
        embd: &[f32],
        pos: Pos,
        seq_ids: &[SeqId],
        logits: bool,
    ) -> Result<()> {
        if !self.is_embedding() {
            return Err(Error::InvalidArgument(
                "embedding entry added to a token batch".into(),
            ));
        }
        if embd.len() != self.n_embd {
            return Err(Error::InvalidArgument(format!(
                "embedding width {} != batch n_embd {}",
                embd.len(),
                self.n_embd
            )));
        }
        let i = self.reserve_entry(pos, seq_ids, logits)?;
        self.embd[i * self.n_embd..(i + 1) * self.n_embd].copy_from_slice(embd);
        Ok(())
    }

    fn reserve_entry(&mut self, pos: Pos, seq_ids: &[SeqId], logits: bool) -> Result<usize> {
        if self.n_tokens >= self.n_tokens_max {
            return Err(Error::CapacityExceeded(format!(
                "batch holds at most {} entries",
                self.n_tokens_max
            )));
        }
        if seq_ids.is_empty() {
            return Err(Error::InvalidSequenceSet("entry has no sequence id".into()));
        }
        if let Some(bad) = seq_ids
            .iter()
            .find(|s| **s < 0 || **s as usize >= self.n_seq_max)
        {
            return Err(Error::InvalidSequenceSet(format!(
                "sequence id {bad} outside [0, {})",
                self.n_seq_max
            )));
        }

        let i = self.n_tokens;
        self.pos[i] = pos;
        self.logits[i] = logits;
        let ids = &mut self.seq_ids[i];
        ids.clear();
        for s in seq_ids {
            if !ids.contains(s) {
                ids.push(*s);
            }
        }
        self.n_tokens += 1;
        Ok(i)
    }

    /// Reset the entry count. Storage is kept for reuse.
    #[inline]
    pub fn clear(&mut self) {
        self.n_tokens = 0;
    }

    /// Ensure only the last entry asks for logits.
    pub fn mark_last_for_logits(&mut self) {
        if self.n_tokens == 0 {
            return;
        }
        for flag in &mut self.logits[..self.n_tokens] {
            *flag = false;
        }
        self.logits[self.n_tokens - 1] = true;
    }

    /// Clear and fill with a single-sequence chunk starting at `n_past`,
    /// requesting logits only for the final token.
    pub fn fill_sequence(&mut self, tokens: &[Token], n_past: Pos, seq: SeqId) -> Result<()> {
        self.clear();
        for (i, tok) in tokens.iter().enumerate() {
            let last = i + 1 == tokens.len();
            self.add(*tok, n_past + i as Pos, &[seq], last)?;
        }
        Ok(())
    }

    // ========== ACCESSORS ==========

    #[inline]
    pub fn len(&self) -> usize {
        self.n_tokens
    }

    /// Same as [`Batch::len`].
    #[inline]
    pub fn count(&self) -> usize {
        self.n_tokens
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.n_tokens_max
    }

    #[inline]
    pub fn is_embedding(&self) -> bool {
        self.n_embd > 0
    }

    #[inline]
    pub fn n_embd(&self) -> usize {
        self.n_embd
    }

    #[inline]
    pub fn n_seq_max(&self) -> usize {
        self.n_seq_max
    }

    /// Token of entry `i`; `None` in embedding mode.
    pub fn token(&self, i: usize) -> Option<Token> {
        if i < self.n_tokens && !self.is_embedding() {
            Some(self.tokens[i])
        } else {
            None
        }
    }

    /// Embedding row of entry `i`; `None` in token mode.
    pub fn embedding(&self, i: usize) -> Option<&[f32]> {
        if i < self.n_tokens && self.is_embedding() {
            Some(&self.embd[i * self.n_embd..(i + 1) * self.n_embd])
        } else {
            None
        }
    }

    #[inline]
    pub fn pos(&self, i: usize) -> Pos {
        self.pos[..self.n_tokens][i]
    }

    #[inline]
    pub fn seq_ids(&self, i: usize) -> &[SeqId] {
        &self.seq_ids[..self.n_tokens][i]
    }

    #[inline]
    pub fn wants_logits(&self, i: usize) -> bool {
        self.logits[..self.n_tokens][i]
    }

    /// Number of entries that request an output row.
    pub fn n_outputs(&self) -> usize {
        self.logits[..self.n_tokens].iter().filter(|l| **l).count()
    }

    pub fn positions(&self) -> &[Pos] {
        &self.pos[..self.n_tokens]
    }
}
