use strand_abi::{Token, Vocabulary};

use super::matcher::{PartialUtf8, decode_utf8};

/// Per-token pieces pre-decoded once per vocabulary, so masking a logit row
/// does not call back into the tokenizer.
#[derive(Debug, Clone)]
pub struct VocabIndex {
    pieces: Vec<Vec<u8>>,
    /// Code points of each piece decoded from a clean boundary; `None` when
    /// the piece is not valid UTF-8 on its own.
    decoded: Vec<Option<(Vec<u32>, PartialUtf8)>>,
    eog: Vec<bool>,
}

impl VocabIndex {
    pub fn from_vocab(vocab: &dyn Vocabulary) -> Self {
        let n = vocab.n_vocab();
        let mut pieces = Vec::with_capacity(n);
        let mut decoded = Vec::with_capacity(n);
        let mut eog = Vec::with_capacity(n);
        for id in 0..n {
            let tok = Token(id as i32);
            let piece = vocab.token_to_piece(tok, false);
            decoded.push(decode_utf8(&piece, PartialUtf8::default()));
            pieces.push(piece);
            eog.push(vocab.is_eog(tok));
        }
        Self {
            pieces,
            decoded,
            eog,
        }
    }

    pub fn n_vocab(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, token: Token) -> Option<&[u8]> {
        token.index().and_then(|i| self.pieces.get(i)).map(Vec::as_slice)
    }

    pub(crate) fn decoded(&self, token: Token) -> Option<&(Vec<u32>, PartialUtf8)> {
        token.index().and_then(|i| self.decoded.get(i)).and_then(Option::as_ref)
    }

    pub fn is_eog(&self, token: Token) -> bool {
        token.index().and_then(|i| self.eog.get(i)).copied().unwrap_or(false)
    }
}
