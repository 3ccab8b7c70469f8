use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::token::{Token, TokenType};

/// Special tokens a vocabulary may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialToken {
    Bos,
    Eos,
    Eot,
    Cls,
    Sep,
    Pad,
    Nl,
    FimPrefix,
    FimMiddle,
    FimSuffix,
}

/// Tokenizer surface the engine needs. Tokenization algorithms live behind it.
pub trait Vocabulary: Send + Sync {
    fn n_vocab(&self) -> usize;

    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError>;

    /// Raw bytes of one token. Control tokens render empty unless `special`.
    fn token_to_piece(&self, token: Token, special: bool) -> Vec<u8>;

    fn token_type(&self, token: Token) -> TokenType;

    fn special(&self, kind: SpecialToken) -> Option<Token>;

    // ========== DERIVED QUERIES ==========

    fn bos(&self) -> Option<Token> {
        self.special(SpecialToken::Bos)
    }

    fn eos(&self) -> Option<Token> {
        self.special(SpecialToken::Eos)
    }

    fn newline(&self) -> Option<Token> {
        self.special(SpecialToken::Nl)
    }

    /// End-of-generation: EOS or EOT.
    fn is_eog(&self, token: Token) -> bool {
        !token.is_null()
            && (Some(token) == self.special(SpecialToken::Eos)
                || Some(token) == self.special(SpecialToken::Eot))
    }

    fn is_control(&self, token: Token) -> bool {
        self.token_type(token) == TokenType::Control
    }

    /// Concatenate pieces. `remove_special` drops a leading BOS and a trailing EOS;
    /// `unparse_special` renders control tokens verbatim.
    fn detokenize(&self, tokens: &[Token], remove_special: bool, unparse_special: bool) -> Vec<u8> {
        let mut toks = tokens;
        if remove_special {
            if let (Some(first), Some(bos)) = (toks.first(), self.bos()) {
                if *first == bos {
                    toks = &toks[1..];
                }
            }
            if let (Some(last), Some(eos)) = (toks.last(), self.eos()) {
                if *last == eos {
                    toks = &toks[..toks.len() - 1];
                }
            }
        }
        let mut out = Vec::new();
        for tok in toks {
            out.extend_from_slice(&self.token_to_piece(*tok, unparse_special));
        }
        out
    }
}
