use strand_abi::{BackendError, SpecialToken, Token, TokenType, Vocabulary};

pub const UNK: Token = Token(0);
pub const BOS: Token = Token(1);
pub const EOS: Token = Token(2);

const N_CONTROL: usize = 3;
const BYTE_BASE: usize = N_CONTROL;
const N_BYTES: usize = 256;
const EXTRA_BASE: usize = BYTE_BASE + N_BYTES;

const CONTROL_TEXT: [&str; N_CONTROL] = ["<unk>", "<s>", "</s>"];

/// Byte-fallback vocabulary.
///
/// Layout: `<unk>`, `<s>`, `</s>`, then one token per byte value, then the
/// extra multi-byte pieces in the order given. Tokenization is greedy
/// longest-match over the extras, falling back to single bytes.
#[derive(Debug, Clone)]
pub struct SimVocab {
    extras: Vec<Vec<u8>>,
}

impl SimVocab {
    pub fn new<I, S>(extras: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extras: extras
                .into_iter()
                .map(|s| s.into().into_bytes())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Token for a single byte value.
    pub fn byte_token(b: u8) -> Token {
        Token((BYTE_BASE + b as usize) as i32)
    }

    /// Token of an extra piece, if the vocabulary has it.
    pub fn piece_token(&self, piece: &str) -> Option<Token> {
        self.extras
            .iter()
            .position(|p| p == piece.as_bytes())
            .map(|i| Token((EXTRA_BASE + i) as i32))
    }

    fn longest_extra(&self, rest: &[u8]) -> Option<(usize, usize)> {
        self.extras
            .iter()
            .enumerate()
            .filter(|(_, p)| rest.starts_with(p))
            .max_by_key(|(i, p)| (p.len(), std::cmp::Reverse(*i)))
            .map(|(i, p)| (i, p.len()))
    }
}

impl Default for SimVocab {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl Vocabulary for SimVocab {
    fn n_vocab(&self) -> usize {
        EXTRA_BASE + self.extras.len()
    }

    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError> {
        let mut out = Vec::with_capacity(text.len() + 1);
        if add_special {
            out.push(BOS);
        }
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let rest = &bytes[i..];
            if parse_special {
                if let Some(c) = CONTROL_TEXT
                    .iter()
                    .position(|t| rest.starts_with(t.as_bytes()))
                {
                    out.push(Token(c as i32));
                    i += CONTROL_TEXT[c].len();
                    continue;
                }
            }
            match self.longest_extra(rest) {
                Some((idx, len)) => {
                    out.push(Token((EXTRA_BASE + idx) as i32));
                    i += len;
                }
                None => {
                    out.push(Self::byte_token(bytes[i]));
                    i += 1;
                }
            }
        }
        Ok(out)
    }

    fn token_to_piece(&self, token: Token, special: bool) -> Vec<u8> {
        let Some(id) = token.index() else {
            return Vec::new();
        };
        if id < N_CONTROL {
            return if special {
                CONTROL_TEXT[id].as_bytes().to_vec()
            } else {
                Vec::new()
            };
        }
        if id < EXTRA_BASE {
            return vec![(id - BYTE_BASE) as u8];
        }
        self.extras.get(id - EXTRA_BASE).cloned().unwrap_or_default()
    }

    fn token_type(&self, token: Token) -> TokenType {
        match token.index() {
            Some(0) => TokenType::Unknown,
            Some(id) if id < N_CONTROL => TokenType::Control,
            Some(id) if id < EXTRA_BASE => TokenType::Byte,
            Some(id) if id < self.n_vocab() => TokenType::Normal,
            _ => TokenType::Undefined,
        }
    }

    fn special(&self, kind: SpecialToken) -> Option<Token> {
        match kind {
            SpecialToken::Bos => Some(BOS),
            SpecialToken::Eos => Some(EOS),
            SpecialToken::Nl => Some(Self::byte_token(b'\n')),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_match_then_bytes() {
        let v = SimVocab::new(["he", "hello", " w"]);
        let toks = v.tokenize("hello wx", false, false).unwrap();
        assert_eq!(
            toks,
            vec![
                v.piece_token("hello").unwrap(),
                v.piece_token(" w").unwrap(),
                SimVocab::byte_token(b'x'),
            ]
        );
        assert_eq!(v.detokenize(&toks, false, false), b"hello wx");
    }

    #[test]
    fn special_tokens() {
        let v = SimVocab::default();
        let toks = v.tokenize("a</s>", true, true).unwrap();
        assert_eq!(toks, vec![BOS, SimVocab::byte_token(b'a'), EOS]);
        assert!(v.is_eog(EOS));
        assert!(v.is_control(BOS));
        assert!(v.token_to_piece(EOS, false).is_empty());
        assert_eq!(v.token_to_piece(EOS, true), b"</s>");
        // without parse_special the marker is plain text
        assert_eq!(v.tokenize("</s>", false, false).unwrap().len(), 4);
        assert_eq!(v.detokenize(&toks, true, false), b"a");
    }
}
