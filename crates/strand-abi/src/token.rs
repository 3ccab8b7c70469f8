use serde::{Deserialize, Serialize};

/// Wrapper for a model token (ID). Using a newtype avoids accidental
/// mixing with positions and sequence ids, which are plain `i32`s too.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Token(pub i32);

impl Token {
    /// Reserved "no token" sentinel. Never a real vocabulary index.
    pub const NULL: Token = Token(-1);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 < 0
    }

    /// Index into a vocabulary-sized table, `None` for the sentinel.
    #[inline]
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl From<i32> for Token {
    #[inline]
    fn from(value: i32) -> Self {
        Token(value)
    }
}

impl From<Token> for i32 {
    #[inline]
    fn from(token: Token) -> i32 {
        token.0
    }
}

/// Logical stream id inside one context.
pub type SeqId = i32;

/// Index into one sequence's history, starting at 0.
pub type Pos = i32;

/// Returned by position queries on a sequence that holds no cells.
pub const POS_NULL: Pos = -1;

/// Per-token attribute reported by the vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    Undefined,
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}
