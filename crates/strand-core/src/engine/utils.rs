use strand_abi::Token;

/// Bytes at the front of `bytes` that can be emitted now: the valid UTF-8
/// prefix, plus an invalid sequence right after it (it renders as U+FFFD).
/// An incomplete trailing sequence is held back.
pub(super) fn utf8_ready_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => e.valid_up_to() + e.error_len().unwrap_or(0),
    }
}

#[inline]
pub(super) fn lcp_len(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_stops_before_split_char() {
        let euro = "a€".as_bytes();
        assert_eq!(utf8_ready_len(euro), 4);
        assert_eq!(utf8_ready_len(&euro[..3]), 1);
        assert_eq!(utf8_ready_len(&[]), 0);
    }

    #[test]
    fn invalid_bytes_are_not_held_back() {
        assert_eq!(utf8_ready_len(&[b'a', 0xFF, b'b']), 2);
        assert_eq!(utf8_ready_len(&[0xFF]), 1);
    }

    #[test]
    fn lcp_of_diverging_prompts() {
        let a = [Token(1), Token(2), Token(3)];
        let b = [Token(1), Token(2), Token(9), Token(4)];
        assert_eq!(lcp_len(&a, &b), 2);
        assert_eq!(lcp_len(&a, &a[..1]), 1);
        assert_eq!(lcp_len(&[], &a), 0);
    }
}
