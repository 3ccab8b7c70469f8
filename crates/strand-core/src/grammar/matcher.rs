//! Stack-set matcher over compiled rules.
//!
//! A parse position is a set of stacks. Each stack lists frames
//! `(rule, alternative, index)` with the innermost frame last; its top
//! always points at a character set. An empty stack means the input so far
//! is a complete sentence.

use super::compile::{CompiledGrammar, Sym};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Frame {
    rule: u32,
    alt: u32,
    idx: u32,
}

pub(crate) type Stack = Vec<Frame>;

/// Bytes of a code point still owed by a token that ended mid-sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialUtf8 {
    /// Bits decoded so far.
    pub value: u32,
    /// Continuation bytes still expected; 0 when at a code point boundary.
    pub n_remain: u8,
}

impl PartialUtf8 {
    /// Range of code points the pending sequence can still complete to
    /// without an overlong encoding. `None` when no completion is valid.
    fn range(self) -> Option<(u32, u32)> {
        let shift = 6 * u32::from(self.n_remain);
        let mut lo = self.value << shift;
        let hi = (lo | ((1 << shift) - 1)).min(MAX_CODE_POINT);
        match self.n_remain {
            1 if self.value < 2 => return None,
            2 if lo == 0 => lo = 0x800,
            3 if lo == 0 => lo = 0x10000,
            _ => {}
        }
        (lo <= hi).then_some((lo, hi))
    }
}

const MAX_CODE_POINT: u32 = 0x10_FFFF;

/// Check a continuation byte against the bytes before it. `value` and
/// `n_remain` describe the sequence before `b` is appended.
fn continuation_ok(value: u32, n_remain: u8, b: u8) -> bool {
    if b >> 6 != 0b10 {
        return false;
    }
    let next = (value << 6) | u32::from(b & 0x3F);
    match n_remain {
        // second byte of a four-byte sequence: U+10000..=U+10FFFF
        3 => (0x10..=0x10F).contains(&next),
        // second byte of a three-byte sequence: U+0800 and up, no surrogates
        2 if value < 0x10 => next >= 0x20 && !(0x360..=0x37F).contains(&next),
        _ => true,
    }
}

/// Decode `bytes` after a possibly incomplete earlier sequence.
/// `None` on invalid UTF-8, overlong forms and surrogates included.
pub fn decode_utf8(bytes: &[u8], partial: PartialUtf8) -> Option<(Vec<u32>, PartialUtf8)> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut value = partial.value;
    let mut n_remain = partial.n_remain;
    let mut it = bytes.iter().copied();

    loop {
        while n_remain > 0 {
            let Some(b) = it.next() else {
                return Some((out, PartialUtf8 { value, n_remain }));
            };
            if !continuation_ok(value, n_remain, b) {
                return None;
            }
            value = (value << 6) | u32::from(b & 0x3F);
            n_remain -= 1;
            if n_remain == 0 {
                out.push(value);
            }
        }
        let Some(b) = it.next() else {
            return Some((out, PartialUtf8::default()));
        };
        let (len, init) = match b {
            0x00..=0x7F => (1, u32::from(b)),
            0xC2..=0xDF => (2, u32::from(b & 0x1F)),
            0xE0..=0xEF => (3, u32::from(b & 0x0F)),
            0xF0..=0xF4 => (4, u32::from(b & 0x07)),
            _ => return None,
        };
        value = init;
        n_remain = len - 1;
        if n_remain == 0 {
            out.push(value);
        }
    }
}

impl CompiledGrammar {
    fn sym(&self, f: Frame) -> Option<&Sym> {
        self.rules[f.rule as usize][f.alt as usize].get(f.idx as usize)
    }

    /// Expand rule references at the top of `stack` until each resulting
    /// stack is empty or tops at a character set.
    fn expand(&self, mut stack: Stack, out: &mut Vec<Stack>) {
        let Some(&top) = stack.last() else {
            out.push(stack);
            return;
        };
        match self.sym(top) {
            None => {
                // alternative finished: pop and move the parent past its rule ref
                stack.pop();
                if let Some(parent) = stack.last_mut() {
                    parent.idx += 1;
                }
                self.expand(stack, out);
            }
            Some(Sym::Chars { .. }) => out.push(stack),
            Some(Sym::Rule(r)) => {
                for alt in 0..self.rules[*r].len() {
                    let mut next = stack.clone();
                    next.push(Frame {
                        rule: *r as u32,
                        alt: alt as u32,
                        idx: 0,
                    });
                    self.expand(next, out);
                }
            }
        }
    }

    fn normalize(mut stacks: Vec<Stack>) -> Vec<Stack> {
        stacks.sort_unstable();
        stacks.dedup();
        stacks
    }

    pub(crate) fn initial_stacks(&self) -> Vec<Stack> {
        let mut out = Vec::new();
        for alt in 0..self.rules[self.root].len() {
            self.expand(
                vec![Frame {
                    rule: self.root as u32,
                    alt: alt as u32,
                    idx: 0,
                }],
                &mut out,
            );
        }
        Self::normalize(out)
    }

    /// Consume one code point from every stack that can take it.
    pub(crate) fn step(&self, stacks: &[Stack], cp: u32) -> Vec<Stack> {
        let mut out = Vec::new();
        for stack in stacks {
            let Some(&top) = stack.last() else { continue };
            if self.sym(top).is_some_and(|s| s.matches(cp)) {
                let mut next = stack.clone();
                if let Some(f) = next.last_mut() {
                    f.idx += 1;
                }
                self.expand(next, &mut out);
            }
        }
        Self::normalize(out)
    }

    /// Can this stack's next character begin with the pending bytes?
    pub(crate) fn partial_fits(&self, stack: &Stack, partial: PartialUtf8) -> bool {
        let Some(&top) = stack.last() else {
            return false;
        };
        let Some((lo, hi)) = partial.range() else {
            return false;
        };
        self.sym(top).is_some_and(|s| s.matches_any_in(lo, hi))
    }
}
