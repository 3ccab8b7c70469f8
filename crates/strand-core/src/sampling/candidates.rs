use std::cmp::Ordering;

use strand_abi::Token;

/// One entry of the candidate distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: Token,
    pub logit: f32,
    /// Probability after the last [`Candidates::softmax`]; 0 before that.
    pub p: f32,
}

/// Candidate list a sampling step narrows down.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub(crate) data: Vec<TokenData>,
    /// Sorted by logit, descending.
    pub(crate) sorted: bool,
}

fn by_logit_desc(a: &TokenData, b: &TokenData) -> Ordering {
    b.logit.partial_cmp(&a.logit).unwrap_or(Ordering::Equal)
}

impl Candidates {
    pub fn from_logits(logits: &[f32]) -> Self {
        Self {
            data: logits
                .iter()
                .enumerate()
                .map(|(i, &logit)| TokenData {
                    id: Token(i as i32),
                    logit,
                    p: 0.0,
                })
                .collect(),
            sorted: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    pub fn ids(&self) -> impl Iterator<Item = Token> + '_ {
        self.data.iter().map(|d| d.id)
    }

    pub fn sort(&mut self) {
        if !self.sorted {
            self.data.sort_by(by_logit_desc);
            self.sorted = true;
        }
    }

    /// Sort by logit and fill `p` with normalized probabilities.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort();
        let max = self.data[0].logit;
        let mut sum = 0.0f32;
        for d in &mut self.data {
            let e = if max.is_finite() || d.logit == max {
                (d.logit - max).exp()
            } else {
                0.0
            };
            let e = if e.is_nan() { 1.0 } else { e };
            d.p = e;
            sum += e;
        }
        if sum > 0.0 {
            for d in &mut self.data {
                d.p /= sum;
            }
        }
    }

    /// Keep the first `k` entries (at least `min_keep`).
    pub fn truncate(&mut self, k: usize, min_keep: usize) {
        let k = k.max(min_keep).min(self.data.len());
        self.data.truncate(k);
    }

    /// Highest-logit entry; ties keep the lowest token id.
    pub fn argmax(&self) -> Option<TokenData> {
        let mut best: Option<TokenData> = None;
        for d in &self.data {
            match best {
                Some(b) if !(d.logit > b.logit) => {}
                _ => best = Some(*d),
            }
        }
        best
    }

    /// Drop entries whose logit is -inf.
    pub fn retain_finite(&mut self) {
        self.data.retain(|d| d.logit != f32::NEG_INFINITY);
    }

    pub(crate) fn get_mut(&mut self, id: Token) -> Option<&mut TokenData> {
        let i = self.position(id)?;
        self.data.get_mut(i)
    }

    fn position(&self, id: Token) -> Option<usize> {
        // Unsorted candidates built from logits are indexed by token id.
        if !self.sorted {
            if let Some(i) = id.index() {
                if self.data.get(i).is_some_and(|d| d.id == id) {
                    return Some(i);
                }
            }
        }
        self.data.iter().position(|d| d.id == id)
    }
}
