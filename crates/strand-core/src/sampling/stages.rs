//! Candidate-shaping stages. Each one narrows or rescales the candidate list
//! in place and always leaves at least `min_keep` entries.

use rand::Rng;
use std::collections::HashMap;

use strand_abi::{PenaltyParams, Token};

use super::candidates::Candidates;

pub fn logit_bias(c: &mut Candidates, bias: &HashMap<u32, f32>) {
    for (&id, &b) in bias {
        if let Some(d) = c.get_mut(Token(id as i32)) {
            d.logit += b;
        }
    }
}

/// Repetition, frequency and presence penalties over `last` (oldest first).
pub fn penalties(c: &mut Candidates, last: &[Token], pen: &PenaltyParams) {
    if last.is_empty()
        || (pen.repeat == 1.0 && pen.frequency == 0.0 && pen.presence == 0.0)
    {
        return;
    }
    let mut counts: HashMap<Token, u32> = HashMap::new();
    for t in last {
        *counts.entry(*t).or_default() += 1;
    }
    for (tok, n) in counts {
        let Some(d) = c.get_mut(tok) else { continue };
        if d.logit <= 0.0 {
            d.logit *= pen.repeat;
        } else {
            d.logit /= pen.repeat;
        }
        d.logit -= n as f32 * pen.frequency + pen.presence;
    }
    c.sorted = false;
}

pub fn top_k(c: &mut Candidates, k: usize, min_keep: usize) {
    if k == 0 || k >= c.len() {
        return;
    }
    c.sort();
    c.truncate(k, min_keep);
}

/// Nucleus: smallest prefix whose cumulative probability reaches `p`.
pub fn top_p(c: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    c.softmax();
    let mut cum = 0.0;
    let mut last = c.len();
    for (i, d) in c.data.iter().enumerate() {
        cum += d.p;
        if cum >= p && i + 1 >= min_keep {
            last = i + 1;
            break;
        }
    }
    c.truncate(last, min_keep);
}

/// Keep tokens whose probability is at least `p` times the top probability.
pub fn min_p(c: &mut Candidates, p: f32, min_keep: usize) {
    if p <= 0.0 || c.is_empty() {
        return;
    }
    c.softmax();
    let threshold = c.data[0].p * p;
    let keep = c.data.iter().take_while(|d| d.p >= threshold).count();
    c.truncate(keep, min_keep);
}

/// Tail-free sampling: cut where the second derivative of the sorted
/// probabilities has accumulated `z` of its mass.
pub fn tail_free(c: &mut Candidates, z: f32, min_keep: usize) {
    if z >= 1.0 || c.len() <= 2 {
        return;
    }
    c.softmax();
    let first: Vec<f32> = c.data.windows(2).map(|w| w[0].p - w[1].p).collect();
    let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
    let sum: f32 = second.iter().sum();
    if sum > 1e-6 {
        second.iter_mut().for_each(|v| *v /= sum);
    } else {
        let n = second.len() as f32;
        second.iter_mut().for_each(|v| *v = 1.0 / n);
    }
    let mut cum = 0.0;
    let mut last = c.len();
    for (i, v) in second.iter().enumerate() {
        cum += v;
        if cum > z && i >= min_keep {
            last = i;
            break;
        }
    }
    c.truncate(last, min_keep);
}

/// Locally typical sampling: prefer tokens whose surprise is close to the
/// distribution's entropy, keeping mass `p`.
pub fn typical(c: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    c.softmax();
    let entropy: f32 = c
        .data
        .iter()
        .filter(|d| d.p > 0.0)
        .map(|d| -d.p * d.p.ln())
        .sum();

    let mut order: Vec<(f32, usize)> = c
        .data
        .iter()
        .enumerate()
        .map(|(i, d)| ((-d.p.ln() - entropy).abs(), i))
        .collect();
    order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut cum = 0.0;
    let mut last = order.len();
    for (i, (_, idx)) in order.iter().enumerate() {
        cum += c.data[*idx].p;
        if cum > p && i + 1 >= min_keep {
            last = i + 1;
            break;
        }
    }
    c.data = order[..last].iter().map(|(_, idx)| c.data[*idx]).collect();
    c.sorted = false;
}

pub fn temperature(c: &mut Candidates, t: f32) {
    if t == 1.0 || t <= 0.0 {
        return;
    }
    for d in &mut c.data {
        d.logit /= t;
    }
}

/// Multinomial draw over the softmaxed candidates. Returns the index.
pub fn draw<R: Rng>(c: &mut Candidates, rng: &mut R) -> usize {
    c.softmax();
    let r: f32 = rng.random();
    let mut cum = 0.0;
    for (i, d) in c.data.iter().enumerate() {
        cum += d.p;
        if r < cum {
            return i;
        }
    }
    // rounding left r above the last bucket
    c.data
        .iter()
        .rposition(|d| d.p > 0.0)
        .unwrap_or(0)
}

/// Mirostat v1: estimate the Zipf exponent from the top `m` tokens, derive
/// `k` from `mu`, then draw. Returns the index and its surprise in bits.
pub fn mirostat_v1<R: Rng>(
    c: &mut Candidates,
    n_vocab: usize,
    mu: f32,
    m: usize,
    rng: &mut R,
) -> (usize, f32) {
    c.softmax();
    let m = m.min(c.len().saturating_sub(1));
    let mut sum_ti_bi = 0.0f32;
    let mut sum_ti_sq = 0.0f32;
    for i in 0..m {
        let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
        let b_i = (c.data[i].p / c.data[i + 1].p).ln();
        if !b_i.is_finite() {
            continue;
        }
        sum_ti_bi += t_i * b_i;
        sum_ti_sq += t_i * t_i;
    }
    let s_hat = if sum_ti_sq > 0.0 { sum_ti_bi / sum_ti_sq } else { 0.0 };
    let eps = s_hat - 1.0;
    let k = if s_hat > 0.0 && eps.abs() > f32::EPSILON {
        let num = eps * 2f32.powf(mu);
        let den = 1.0 - (n_vocab as f32).powf(-eps);
        (num / den).powf(1.0 / s_hat)
    } else {
        n_vocab as f32
    };
    let k = if k.is_finite() { k.max(1.0) as usize } else { c.len() };
    top_k(c, k, 1);
    let idx = draw(c, rng);
    (idx, -c.data[idx].p.log2())
}

/// Mirostat v2: drop tokens whose surprise exceeds `mu`, then draw.
/// Returns the index and its surprise in bits.
pub fn mirostat_v2<R: Rng>(c: &mut Candidates, mu: f32, rng: &mut R) -> (usize, f32) {
    c.softmax();
    let keep = c.data.iter().take_while(|d| -d.p.log2() <= mu).count();
    c.truncate(keep, 1);
    let idx = draw(c, rng);
    (idx, -c.data[idx].p.log2())
}
