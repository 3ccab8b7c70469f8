use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// User-tunable sampling parameters for one generation.
/// Out-of-range knobs are not errors; [`SamplingParams::normalized`]
/// disables or clamps them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// If true, pick argmax and ignore other stochastic knobs.
    pub greedy: bool,

    // Sampling filters
    pub temperature: Option<f32>, // 0.0 means greedy; None means no scaling
    pub top_k: Option<u32>,       // >= 1 keeps the K most likely candidates
    pub top_p: Option<f32>,       // (0, 1] nucleus sampling
    pub min_p: Option<f32>,       // (0, 1] relative to the most likely token
    pub typical_p: Option<f32>,   // (0, 1] locally typical sampling
    pub tfs_z: Option<f32>,       // (0, 1] tail-free sampling

    // Token penalties
    pub repetition_penalty: Option<PenaltyParams>,
    pub penalize_newline: bool,

    // Mirostat options (v1 or v2)
    pub mirostat: Option<MirostatParams>,

    /// Optional per-token logit bias. Keys are raw token IDs as u32 for
    /// serialization friendliness; unknown IDs are ignored.
    pub logit_bias: Option<HashMap<u32, f32>>,

    /// Capacity of the accepted-token ring.
    pub n_prev: usize,

    /// How many top candidates to keep for inspection after each step (0 = none).
    pub n_probs: usize,

    /// Shaping order, one letter per stage: k=top-k, f=tail-free, y=typical,
    /// p=top-p, m=min-p, t=temperature. Unknown letters are skipped.
    pub samplers: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyParams {
    pub last_n: i32, // recent tokens to consider; 0 disables, < 0 means the whole ring
    pub repeat: f32, // >= 1.0 reduces repetition
    pub frequency: f32,
    pub presence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirostatParams {
    /// Target surprise (cross-entropy) in bits.
    pub tau: f32,
    /// Learning rate for `mu`.
    pub eta: f32,
    /// Only used by Mirostat v1; v2 ignores it.
    pub m: Option<i32>,
    /// 1 or 2
    pub version: u8,
}

impl MirostatParams {
    pub const DEFAULT_M: i32 = 100;

    pub fn v1(tau: f32, eta: f32) -> Self {
        Self {
            tau,
            eta,
            m: Some(Self::DEFAULT_M),
            version: 1,
        }
    }

    pub fn v2(tau: f32, eta: f32) -> Self {
        Self {
            tau,
            eta,
            m: None,
            version: 2,
        }
    }
}

/// One distribution-shaping stage in the configurable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerStage {
    TopK,
    TailFree,
    Typical,
    TopP,
    MinP,
    Temperature,
}

impl SamplerStage {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'k' => Some(Self::TopK),
            'f' => Some(Self::TailFree),
            'y' => Some(Self::Typical),
            'p' => Some(Self::TopP),
            'm' => Some(Self::MinP),
            't' => Some(Self::Temperature),
            _ => None,
        }
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            greedy: false,
            temperature: Some(0.8),
            top_k: Some(40),
            top_p: Some(0.95),
            min_p: Some(0.05),
            typical_p: None,
            tfs_z: None,
            repetition_penalty: Some(PenaltyParams {
                last_n: 64,
                repeat: 1.1,
                frequency: 0.0,
                presence: 0.0,
            }),
            penalize_newline: false,
            mirostat: None,
            logit_bias: None,
            n_prev: 64,
            n_probs: 0,
            samplers: "kfypmt".to_string(),
        }
    }
}

impl SamplingParams {
    /// Deterministic argmax configuration.
    pub fn greedy() -> Self {
        Self {
            greedy: true,
            ..Self::default()
        }
    }

    /// Stage order parsed from `samplers`, duplicates dropped.
    pub fn stage_order(&self) -> Vec<SamplerStage> {
        let mut out = Vec::with_capacity(6);
        for stage in self.samplers.chars().filter_map(SamplerStage::from_char) {
            if !out.contains(&stage) {
                out.push(stage);
            }
        }
        out
    }

    /// Returns a conflict-free, clamped version of these parameters.
    ///
    /// Precedence:
    /// - `temperature == 0` (or below) turns on `greedy`.
    /// - `greedy=true` disables temperature/top_k/top_p/min_p/typical/tfs/mirostat.
    /// - If Mirostat (v1 or v2) is set, disable top_k/top_p/min_p/typical/tfs.
    ///
    /// Clamps:
    /// - top_k < 1 → disabled
    /// - top_p / min_p / typical_p / tfs_z ∉ (0, 1] → disabled
    /// - penalties.repeat < 1.0 → clamped to 1.0
    /// - penalties.last_n < 0 or > n_prev → n_prev
    pub fn normalized(&self) -> Self {
        let mut p = self.clone();

        if let Some(t) = p.temperature {
            if t <= 0.0 {
                p.greedy = true;
            }
        }

        let n_prev = p.n_prev;
        if let Some(ref mut pen) = p.repetition_penalty {
            if pen.repeat < 1.0 {
                pen.repeat = 1.0;
            }
            if pen.last_n < 0 || pen.last_n as usize > n_prev {
                pen.last_n = n_prev as i32;
            }
        }

        // Greedy short-circuit
        if p.greedy {
            p.temperature = None;
            p.top_k = None;
            p.top_p = None;
            p.min_p = None;
            p.typical_p = None;
            p.tfs_z = None;
            p.mirostat = None;
            return p;
        }

        // Mirostat overrides classic truncation filters
        if p.mirostat.is_some() {
            p.top_k = None;
            p.top_p = None;
            p.min_p = None;
            p.typical_p = None;
            p.tfs_z = None;
        }

        if let Some(k) = p.top_k {
            if k < 1 {
                p.top_k = None;
            }
        }
        p.top_p = unit_interval(p.top_p);
        p.min_p = unit_interval(p.min_p);
        p.typical_p = unit_interval(p.typical_p);
        p.tfs_z = unit_interval(p.tfs_z);

        // Mirostat version sanity – drop invalid config
        if let Some(m) = &p.mirostat {
            if (m.version != 1 && m.version != 2) || m.tau <= 0.0 || m.eta <= 0.0 {
                p.mirostat = None;
            }
        }

        p
    }
}

fn unit_interval(v: Option<f32>) -> Option<f32> {
    v.filter(|x| *x > 0.0 && *x <= 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_temperature_means_greedy() {
        let p = SamplingParams {
            temperature: Some(0.0),
            ..SamplingParams::default()
        }
        .normalized();
        assert!(p.greedy);
        assert_eq!(p.top_k, None);
        assert_eq!(p.temperature, None);
        // penalties survive the greedy short-circuit
        assert!(p.repetition_penalty.is_some());
    }

    #[test]
    fn mirostat_disables_truncation() {
        let p = SamplingParams {
            mirostat: Some(MirostatParams::v2(5.0, 0.1)),
            ..SamplingParams::default()
        }
        .normalized();
        assert!(p.mirostat.is_some());
        assert_eq!(p.top_k, None);
        assert_eq!(p.top_p, None);
        assert_eq!(p.min_p, None);
        assert_eq!(p.temperature, Some(0.8));
    }

    #[test]
    fn out_of_range_filters_are_dropped() {
        let p = SamplingParams {
            top_k: Some(0),
            top_p: Some(1.5),
            typical_p: Some(0.0),
            mirostat: Some(MirostatParams {
                tau: 5.0,
                eta: 0.1,
                m: None,
                version: 3,
            }),
            repetition_penalty: Some(PenaltyParams {
                last_n: -1,
                repeat: 0.5,
                frequency: 0.0,
                presence: 0.0,
            }),
            ..SamplingParams::default()
        }
        .normalized();
        assert_eq!(p.top_k, None);
        assert_eq!(p.top_p, None);
        assert_eq!(p.typical_p, None);
        assert_eq!(p.mirostat, None);
        let pen = p.repetition_penalty.unwrap();
        assert_eq!(pen.repeat, 1.0);
        assert_eq!(pen.last_n, 64);
    }

    #[test]
    fn stage_order_skips_unknown_and_duplicates() {
        let p = SamplingParams {
            samplers: "kxkpt".into(),
            ..SamplingParams::default()
        };
        assert_eq!(
            p.stage_order(),
            vec![
                SamplerStage::TopK,
                SamplerStage::TopP,
                SamplerStage::Temperature
            ]
        );
    }

    #[test]
    fn partial_json_uses_defaults() {
        let p: SamplingParams = serde_json::from_str(r#"{ "top_k": 5 }"#).unwrap();
        assert_eq!(p.top_k, Some(5));
        assert_eq!(p.n_prev, 64);
        assert_eq!(p.samplers, "kfypmt");
    }
}
