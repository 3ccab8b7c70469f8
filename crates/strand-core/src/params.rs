// Context / runtime parameters.
//
// Serializable so hosts can keep them in a JSON profile; every field has a
// default, so a partial document is enough.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seed value asking for a random seed at context creation.
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RopeScalingType {
    #[default]
    Unspecified,
    None,
    Linear,
    Yarn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    #[default]
    Unspecified,
    None,
    Mean,
    Cls,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    #[default]
    Unspecified,
    Causal,
    NonCausal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    pub seed: u32,
    /// 0 takes the model's training context.
    pub n_ctx: u32,
    /// Largest batch one decode call accepts.
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_seq_max: u32,
    pub n_threads: u32,
    pub n_threads_batch: u32,
    pub rope_scaling_type: RopeScalingType,
    pub pooling_type: PoolingType,
    pub attention_type: AttentionType,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub yarn_ext_factor: f32,
    pub yarn_attn_factor: f32,
    pub yarn_beta_fast: f32,
    pub yarn_beta_slow: f32,
    pub yarn_orig_ctx: u32,
    /// Fragmentation ratio that schedules a defrag after decode; <= 0 disables.
    pub defrag_thold: f32,
    /// Keep per-output embeddings (and pooled per-sequence embeddings).
    pub embeddings: bool,
    pub offload_kqv: bool,
    pub flash_attn: bool,
    pub no_perf: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            n_ctx: 4096,
            n_batch: 512,
            n_ubatch: 512,
            n_seq_max: 1, // single sequence by default
            n_threads: num_cpus::get_physical() as u32,
            n_threads_batch: num_cpus::get() as u32,
            rope_scaling_type: RopeScalingType::Unspecified,
            pooling_type: PoolingType::Unspecified,
            attention_type: AttentionType::Unspecified,
            rope_freq_base: 10000.0,
            rope_freq_scale: 1.0,
            yarn_ext_factor: -1.0,
            yarn_attn_factor: 1.0,
            yarn_beta_fast: 32.0,
            yarn_beta_slow: 1.0,
            yarn_orig_ctx: 0,
            defrag_thold: -1.0,
            embeddings: false,
            offload_kqv: true,
            flash_attn: false,
            no_perf: false,
        }
    }
}

impl ContextParams {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::InvalidArgument(format!("context params: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidArgument(format!("context params: {e}")))
    }

    pub fn with_n_ctx(mut self, n_ctx: u32) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_n_batch(mut self, n_batch: u32) -> Self {
        self.n_batch = n_batch;
        self.n_ubatch = self.n_ubatch.min(n_batch);
        self
    }

    pub fn with_n_seq_max(mut self, n_seq_max: u32) -> Self {
        self.n_seq_max = n_seq_max;
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_embeddings(mut self, pooling: PoolingType) -> Self {
        self.embeddings = true;
        self.pooling_type = pooling;
        self
    }

    /// Reject settings no context can run with.
    pub fn validate(&self) -> Result<()> {
        if self.n_batch == 0 {
            return Err(Error::InvalidArgument("n_batch must be > 0".into()));
        }
        if self.n_seq_max == 0 {
            return Err(Error::InvalidArgument("n_seq_max must be > 0".into()));
        }
        if self.n_ubatch > self.n_batch {
            return Err(Error::InvalidArgument(format!(
                "n_ubatch ({}) exceeds n_batch ({})",
                self.n_ubatch, self.n_batch
            )));
        }
        if !(self.rope_freq_scale > 0.0) {
            return Err(Error::InvalidArgument("rope_freq_scale must be > 0".into()));
        }
        Ok(())
    }

    /// Fill model-dependent values: `n_ctx = 0` takes `n_ctx_train`,
    /// `n_batch` is capped at `n_ctx`, a zero thread count takes the CPU count.
    pub(crate) fn resolved(&self, n_ctx_train: u32) -> Result<Self> {
        self.validate()?;
        let mut p = self.clone();
        if p.n_ctx == 0 {
            p.n_ctx = n_ctx_train;
        }
        if p.n_ctx == 0 {
            return Err(Error::InvalidArgument(
                "n_ctx is 0 and the model reports no training context".into(),
            ));
        }
        p.n_batch = p.n_batch.min(p.n_ctx);
        p.n_ubatch = p.n_ubatch.min(p.n_batch).max(1);
        if p.n_threads == 0 {
            p.n_threads = num_cpus::get_physical() as u32;
        }
        if p.n_threads_batch == 0 {
            p.n_threads_batch = p.n_threads;
        }
        if p.yarn_orig_ctx == 0 {
            p.yarn_orig_ctx = n_ctx_train;
        }
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_profile() {
        let p = ContextParams::from_json(
            r#"{ "n_ctx": 256, "n_seq_max": 4, "pooling_type": "mean" }"#,
        )
        .unwrap();
        assert_eq!(p.n_ctx, 256);
        assert_eq!(p.n_seq_max, 4);
        assert_eq!(p.pooling_type, PoolingType::Mean);
        assert_eq!(p.n_batch, 512);
        assert_eq!(p.seed, DEFAULT_SEED);
    }

    #[test]
    fn resolution_uses_model_context() {
        let p = ContextParams::default().with_n_ctx(0).resolved(128).unwrap();
        assert_eq!(p.n_ctx, 128);
        assert_eq!(p.n_batch, 128);
        assert_eq!(p.yarn_orig_ctx, 128);
    }

    #[test]
    fn invalid_params_are_rejected() {
        let mut p = ContextParams::default();
        p.n_seq_max = 0;
        assert!(p.validate().is_err());

        let mut p = ContextParams::default();
        p.n_ubatch = 1024;
        assert!(p.validate().is_err());

        assert!(ContextParams::from_json("{ not json").is_err());
        assert!(ContextParams::default().with_n_ctx(0).resolved(0).is_err());
    }
}
