use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::BackendError;
use crate::vocab::Vocabulary;

/// Read-only facts about a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Architecture tag, e.g. `"llama"`.
    pub architecture: String,
    pub n_vocab: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_head_kv: usize,
    /// Context length the model was trained with.
    pub n_ctx_train: u32,
    #[serde(default)]
    pub description: Option<String>,
}

/// A loaded, immutable model. Shared between contexts behind an `Arc`.
pub trait Model: Send + Sync {
    fn info(&self) -> &ModelInfo;

    fn vocab(&self) -> &dyn Vocabulary;

    #[inline]
    fn n_vocab(&self) -> usize {
        self.info().n_vocab
    }

    #[inline]
    fn n_embd(&self) -> usize {
        self.info().n_embd
    }
}

/// Load-time knobs handed to a [`ModelStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub n_gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub vocab_only: bool,
    pub check_tensors: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
            vocab_only: false,
            check_tensors: false,
        }
    }
}

/// Loads models from storage. Weight formats are the store's business.
pub trait ModelStore {
    type Model: Model;

    fn load(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, BackendError>;
}
