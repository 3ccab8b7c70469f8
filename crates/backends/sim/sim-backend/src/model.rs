use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context as _, bail};
use serde::{Deserialize, Serialize};
use strand_abi::{BackendError, Model, ModelInfo, ModelParams, ModelStore, Vocabulary};
use tracing::debug;

use crate::vocab::SimVocab;

/// JSON model descriptor the [`SimStore`] loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimDescriptor {
    pub architecture: String,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_ctx_train: u32,
    /// Multi-byte vocabulary pieces on top of the byte tokens.
    pub pieces: Vec<String>,
    pub description: Option<String>,
}

impl Default for SimDescriptor {
    fn default() -> Self {
        Self {
            architecture: "sim".into(),
            n_embd: 8,
            n_layer: 1,
            n_head: 1,
            n_ctx_train: 512,
            pieces: Vec::new(),
            description: None,
        }
    }
}

pub struct SimModel {
    info: ModelInfo,
    vocab: SimVocab,
}

impl SimModel {
    pub fn new(desc: SimDescriptor) -> Self {
        let vocab = SimVocab::new(desc.pieces);
        let info = ModelInfo {
            architecture: desc.architecture,
            n_vocab: vocab.n_vocab(),
            n_embd: desc.n_embd,
            n_layer: desc.n_layer,
            n_head: desc.n_head,
            n_head_kv: desc.n_head,
            n_ctx_train: desc.n_ctx_train,
            description: desc.description,
        };
        Self { info, vocab }
    }

    /// Byte vocabulary, 8-wide embeddings.
    pub fn tiny() -> Self {
        Self::new(SimDescriptor::default())
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let desc: SimDescriptor =
            serde_json::from_str(text).context("parsing sim model descriptor")?;
        if desc.n_embd == 0 {
            bail!("n_embd must be positive");
        }
        Ok(Self::new(desc))
    }

    pub fn sim_vocab(&self) -> &SimVocab {
        &self.vocab
    }
}

impl Model for SimModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn vocab(&self) -> &dyn Vocabulary {
        &self.vocab
    }
}

/// Loads [`SimModel`]s from JSON descriptor files and counts the loads.
#[derive(Debug, Default)]
pub struct SimStore {
    loads: AtomicUsize,
}

impl SimStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

fn load_descriptor(path: &Path) -> anyhow::Result<SimModel> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    SimModel::from_json(&text).with_context(|| format!("loading {}", path.display()))
}

impl ModelStore for SimStore {
    type Model = SimModel;

    fn load(&self, path: &Path, params: &ModelParams) -> Result<SimModel, BackendError> {
        let model = load_descriptor(path).map_err(|e| BackendError::Load(format!("{e:#}")))?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(
            path = %path.display(),
            vocab_only = params.vocab_only,
            n_vocab = model.info.n_vocab,
            "sim model loaded"
        );
        Ok(model)
    }
}
