use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use strand_abi::{Model, ModelParams, ModelStore};
use tracing::{debug, info};

use crate::error::Result;

/// In-process cache of loaded models keyed by canonical path, so many
/// contexts share one immutable load.
pub struct ModelCache<S: ModelStore> {
    store: S,
    params: ModelParams,
    models: Mutex<HashMap<PathBuf, Arc<S::Model>>>,
}

fn canon<P: AsRef<Path>>(p: P) -> PathBuf {
    std::fs::canonicalize(p.as_ref()).unwrap_or_else(|_| p.as_ref().to_path_buf())
}

impl<S: ModelStore> ModelCache<S> {
    pub fn new(store: S, params: ModelParams) -> Self {
        Self {
            store,
            params,
            models: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<S::Model>>> {
        // the map stays consistent even if a holder panicked
        self.models.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Shared handle to the model at `path`, loading it on first use.
    /// Concurrent first loads of one path are serialized.
    pub fn get_or_load<P: AsRef<Path>>(&self, path: P) -> Result<Arc<S::Model>> {
        let key = canon(&path);
        let mut models = self.lock();
        if let Some(model) = models.get(&key) {
            debug!(path = %key.display(), "model cache hit");
            return Ok(Arc::clone(model));
        }
        let model = Arc::new(self.store.load(&key, &self.params)?);
        info!(
            path = %key.display(),
            arch = %model.info().architecture,
            n_vocab = model.n_vocab(),
            "model loaded"
        );
        models.insert(key, Arc::clone(&model));
        Ok(model)
    }

    /// Cached handle, if present.
    pub fn get<P: AsRef<Path>>(&self, path: P) -> Option<Arc<S::Model>> {
        self.lock().get(&canon(path)).cloned()
    }

    /// Drop the cache's handle. Contexts holding the model keep it alive.
    pub fn evict<P: AsRef<Path>>(&self, path: P) -> bool {
        self.lock().remove(&canon(path)).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
