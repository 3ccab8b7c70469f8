use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::logging::LogLevel;

/// What a finished decode reports to [`ContextHooks::on_eval`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalEvent {
    pub n_tokens: usize,
    pub n_outputs: usize,
    pub kv_used: usize,
    pub elapsed_ms: f64,
}

/// Per-context callbacks injected at construction. Every method has a no-op default.
pub trait ContextHooks: Send {
    fn on_log(&self, _level: LogLevel, _message: &str) {}

    /// Polled by the backend during decode; `true` cancels it.
    fn should_abort(&self) -> bool {
        false
    }

    fn on_eval(&self, _event: &EvalEvent) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ContextHooks for NoHooks {}

/// Handle you can keep and flip from another thread to cancel decoding.
#[derive(Debug, Default, Clone)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_shared(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    #[inline]
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn shared(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

impl ContextHooks for AbortFlag {
    fn should_abort(&self) -> bool {
        self.is_set()
    }
}
