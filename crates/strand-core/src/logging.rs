//! Process-wide log sink.
//!
//! At most one sink is installed at a time, behind an explicit
//! install/uninstall lifecycle: [`install_log_sink`] returns a guard and the
//! sink is removed when the guard drops. With no sink installed, engine
//! messages go nowhere (they still surface as `tracing` events for whoever
//! subscribes to those).

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum LogLevel {
    Error = 2,
    Warn = 3,
    Info = 4,
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(LogLevel, &str) + Send + Sync,
{
    fn log(&self, level: LogLevel, message: &str) {
        self(level, message)
    }
}

static SINK: Lazy<RwLock<Option<Arc<dyn LogSink>>>> = Lazy::new(|| RwLock::new(None));

/// Keeps the installed sink alive; dropping it uninstalls the sink.
#[must_use = "the sink is uninstalled when the guard drops"]
pub struct LogSinkGuard {
    _priv: (),
}

impl Drop for LogSinkGuard {
    fn drop(&mut self) {
        let mut slot = SINK.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

/// Install the process-wide sink. Fails if one is already installed.
pub fn install_log_sink<S: LogSink + 'static>(sink: S) -> Result<LogSinkGuard> {
    let mut slot = SINK.write().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return Err(Error::InvalidArgument("a log sink is already installed".into()));
    }
    *slot = Some(Arc::new(sink));
    Ok(LogSinkGuard { _priv: () })
}

pub fn sink_installed() -> bool {
    SINK.read().map(|s| s.is_some()).unwrap_or(false)
}

/// Route one message to the sink (if any) and to `tracing`.
pub fn emit(level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => tracing::error!(target: "strand", "{message}"),
        LogLevel::Warn => tracing::warn!(target: "strand", "{message}"),
        LogLevel::Info => tracing::info!(target: "strand", "{message}"),
    }
    let sink = SINK
        .read()
        .ok()
        .and_then(|s| s.as_ref().map(Arc::clone));
    if let Some(sink) = sink {
        sink.log(level, message);
    }
}
