//! Strand core: the inference-session engine.
//!
//! A [`Context`] owns one KV cache, one RNG and the outputs of the last
//! [`Context::decode`], bound to a shared immutable model and a
//! [`ComputeBackend`]. Sequences are algebraic views over the cache: they can
//! be forked ([`KvCache::copy`]), trimmed, shifted and compacted without
//! recomputation. Sampling, grammar constraints and a ready-made generation
//! loop sit on top.

pub mod backend;
pub mod batch;
pub mod context;
pub mod debug;
pub mod engine;
pub mod error;
pub mod grammar;
pub mod hooks;
pub mod kv_cache;
pub mod logging;
pub mod model_cache;
pub mod params;
pub mod perf;
pub mod sampling;

pub use backend::{BackendOutput, ComputeBackend};
pub use batch::Batch;
pub use context::{Context, RequiredSize};
pub use engine::{Generation, Generator, StopReason};
pub use error::{Error, Result};
pub use grammar::Grammar;
pub use hooks::{AbortFlag, ContextHooks, EvalEvent, NoHooks};
pub use kv_cache::{KvCache, KvCell};
pub use logging::{LogLevel, LogSink, LogSinkGuard, install_log_sink};
pub use model_cache::ModelCache;
pub use params::{AttentionType, ContextParams, PoolingType, RopeScalingType};
pub use perf::Timings;
pub use sampling::{Candidates, Sampler, TokenData};

pub use strand_abi as abi;
