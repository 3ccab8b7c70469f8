//! Simulation backend: a byte-level vocabulary, a JSON-described model and a
//! hash-based compute backend. Everything is deterministic, so engine tests
//! can compare logits bit for bit.

pub mod backend;
pub mod model;
pub mod vocab;

pub use backend::SimBackend;
pub use model::{SimDescriptor, SimModel, SimStore};
pub use vocab::SimVocab;
