//! Token sampling: candidate shaping stages and the stateful [`Sampler`].

pub mod candidates;
pub mod stages;
mod sampler;

pub use candidates::{Candidates, TokenData};
pub use sampler::Sampler;
