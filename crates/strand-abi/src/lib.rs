//! Strand ABI crate: the contracts the session engine shares with the
//! collaborators around it (model store, vocabulary, sampling knobs).

pub mod error;
pub mod model;
pub mod sampling;
pub mod token;
pub mod vocab;

pub use error::*;
pub use model::*;
pub use sampling::*;
pub use token::*;
pub use vocab::*;
