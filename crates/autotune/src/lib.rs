//! Empirical parameter search for kerneltune kernel families.

pub mod cache;
pub mod trace;
pub mod tuner;
pub mod tuning;

pub use cache::*;
pub use trace::*;
pub use tuner::*;
pub use tuning::*;
