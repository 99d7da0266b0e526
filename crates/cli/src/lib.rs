//! Command-line front end for kerneltune.

pub mod cli;
pub mod session;
