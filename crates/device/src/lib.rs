//! Compute-device contract and backends for kerneltune.

pub mod device;
pub mod planner;
pub mod runtime;
pub mod simulated;

pub use device::*;
pub use planner::*;
pub use runtime::*;
pub use simulated::*;
