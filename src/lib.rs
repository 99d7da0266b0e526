//! Kernel generation and autotuning for device-specific numeric kernels.
//!
//! Re-exports the workspace crates under one roof.

pub use kerneltune_autotune as autotune;
pub use kerneltune_device as device;
pub use kerneltune_ir as ir;
pub use kerneltune_kernels as kernels;
