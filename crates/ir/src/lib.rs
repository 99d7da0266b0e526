//! Expression trees consumed by the kerneltune code generators.

pub mod binder;
pub mod builder;
pub mod dialect;
pub mod representation;
pub mod traverse;

pub use binder::*;
pub use builder::*;
pub use dialect::*;
pub use representation::*;
pub use traverse::*;
