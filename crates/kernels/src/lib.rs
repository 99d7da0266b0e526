//! Parameterised WGSL kernel generation for kerneltune operation families.

pub mod database;
pub mod expression;
pub mod families;
pub mod generator;
pub mod mapping;
pub mod params;
pub mod stream;
pub mod template;

pub use database::*;
pub use families::*;
pub use generator::*;
pub use mapping::*;
pub use params::*;
pub use stream::*;
pub use template::*;
