pub mod normalizer;
pub mod types;

pub use normalizer::EntityNormalizer;
pub use types::*;

// Module-level constants
pub const TARGET_ENTITY: &str = "entity";
