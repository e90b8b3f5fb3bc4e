pub mod core;
pub mod entity;
mod schema;

// Re-export Database and essential traits
pub use self::core::Database;
pub use self::core::DbLockErrorExt;
pub use sqlx::Row;
