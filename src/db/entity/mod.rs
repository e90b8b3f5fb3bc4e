//! Entity store: typed entity tables, the relationship table and embeddings.
//!
//! Functions taking a `&mut SqliteConnection` run inside the caller's
//! transaction; the merge engine uses them so a pairwise merge commits or
//! rolls back as a unit.

pub mod core;
pub mod embedding;
pub mod relation;

pub use self::core::{count_relationships, delete_entity_row, fetch_entity, update_entity_attribute};
pub use self::embedding::delete_embedding_row;
pub use self::relation::{
    delete_relationship, fetch_relationships_from, fetch_relationships_targeting,
    relationship_exists, update_relationship_source, update_relationship_target,
};
