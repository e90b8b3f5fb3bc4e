//! The deduplication engine.
//!
//! Per entity type: [`candidates`] proposes pairs (lexical and vector),
//! [`cluster`] groups them transitively, [`verify`] fans the pairs out to a
//! verification oracle on a bounded worker pool, [`canonical`] picks a keeper
//! for each fully verified cluster and [`merge`] folds the other members into
//! it transactionally. [`pipeline`] ties the stages together.

pub mod audit;
pub mod candidates;
pub mod canonical;
pub mod cluster;
pub mod merge;
pub mod pipeline;
pub mod report;
pub mod verify;

pub use audit::{AuditLog, AuditLogEntry, EntityRef};
pub use candidates::{find_candidates, CandidatePair, CandidateSettings, DetectionMethod};
pub use canonical::{canonical_score, choose_canonical};
pub use cluster::{build_clusters, DuplicateCluster};
pub use merge::{merge, merge_cluster, ClusterMergeResult, MergeAction, MergeActions, MergePlan};
pub use pipeline::Deduplicator;
pub use report::{RunReport, StoreStats, TypeReport};
pub use verify::{
    verify_clusters, ClusterOutcome, PairVerdict, VerificationSettings, VerifiedCluster,
};
