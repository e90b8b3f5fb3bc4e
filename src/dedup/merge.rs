use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, warn};

use super::audit::{AuditLog, AuditLogEntry};
use crate::db::entity::{
    delete_embedding_row, delete_entity_row, delete_relationship, fetch_entity,
    fetch_relationships_from, fetch_relationships_targeting, relationship_exists,
    update_entity_attribute, update_relationship_source, update_relationship_target,
};
use crate::db::{Database, DbLockErrorExt};
use crate::entity::{AttributeField, Entity, EntityType, NodeType, Relationship};
use crate::error::{DedupError, Result};
use crate::TARGET_DEDUP;

/// A single store mutation performed while folding a duplicate into its keeper
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MergeAction {
    TargetRewritten {
        relationship_id: i64,
        relationship: String,
    },
    SourceRewritten {
        relationship_id: i64,
        relationship: String,
    },
    /// The keeper already had the same edge; the duplicate's copy is dropped
    RelationshipConflictDeleted {
        relationship_id: i64,
        relationship: String,
    },
    /// Edge between keeper and duplicate that would point at itself
    SelfLoopDeleted {
        relationship_id: i64,
        relationship: String,
    },
    AttributeCopied {
        field: AttributeField,
        value: String,
    },
    EmbeddingDeleted {
        id: i64,
    },
    DuplicateDeleted {
        id: i64,
        name: String,
    },
}

impl MergeAction {
    pub fn is_relationship_action(&self) -> bool {
        matches!(
            self,
            MergeAction::TargetRewritten { .. }
                | MergeAction::SourceRewritten { .. }
                | MergeAction::RelationshipConflictDeleted { .. }
                | MergeAction::SelfLoopDeleted { .. }
        )
    }
}

impl fmt::Display for MergeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeAction::TargetRewritten {
                relationship_id,
                relationship,
            } => write!(f, "Rewrote target of relationship {} {}", relationship_id, relationship),
            MergeAction::SourceRewritten {
                relationship_id,
                relationship,
            } => write!(f, "Rewrote source of relationship {} {}", relationship_id, relationship),
            MergeAction::RelationshipConflictDeleted {
                relationship_id,
                relationship,
            } => write!(
                f,
                "Deleted relationship {} {} already present on keeper",
                relationship_id, relationship
            ),
            MergeAction::SelfLoopDeleted {
                relationship_id,
                relationship,
            } => write!(f, "Deleted self-referencing relationship {} {}", relationship_id, relationship),
            MergeAction::AttributeCopied { field, value } => {
                write!(f, "Copied {} '{}' to keeper", field, value)
            }
            MergeAction::EmbeddingDeleted { id } => write!(f, "Deleted embedding of {}", id),
            MergeAction::DuplicateDeleted { id, name } => {
                write!(f, "Deleted duplicate {} '{}'", id, name)
            }
        }
    }
}

/// Result of folding one duplicate into a keeper
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeActions {
    pub entity_type: EntityType,
    pub keeper_id: i64,
    pub duplicate_id: i64,
    pub actions: Vec<MergeAction>,
}

impl MergeActions {
    fn empty(entity_type: EntityType, keeper_id: i64, duplicate_id: i64) -> Self {
        Self {
            entity_type,
            keeper_id,
            duplicate_id,
            actions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Whether the duplicate row was (or would be) removed
    pub fn removed_duplicate(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, MergeAction::DuplicateDeleted { .. }))
    }
}

/// Everything a cluster merge does, identical in dry-run and real mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePlan {
    pub entity_type: EntityType,
    pub keeper_id: i64,
    pub keeper_name: String,
    pub duplicate_ids: Vec<i64>,
    pub attribute_updates: BTreeMap<AttributeField, String>,
    pub relationship_actions: Vec<MergeAction>,
}

impl MergePlan {
    fn from_merges(entity_type: EntityType, keeper: &Entity, merged: &[MergeActions]) -> Self {
        let mut plan = Self {
            entity_type,
            keeper_id: keeper.id,
            keeper_name: keeper.name.clone(),
            duplicate_ids: Vec::new(),
            attribute_updates: BTreeMap::new(),
            relationship_actions: Vec::new(),
        };
        for unit in merged {
            if unit.removed_duplicate() {
                plan.duplicate_ids.push(unit.duplicate_id);
            }
            for action in &unit.actions {
                match action {
                    MergeAction::AttributeCopied { field, value } => {
                        plan.attribute_updates.insert(*field, value.clone());
                    }
                    action if action.is_relationship_action() => {
                        plan.relationship_actions.push(action.clone())
                    }
                    _ => {}
                }
            }
        }
        plan
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeFailure {
    pub duplicate_id: i64,
    pub error: String,
    /// The merge itself went through; only its audit entry is missing
    pub committed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterMergeResult {
    pub plan: MergePlan,
    pub merges: Vec<MergeActions>,
    pub failures: Vec<MergeFailure>,
    pub dry_run: bool,
}

impl ClusterMergeResult {
    pub fn duplicates_removed(&self) -> usize {
        let merged = self.merges.iter().filter(|m| m.removed_duplicate()).count();
        merged + self.failures.iter().filter(|f| f.committed).count()
    }
}

struct AppliedMerge {
    keeper: Entity,
    duplicate: Entity,
    actions: Vec<MergeAction>,
}

fn is_node(node: NodeType, id: i64, entity_type: EntityType, entity_id: i64) -> bool {
    node == NodeType::Entity(entity_type) && id == entity_id
}

/// Fold `duplicate_id` into `keeper_id` on the given connection.
///
/// Returns `None` when the duplicate no longer exists.
async fn apply_merge(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    keeper_id: i64,
    duplicate_id: i64,
) -> Result<Option<AppliedMerge>> {
    if keeper_id == duplicate_id {
        return Ok(None);
    }
    let Some(duplicate) = fetch_entity(conn, entity_type, duplicate_id).await? else {
        debug!(target: TARGET_DEDUP, "{} {} already merged, nothing to do", entity_type, duplicate_id);
        return Ok(None);
    };
    let keeper = fetch_entity(conn, entity_type, keeper_id)
        .await?
        .ok_or(DedupError::EntityNotFound {
            entity_type,
            id: keeper_id,
        })?;

    let mut actions = Vec::new();
    let touches_pair = |node: NodeType, id: i64| {
        is_node(node, id, entity_type, keeper_id) || is_node(node, id, entity_type, duplicate_id)
    };

    // Step 1: edges pointing at the duplicate
    for rel in fetch_relationships_targeting(conn, entity_type, duplicate_id).await? {
        let self_loop = touches_pair(rel.source_type, rel.source_id);
        actions.push(retarget(conn, entity_type, keeper_id, &rel, self_loop).await?);
    }

    // Step 2: edges leaving the duplicate
    for rel in fetch_relationships_from(conn, entity_type, duplicate_id).await? {
        let self_loop = touches_pair(rel.target_type, rel.target_id);
        actions.push(resource(conn, entity_type, keeper_id, &rel, self_loop).await?);
    }

    // Step 3: coalesce attributes, keeper first
    for field in AttributeField::ALL {
        if !entity_type.has_attribute(field) || keeper.attribute(field).is_some() {
            continue;
        }
        if let Some(value) = duplicate.attribute(field) {
            update_entity_attribute(conn, entity_type, keeper_id, field, value).await?;
            actions.push(MergeAction::AttributeCopied {
                field,
                value: value.to_string(),
            });
        }
    }

    // Step 4: the duplicate itself
    if delete_embedding_row(conn, entity_type, duplicate_id).await? {
        actions.push(MergeAction::EmbeddingDeleted { id: duplicate_id });
    }
    delete_entity_row(conn, entity_type, duplicate_id).await?;
    actions.push(MergeAction::DuplicateDeleted {
        id: duplicate_id,
        name: duplicate.name.clone(),
    });

    Ok(Some(AppliedMerge {
        keeper,
        duplicate,
        actions,
    }))
}

async fn retarget(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    keeper_id: i64,
    rel: &Relationship,
    self_loop: bool,
) -> Result<MergeAction> {
    let relationship = rel.to_string();
    if self_loop {
        delete_relationship(conn, rel.id).await?;
        return Ok(MergeAction::SelfLoopDeleted {
            relationship_id: rel.id,
            relationship,
        });
    }

    let exists = relationship_exists(
        conn,
        rel.source_type,
        rel.source_id,
        NodeType::Entity(entity_type),
        keeper_id,
        &rel.relationship_type,
    )
    .await?;

    if exists {
        delete_relationship(conn, rel.id).await?;
        Ok(MergeAction::RelationshipConflictDeleted {
            relationship_id: rel.id,
            relationship,
        })
    } else {
        update_relationship_target(conn, rel.id, keeper_id).await?;
        Ok(MergeAction::TargetRewritten {
            relationship_id: rel.id,
            relationship,
        })
    }
}

async fn resource(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    keeper_id: i64,
    rel: &Relationship,
    self_loop: bool,
) -> Result<MergeAction> {
    let relationship = rel.to_string();
    if self_loop {
        delete_relationship(conn, rel.id).await?;
        return Ok(MergeAction::SelfLoopDeleted {
            relationship_id: rel.id,
            relationship,
        });
    }

    let exists = relationship_exists(
        conn,
        NodeType::Entity(entity_type),
        keeper_id,
        rel.target_type,
        rel.target_id,
        &rel.relationship_type,
    )
    .await?;

    if exists {
        delete_relationship(conn, rel.id).await?;
        Ok(MergeAction::RelationshipConflictDeleted {
            relationship_id: rel.id,
            relationship,
        })
    } else {
        update_relationship_source(conn, rel.id, keeper_id).await?;
        Ok(MergeAction::SourceRewritten {
            relationship_id: rel.id,
            relationship,
        })
    }
}

/// Run one pairwise merge as a (possibly nested) transaction on `conn`.
///
/// With `keep` false the unit is rolled back after its actions are
/// collected.
async fn run_unit(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    keeper_id: i64,
    duplicate_id: i64,
    keep: bool,
) -> Result<Option<AppliedMerge>> {
    let mut tx = conn.begin().await?;
    match apply_merge(&mut tx, entity_type, keeper_id, duplicate_id).await {
        Ok(applied) => {
            if keep && applied.is_some() {
                tx.commit().await?;
            } else {
                tx.rollback().await?;
            }
            Ok(applied)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(
                    target: TARGET_DEDUP,
                    "Rollback of {} {} -> {} failed: {}", entity_type, duplicate_id, keeper_id, rollback_err
                );
            }
            Err(e)
        }
    }
}

fn log_failure(entity_type: EntityType, keeper_id: i64, duplicate_id: i64, e: &DedupError) {
    match e {
        DedupError::Store(sqlx_err) if sqlx_err.is_database_lock_error() => error!(
            target: TARGET_DEDUP,
            "Database locked while merging {} {} into {}: {}", entity_type, duplicate_id, keeper_id, e
        ),
        _ => error!(
            target: TARGET_DEDUP,
            "Failed to merge {} {} into {}: {}", entity_type, duplicate_id, keeper_id, e
        ),
    }
}

/// Merge one duplicate into its keeper.
///
/// Dry-run executes the same statements and rolls them back, so the returned
/// actions are exactly what a real run would do. Real merges commit and, when
/// an audit log is given, append one entry.
pub async fn merge(
    db: &Database,
    entity_type: EntityType,
    keeper_id: i64,
    duplicate_id: i64,
    dry_run: bool,
    audit: Option<&AuditLog>,
) -> Result<MergeActions> {
    let applied = {
        let mut conn = db.pool().acquire().await?;
        run_unit(&mut conn, entity_type, keeper_id, duplicate_id, !dry_run).await?
    };

    let Some(applied) = applied else {
        return Ok(MergeActions::empty(entity_type, keeper_id, duplicate_id));
    };

    for action in &applied.actions {
        debug!(target: TARGET_DEDUP, "{} {} -> {}: {}", entity_type, duplicate_id, keeper_id, action);
    }

    if !dry_run {
        info!(
            target: TARGET_DEDUP,
            "Merged {} {} '{}' into {} '{}' ({} actions)",
            entity_type,
            applied.duplicate.id,
            applied.duplicate.name,
            applied.keeper.id,
            applied.keeper.name,
            applied.actions.len()
        );
        if let Some(audit) = audit {
            let entry =
                AuditLogEntry::new(entity_type, &applied.keeper, &applied.duplicate, &applied.actions);
            audit.append(entry).await.map_err(|e| {
                error!(
                    target: TARGET_DEDUP,
                    "Merge of {} {} committed but audit append failed: {}", entity_type, duplicate_id, e
                );
                DedupError::AuditMissing {
                    entity_type,
                    duplicate_id,
                    reason: e.to_string(),
                }
            })?;
        }
    }

    Ok(MergeActions {
        entity_type,
        keeper_id,
        duplicate_id,
        actions: applied.actions,
    })
}

/// Merge every other id of a cluster into `keeper_id`, one unit at a time.
///
/// A failing unit is rolled back and recorded; the rest still run. In
/// dry-run all units share one outer transaction that is rolled back at the
/// end, so each unit sees the effects of the ones before it.
pub async fn merge_cluster(
    db: &Database,
    entity_type: EntityType,
    keeper_id: i64,
    ids: &[i64],
    dry_run: bool,
    audit: Option<&AuditLog>,
) -> Result<ClusterMergeResult> {
    let keeper = db
        .get_entity(entity_type, keeper_id)
        .await?
        .ok_or(DedupError::EntityNotFound {
            entity_type,
            id: keeper_id,
        })?;

    let mut merges = Vec::new();
    let mut failures = Vec::new();
    let duplicates = ids.iter().copied().filter(|&id| id != keeper_id);

    if dry_run {
        let mut conn = db.pool().acquire().await?;
        let mut outer = conn.begin().await?;
        for duplicate_id in duplicates {
            match run_unit(&mut outer, entity_type, keeper_id, duplicate_id, true).await {
                Ok(Some(applied)) => merges.push(MergeActions {
                    entity_type,
                    keeper_id,
                    duplicate_id,
                    actions: applied.actions,
                }),
                Ok(None) => merges.push(MergeActions::empty(entity_type, keeper_id, duplicate_id)),
                Err(e) => {
                    log_failure(entity_type, keeper_id, duplicate_id, &e);
                    failures.push(MergeFailure {
                        duplicate_id,
                        error: e.to_string(),
                        committed: matches!(e, DedupError::AuditMissing { .. }),
                    });
                }
            }
        }
        outer.rollback().await?;
    } else {
        for duplicate_id in duplicates {
            match merge(db, entity_type, keeper_id, duplicate_id, false, audit).await {
                Ok(actions) => merges.push(actions),
                Err(e) => {
                    log_failure(entity_type, keeper_id, duplicate_id, &e);
                    failures.push(MergeFailure {
                        duplicate_id,
                        error: e.to_string(),
                        committed: matches!(e, DedupError::AuditMissing { .. }),
                    });
                }
            }
        }
    }

    let plan = MergePlan::from_merges(entity_type, &keeper, &merges);
    info!(
        target: TARGET_DEDUP,
        "{}{} cluster into {} '{}': {} duplicates, {} attribute updates, {} relationship actions, {} failures",
        if dry_run { "[dry-run] " } else { "" },
        entity_type,
        keeper.id,
        keeper.name,
        plan.duplicate_ids.len(),
        plan.attribute_updates.len(),
        plan.relationship_actions.len(),
        failures.len()
    );

    Ok(ClusterMergeResult {
        plan,
        merges,
        failures,
        dry_run,
    })
}
