use std::sync::Arc;
use tracing::{info, warn};

use super::audit::AuditLog;
use super::candidates::find_candidates_among;
use super::canonical::choose_canonical;
use super::cluster::build_clusters;
use super::merge::merge_cluster;
use super::report::{RunReport, TypeReport};
use super::verify::{verify_clusters, ClusterOutcome, VerifiedCluster};
use crate::config::DedupConfig;
use crate::db::Database;
use crate::entity::EntityType;
use crate::error::Result;
use crate::oracle::VerificationOracle;
use crate::TARGET_DEDUP;

/// Drives generate -> cluster -> verify -> merge for each entity type
pub struct Deduplicator {
    db: Database,
    oracle: Arc<dyn VerificationOracle>,
    config: DedupConfig,
    audit: Option<AuditLog>,
}

impl Deduplicator {
    /// Audits real merges into the configured audit log file
    pub fn new(db: Database, oracle: Arc<dyn VerificationOracle>, config: DedupConfig) -> Self {
        let audit = Some(AuditLog::new(config.audit_log_path.clone()));
        Self {
            db,
            oracle,
            config,
            audit,
        }
    }

    pub fn without_audit_log(mut self) -> Self {
        self.audit = None;
        self
    }

    pub fn audit_log(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    /// Full pipeline for one entity type.
    ///
    /// Store errors while loading entities, candidates or verification
    /// context abort the type; failures inside a merge unit are recorded in
    /// the report and the remaining clusters still run.
    pub async fn run_entity_type(&self, entity_type: EntityType) -> Result<TypeReport> {
        let dry_run = self.config.dry_run;
        let entities = self.db.get_entities(entity_type).await?;
        let mut report = TypeReport::new(entity_type, dry_run, entities.len() as i64);

        if entities.len() < 2 {
            info!(target: TARGET_DEDUP, "{}: {} entities, nothing to compare", entity_type, entities.len());
            report.finish(report.original_count);
            return Ok(report);
        }

        let pairs = find_candidates_among(
            &self.db,
            &entities,
            entity_type,
            &self.config.candidate_settings(),
        )
        .await?;
        report.candidate_pairs = pairs.len();

        let clusters = build_clusters(&pairs);
        report.clusters = clusters.len();
        info!(
            target: TARGET_DEDUP,
            "{}: {} candidate pairs form {} clusters",
            entity_type,
            pairs.len(),
            clusters.len()
        );

        let verified = verify_clusters(
            &self.db,
            Arc::clone(&self.oracle),
            entity_type,
            clusters,
            &self.config.verification_settings(),
        )
        .await?;

        for cluster in &verified {
            match cluster.outcome() {
                ClusterOutcome::Verified => {
                    report.verified_clusters += 1;
                    self.merge_verified(entity_type, cluster, &mut report).await;
                }
                ClusterOutcome::Rejected => {
                    report.rejected_clusters += 1;
                    info!(
                        target: TARGET_DEDUP,
                        "{}: cluster {:?} rejected by the oracle, not merging",
                        entity_type,
                        cluster.cluster.entity_ids
                    );
                }
                ClusterOutcome::Incomplete => {
                    report.incomplete_clusters += 1;
                    warn!(
                        target: TARGET_DEDUP,
                        "{}: cluster {:?} could not be fully verified, not merging",
                        entity_type,
                        cluster.cluster.entity_ids
                    );
                }
            }
        }

        let final_count = if dry_run {
            report.original_count - report.duplicates_found as i64
        } else {
            self.db.count_entities(entity_type).await?
        };
        report.finish(final_count);

        info!(
            target: TARGET_DEDUP,
            "{}{}: {} -> {} entities ({:.1}% reduction, {} duplicates, {} merge errors)",
            if dry_run { "[dry-run] " } else { "" },
            entity_type,
            report.original_count,
            report.final_count,
            report.reduction_percent,
            report.duplicates_found,
            report.merge_errors.len()
        );
        Ok(report)
    }

    async fn merge_verified(
        &self,
        entity_type: EntityType,
        cluster: &VerifiedCluster,
        report: &mut TypeReport,
    ) {
        let ids: Vec<i64> = cluster.cluster.entity_ids.iter().copied().collect();

        // A hint naming a member narrows the keeper choice to the matching members
        let hinted = cluster.hinted_ids();
        let keeper_pool = if hinted.is_empty() { &ids } else { &hinted };

        let keeper_id = match choose_canonical(&self.db, entity_type, keeper_pool).await {
            Ok((keeper_id, keeper_name)) => {
                info!(
                    target: TARGET_DEDUP,
                    "{}: keeping {} '{}' for cluster {:?}", entity_type, keeper_id, keeper_name, ids
                );
                keeper_id
            }
            Err(e) => {
                report
                    .merge_errors
                    .push(format!("cluster {:?}: keeper selection failed: {}", ids, e));
                return;
            }
        };

        match merge_cluster(
            &self.db,
            entity_type,
            keeper_id,
            &ids,
            self.config.dry_run,
            self.audit.as_ref(),
        )
        .await
        {
            Ok(result) => {
                report.duplicates_found += result.duplicates_removed();
                report.merge_errors.extend(result.failures.iter().map(|f| {
                    format!("{} {} into {}: {}", entity_type, f.duplicate_id, keeper_id, f.error)
                }));
                report.plans.push(result.plan);
            }
            Err(e) => report
                .merge_errors
                .push(format!("cluster {:?}: {}", ids, e)),
        }
    }

    /// Run the selected entity types one after another
    pub async fn run(&self, entity_types: &[EntityType]) -> Result<RunReport> {
        let mut types = Vec::with_capacity(entity_types.len());
        for &entity_type in entity_types {
            types.push(self.run_entity_type(entity_type).await?);
        }
        Ok(RunReport {
            dry_run: self.config.dry_run,
            types,
        })
    }
}
