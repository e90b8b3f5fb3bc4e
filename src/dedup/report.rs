use prettytable::{Cell, Row as PrettyRow, Table};
use serde::Serialize;
use std::collections::HashMap;

use super::cluster::DuplicateCluster;
use super::merge::MergePlan;
use crate::db::Database;
use crate::entity::{Entity, EntityType};
use crate::error::Result;

/// Share of entities removed, in percent
pub fn reduction_percent(original: i64, remaining: i64) -> f64 {
    if original <= 0 {
        return 0.0;
    }
    (original - remaining) as f64 / original as f64 * 100.0
}

/// Outcome of one entity type's pipeline
#[derive(Debug, Clone, Serialize)]
pub struct TypeReport {
    pub entity_type: EntityType,
    pub dry_run: bool,
    pub original_count: i64,
    pub candidate_pairs: usize,
    pub clusters: usize,
    pub verified_clusters: usize,
    pub rejected_clusters: usize,
    pub incomplete_clusters: usize,
    pub duplicates_found: usize,
    pub final_count: i64,
    pub reduction_percent: f64,
    pub merge_errors: Vec<String>,
    pub plans: Vec<MergePlan>,
}

impl TypeReport {
    pub fn new(entity_type: EntityType, dry_run: bool, original_count: i64) -> Self {
        Self {
            entity_type,
            dry_run,
            original_count,
            candidate_pairs: 0,
            clusters: 0,
            verified_clusters: 0,
            rejected_clusters: 0,
            incomplete_clusters: 0,
            duplicates_found: 0,
            final_count: original_count,
            reduction_percent: 0.0,
            merge_errors: Vec::new(),
            plans: Vec::new(),
        }
    }

    pub(crate) fn finish(&mut self, final_count: i64) {
        self.final_count = final_count;
        self.reduction_percent = reduction_percent(self.original_count, final_count);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub types: Vec<TypeReport>,
}

impl RunReport {
    pub fn total_original(&self) -> i64 {
        self.types.iter().map(|t| t.original_count).sum()
    }

    pub fn total_final(&self) -> i64 {
        self.types.iter().map(|t| t.final_count).sum()
    }

    pub fn total_duplicates(&self) -> usize {
        self.types.iter().map(|t| t.duplicates_found).sum()
    }

    pub fn total_merge_errors(&self) -> usize {
        self.types.iter().map(|t| t.merge_errors.len()).sum()
    }

    pub fn summary_table(&self) -> Table {
        let mut table = Table::new();
        table.add_row(PrettyRow::new(vec![
            Cell::new("Type"),
            Cell::new("Original"),
            Cell::new("Pairs"),
            Cell::new("Clusters"),
            Cell::new("Verified"),
            Cell::new("Rejected"),
            Cell::new("Incomplete"),
            Cell::new(if self.dry_run { "Would Merge" } else { "Merged" }),
            Cell::new("Final"),
            Cell::new("Reduction"),
            Cell::new("Errors"),
        ]));

        for report in &self.types {
            table.add_row(PrettyRow::new(vec![
                Cell::new(report.entity_type.as_str()),
                Cell::new(&report.original_count.to_string()),
                Cell::new(&report.candidate_pairs.to_string()),
                Cell::new(&report.clusters.to_string()),
                Cell::new(&report.verified_clusters.to_string()),
                Cell::new(&report.rejected_clusters.to_string()),
                Cell::new(&report.incomplete_clusters.to_string()),
                Cell::new(&report.duplicates_found.to_string()),
                Cell::new(&report.final_count.to_string()),
                Cell::new(&format!("{:.1}%", report.reduction_percent)),
                Cell::new(&report.merge_errors.len().to_string()),
            ]));
        }

        table.add_row(PrettyRow::new(vec![
            Cell::new("TOTAL"),
            Cell::new(&self.total_original().to_string()),
            Cell::new(""),
            Cell::new(""),
            Cell::new(""),
            Cell::new(""),
            Cell::new(""),
            Cell::new(&self.total_duplicates().to_string()),
            Cell::new(&self.total_final().to_string()),
            Cell::new(&format!(
                "{:.1}%",
                reduction_percent(self.total_original(), self.total_final())
            )),
            Cell::new(&self.total_merge_errors().to_string()),
        ]));
        table
    }

    /// One row per planned or applied cluster merge
    pub fn plans_table(&self) -> Table {
        let mut table = Table::new();
        table.add_row(PrettyRow::new(vec![
            Cell::new("Type"),
            Cell::new("Keeper"),
            Cell::new("Duplicates"),
            Cell::new("Attributes"),
            Cell::new("Relationship Actions"),
        ]));
        for plan in self.types.iter().flat_map(|t| t.plans.iter()) {
            let duplicates = plan
                .duplicate_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let attributes = plan
                .attribute_updates
                .keys()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            table.add_row(PrettyRow::new(vec![
                Cell::new(plan.entity_type.as_str()),
                Cell::new(&format!("{} ({})", plan.keeper_name, plan.keeper_id)),
                Cell::new(&duplicates),
                Cell::new(&attributes),
                Cell::new(&plan.relationship_actions.len().to_string()),
            ]));
        }
        table
    }
}

/// Candidate clusters with member names, for the diagnostics command
pub fn clusters_table(entities: &[Entity], clusters: &[DuplicateCluster]) -> Table {
    let names: HashMap<i64, &str> = entities.iter().map(|e| (e.id, e.name.as_str())).collect();

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Cluster"),
        Cell::new("Pair"),
        Cell::new("Names"),
        Cell::new("Score"),
        Cell::new("Methods"),
    ]));
    for (index, cluster) in clusters.iter().enumerate() {
        for pair in &cluster.pairs {
            let name_a = names.get(&pair.id_a).copied().unwrap_or("?");
            let name_b = names.get(&pair.id_b).copied().unwrap_or("?");
            table.add_row(PrettyRow::new(vec![
                Cell::new(&(index + 1).to_string()),
                Cell::new(&format!("{} ~ {}", pair.id_a, pair.id_b)),
                Cell::new(&format!("'{}' ~ '{}'", name_a, name_b)),
                Cell::new(&format!("{:.3}", pair.score)),
                Cell::new(&pair.methods_label()),
            ]));
        }
    }
    table
}

/// Entity and relationship counts of the store
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub entities: Vec<(EntityType, i64)>,
    pub relationships: i64,
    pub duplicate_relationships: i64,
}

impl StoreStats {
    pub async fn collect(db: &Database) -> Result<Self> {
        let mut entities = Vec::with_capacity(EntityType::ALL.len());
        for entity_type in EntityType::ALL {
            entities.push((entity_type, db.count_entities(entity_type).await?));
        }
        Ok(Self {
            entities,
            relationships: db.count_relationships_total().await?,
            duplicate_relationships: db.count_duplicate_relationships().await?,
        })
    }

    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.add_row(PrettyRow::new(vec![Cell::new("Type"), Cell::new("Count")]));
        for (entity_type, count) in &self.entities {
            table.add_row(PrettyRow::new(vec![
                Cell::new(entity_type.table()),
                Cell::new(&count.to_string()),
            ]));
        }
        table.add_row(PrettyRow::new(vec![
            Cell::new("relationships"),
            Cell::new(&self.relationships.to_string()),
        ]));
        table.add_row(PrettyRow::new(vec![
            Cell::new("duplicate relationships"),
            Cell::new(&self.duplicate_relationships.to_string()),
        ]));
        table
    }
}
