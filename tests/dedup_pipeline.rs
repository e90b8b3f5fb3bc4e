use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kgdedup::config::{DedupConfig, OracleBackend};
use kgdedup::db::Database;
use kgdedup::dedup::{
    build_clusters, find_candidates, merge_cluster, CandidateSettings, Deduplicator,
    DetectionMethod,
};
use kgdedup::entity::{EntityNormalizer, EntityType, NodeType};
use kgdedup::error::{DedupError, Result};
use kgdedup::oracle::{HeuristicOracle, OracleVerdict, VerificationContext, VerificationOracle};

const TOPIC: NodeType = NodeType::Entity(EntityType::Topic);

/// Confirms every pair except the ones listed, optionally naming a canonical form
#[derive(Default)]
struct MockOracle {
    reject: HashSet<(i64, i64)>,
    fail: HashSet<(i64, i64)>,
    hint: Option<String>,
}

#[async_trait]
impl VerificationOracle for MockOracle {
    fn name(&self) -> &str {
        "mock"
    }

    async fn verify(
        &self,
        _entity_type: EntityType,
        a: &VerificationContext,
        b: &VerificationContext,
    ) -> Result<OracleVerdict> {
        let key = (a.id().min(b.id()), a.id().max(b.id()));
        if self.fail.contains(&key) {
            return Err(DedupError::Oracle("mock failure".to_string()));
        }
        if self.reject.contains(&key) {
            return Ok(OracleVerdict::distinct("mock says different"));
        }
        let verdict = OracleVerdict::duplicate("mock says same");
        Ok(match &self.hint {
            Some(name) => verdict.with_canonical_name(name.clone()),
            None => verdict,
        })
    }
}

fn test_config(dir: &Path, dry_run: bool) -> DedupConfig {
    DedupConfig {
        oracle: OracleBackend::Heuristic,
        workers: 4,
        oracle_timeout: Duration::from_secs(5),
        oracle_retries: 0,
        audit_log_path: dir.join("audit.json"),
        dry_run,
        ..DedupConfig::default()
    }
}

async fn topic(db: &Database, name: &str) -> i64 {
    db.insert_or_get_entity(EntityType::Topic, name, &BTreeMap::new())
        .await
        .unwrap()
}

async fn discusses(db: &Database, doc: i64, topic_id: i64) {
    db.add_relationship(NodeType::Document, doc, TOPIC, topic_id, "discusses", 0.9, None)
        .await
        .unwrap();
}

/// Three spellings of one topic; the middle one is the best connected
async fn seed_optimal_transport(db: &Database) -> [i64; 3] {
    let t1 = topic(db, "Optimal Transport").await;
    let t2 = topic(db, "optimal transport").await;
    let t3 = topic(db, "Optimal  Transport ").await;

    let doc1 = db.add_document("Sinkhorn Distances").await.unwrap();
    let doc2 = db.add_document("Computational Optimal Transport").await.unwrap();
    let doc3 = db.add_document("Wasserstein GAN").await.unwrap();
    discusses(db, doc1, t1).await;
    discusses(db, doc1, t2).await;
    discusses(db, doc2, t2).await;
    discusses(db, doc3, t3).await;

    for id in [t1, t2, t3] {
        db.upsert_embedding(EntityType::Topic, id, &[0.6, 0.8, 0.0], "test-model")
            .await
            .unwrap();
    }
    [t1, t2, t3]
}

#[tokio::test]
async fn optimal_transport_cluster_collapses_into_best_connected_entity() {
    let db = Database::in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let [t1, t2, t3] = seed_optimal_transport(&db).await;

    let dedup = Deduplicator::new(db.clone(), Arc::new(MockOracle::default()), test_config(dir.path(), false));
    let report = dedup.run_entity_type(EntityType::Topic).await.unwrap();

    assert_eq!(report.original_count, 3);
    assert_eq!(report.candidate_pairs, 3);
    assert_eq!(report.clusters, 1);
    assert_eq!(report.verified_clusters, 1);
    assert_eq!(report.duplicates_found, 2);
    assert_eq!(report.final_count, 1);
    assert!((report.reduction_percent - 66.666).abs() < 0.01);
    assert!(report.merge_errors.is_empty());

    let remaining = db.get_entities(EntityType::Topic).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, t2);

    // doc1's second edge collapsed; every document now points at the keeper
    let relationships = db.get_relationships_of(EntityType::Topic, t2).await.unwrap();
    assert_eq!(relationships.len(), 3);
    assert_eq!(db.count_relationships_total().await.unwrap(), 3);
    assert_eq!(db.count_duplicate_relationships().await.unwrap(), 0);

    assert!(db.get_embedding(EntityType::Topic, t1).await.unwrap().is_none());
    assert!(db.get_embedding(EntityType::Topic, t3).await.unwrap().is_none());
    assert!(db.get_embedding(EntityType::Topic, t2).await.unwrap().is_some());

    // One entry per folded duplicate, so a three-member cluster leaves two
    let entries = dedup.audit_log().unwrap().entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.keeper.id == t2));
    let mut duplicates: Vec<i64> = entries.iter().map(|e| e.duplicate.id).collect();
    duplicates.sort_unstable();
    assert_eq!(duplicates, vec![t1, t3]);
}

#[tokio::test]
async fn canonical_name_hint_overrides_connectivity() {
    let db = Database::in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let connected = topic(&db, "optimal transport").await;
    let hinted = topic(&db, "Optimal Transport").await;
    for title in ["Sinkhorn Distances", "Computational Optimal Transport", "Wasserstein GAN"] {
        let doc = db.add_document(title).await.unwrap();
        discusses(&db, doc, connected).await;
    }

    let oracle = MockOracle {
        hint: Some("Optimal Transport".to_string()),
        ..Default::default()
    };
    let dedup = Deduplicator::new(db.clone(), Arc::new(oracle), test_config(dir.path(), false));
    let report = dedup.run_entity_type(EntityType::Topic).await.unwrap();

    assert_eq!(report.verified_clusters, 1);
    assert_eq!(report.duplicates_found, 1);
    assert_eq!(report.plans[0].keeper_id, hinted);

    let remaining = db.get_entities(EntityType::Topic).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, hinted);
    assert!(db.get_entity(EntityType::Topic, connected).await.unwrap().is_none());
    assert_eq!(db.relationship_count(EntityType::Topic, hinted).await.unwrap(), 3);
    assert_eq!(db.count_relationships_total().await.unwrap(), 3);
}

#[tokio::test]
async fn transitive_pairs_from_different_methods_form_one_cluster() {
    let db = Database::in_memory().await.unwrap();
    let a = topic(&db, "Graph Neural Network").await;
    let b = topic(&db, "Graph Neural Networks").await;
    let c = topic(&db, "GNN").await;
    db.upsert_embedding(EntityType::Topic, b, &[1.0, 0.0], "m").await.unwrap();
    db.upsert_embedding(EntityType::Topic, c, &[0.99, 0.05], "m").await.unwrap();

    let pairs = find_candidates(&db, EntityType::Topic, &CandidateSettings::default())
        .await
        .unwrap();
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].key(), (a, b));
    assert!(pairs[0].methods.contains(&DetectionMethod::Lexical));
    assert_eq!(pairs[1].key(), (b, c));
    assert!(pairs[1].methods.contains(&DetectionMethod::Vector));

    let clusters = build_clusters(&pairs);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].entity_ids.iter().copied().collect::<Vec<_>>(), vec![a, b, c]);

    let dir = tempfile::tempdir().unwrap();
    let dedup = Deduplicator::new(db.clone(), Arc::new(MockOracle::default()), test_config(dir.path(), false));
    let report = dedup.run_entity_type(EntityType::Topic).await.unwrap();
    assert_eq!(report.final_count, 1);
}

#[tokio::test]
async fn one_rejected_pair_blocks_the_whole_cluster() {
    let db = Database::in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let [t1, _, t3] = seed_optimal_transport(&db).await;

    let oracle = MockOracle {
        reject: HashSet::from([(t1, t3)]),
        ..Default::default()
    };
    let dedup = Deduplicator::new(db.clone(), Arc::new(oracle), test_config(dir.path(), false));
    let report = dedup.run_entity_type(EntityType::Topic).await.unwrap();

    assert_eq!(report.clusters, 1);
    assert_eq!(report.rejected_clusters, 1);
    assert_eq!(report.verified_clusters, 0);
    assert_eq!(report.duplicates_found, 0);
    assert_eq!(report.final_count, 3);
    assert_eq!(report.reduction_percent, 0.0);
    assert!(report.plans.is_empty());
    assert_eq!(db.count_entities(EntityType::Topic).await.unwrap(), 3);
    assert!(dedup.audit_log().unwrap().entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_oracle_calls_leave_cluster_untouched() {
    let db = Database::in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let [t1, t2, _] = seed_optimal_transport(&db).await;

    let oracle = MockOracle {
        fail: HashSet::from([(t1, t2)]),
        ..Default::default()
    };
    let dedup = Deduplicator::new(db.clone(), Arc::new(oracle), test_config(dir.path(), false));
    let report = dedup.run_entity_type(EntityType::Topic).await.unwrap();

    assert_eq!(report.incomplete_clusters, 1);
    assert_eq!(report.duplicates_found, 0);
    assert_eq!(db.count_entities(EntityType::Topic).await.unwrap(), 3);
}

#[tokio::test]
async fn dry_run_reports_the_same_plan_without_writing() {
    let db = Database::in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    seed_optimal_transport(&db).await;
    let oracle: Arc<dyn VerificationOracle> = Arc::new(MockOracle::default());

    let preview = Deduplicator::new(db.clone(), Arc::clone(&oracle), test_config(dir.path(), true));
    let planned = preview.run_entity_type(EntityType::Topic).await.unwrap();
    assert!(planned.dry_run);
    assert_eq!(planned.duplicates_found, 2);
    assert_eq!(planned.final_count, 1);
    assert_eq!(db.count_entities(EntityType::Topic).await.unwrap(), 3);
    assert_eq!(db.count_relationships_total().await.unwrap(), 4);
    assert!(preview.audit_log().unwrap().entries().await.unwrap().is_empty());

    let real = Deduplicator::new(db.clone(), oracle, test_config(dir.path(), false));
    let applied = real.run_entity_type(EntityType::Topic).await.unwrap();
    assert_eq!(planned.plans, applied.plans);
    assert_eq!(planned.final_count, applied.final_count);
    assert_eq!(real.audit_log().unwrap().entries().await.unwrap().len(), 2);
}

#[tokio::test]
async fn rerunning_is_a_noop() {
    let db = Database::in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let ids = seed_optimal_transport(&db).await;

    let dedup = Deduplicator::new(db.clone(), Arc::new(MockOracle::default()), test_config(dir.path(), false));
    dedup.run(&EntityType::ALL).await.unwrap();

    let second = dedup.run(&EntityType::ALL).await.unwrap();
    assert_eq!(second.total_duplicates(), 0);
    assert_eq!(second.total_merge_errors(), 0);
    assert_eq!(second.types[0].original_count, 1);
    assert_eq!(second.types[0].candidate_pairs, 0);

    // Merging the stale cluster again does nothing
    let stale = merge_cluster(&db, EntityType::Topic, ids[1], &ids, false, None)
        .await
        .unwrap();
    assert!(stale.merges.iter().all(|m| m.is_empty()));
    assert!(stale.failures.is_empty());
    assert_eq!(dedup.audit_log().unwrap().entries().await.unwrap().len(), 2);
}

#[tokio::test]
async fn shared_document_edge_survives_once_with_heuristic_oracle() {
    let db = Database::in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let d = db.add_document("A survey of transport maps").await.unwrap();
    let a = topic(&db, "Optimal Transport").await;
    let b = topic(&db, "optimal transport").await;
    discusses(&db, d, a).await;
    discusses(&db, d, b).await;
    // An extra edge makes A the keeper
    let other = db.add_document("Another paper").await.unwrap();
    discusses(&db, other, a).await;

    let mut config = test_config(dir.path(), false);
    config.use_embeddings = false;
    let oracle = Arc::new(HeuristicOracle::new(EntityNormalizer::new()));
    let dedup = Deduplicator::new(db.clone(), oracle, config);
    let report = dedup.run_entity_type(EntityType::Topic).await.unwrap();
    assert_eq!(report.duplicates_found, 1);

    let relationships = db.get_relationships_of(EntityType::Topic, a).await.unwrap();
    let from_d: Vec<_> = relationships
        .iter()
        .filter(|r| r.source_type == NodeType::Document && r.source_id == d)
        .collect();
    assert_eq!(from_d.len(), 1);
    assert_eq!(from_d[0].relationship_type, "discusses");
    assert_eq!(from_d[0].target_id, a);
    assert_eq!(db.count_duplicate_relationships().await.unwrap(), 0);
}

#[tokio::test]
async fn persons_use_the_stricter_threshold() {
    let db = Database::in_memory().await.unwrap();
    let empty = BTreeMap::new();
    db.insert_or_get_entity(EntityType::Person, "Marco Cuturi", &empty).await.unwrap();
    db.insert_or_get_entity(EntityType::Person, "Marco Cuturo", &empty).await.unwrap();
    db.insert_or_get_entity(EntityType::Person, "Marc Cutler", &empty).await.unwrap();

    let settings = CandidateSettings {
        use_embeddings: false,
        ..CandidateSettings::default()
    };
    let pairs = find_candidates(&db, EntityType::Person, &settings).await.unwrap();
    assert_eq!(pairs.len(), 1);
    assert!(pairs[0].score >= 0.9);
}
