use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::candidates::CandidatePair;
use super::cluster::DuplicateCluster;
use crate::db::Database;
use crate::entity::{Entity, EntityType};
use crate::error::{DedupError, Result};
use crate::oracle::{OracleVerdict, VerificationContext, VerificationOracle};
use crate::TARGET_DEDUP;

/// Worker pool and per-call limits for oracle fan-out
#[derive(Debug, Clone)]
pub struct VerificationSettings {
    pub workers: usize,
    pub call_timeout: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub related_documents: usize,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            call_timeout: Duration::from_secs(60),
            retries: 1,
            retry_backoff: Duration::from_secs(1),
            related_documents: 5,
        }
    }
}

/// The oracle's answer for one pair, or the reason there is none
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairVerdict {
    pub pair: CandidatePair,
    pub is_duplicate: bool,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_name_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PairVerdict {
    fn answered(pair: CandidatePair, verdict: OracleVerdict) -> Self {
        Self {
            pair,
            is_duplicate: verdict.is_duplicate,
            explanation: verdict.explanation,
            canonical_name_hint: verdict.canonical_name_hint,
            error: None,
        }
    }

    fn failed(pair: CandidatePair, error: String) -> Self {
        Self {
            pair,
            is_duplicate: false,
            explanation: String::new(),
            canonical_name_hint: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterOutcome {
    /// Every pair confirmed
    Verified,
    /// At least one pair answered "not a duplicate"
    Rejected,
    /// Nothing rejected, but at least one call failed
    Incomplete,
}

/// A cluster with one verdict per candidate pair
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedCluster {
    pub cluster: DuplicateCluster,
    pub members: Vec<Entity>,
    pub verdicts: Vec<PairVerdict>,
}

impl VerifiedCluster {
    pub fn outcome(&self) -> ClusterOutcome {
        if self
            .verdicts
            .iter()
            .any(|v| v.error.is_none() && !v.is_duplicate)
        {
            ClusterOutcome::Rejected
        } else if self.verdicts.iter().any(|v| v.error.is_some()) {
            ClusterOutcome::Incomplete
        } else {
            ClusterOutcome::Verified
        }
    }

    pub fn is_fully_verified(&self) -> bool {
        self.outcome() == ClusterOutcome::Verified
    }

    /// Members whose name exactly equals the first usable canonical-name hint
    pub fn hinted_ids(&self) -> Vec<i64> {
        for verdict in &self.verdicts {
            let Some(hint) = &verdict.canonical_name_hint else {
                continue;
            };
            let ids: Vec<i64> = self
                .members
                .iter()
                .filter(|m| &m.name == hint)
                .map(|m| m.id)
                .collect();
            if !ids.is_empty() {
                return ids;
            }
        }
        Vec::new()
    }
}

struct PairTask {
    pair: CandidatePair,
    a: Arc<VerificationContext>,
    b: Arc<VerificationContext>,
}

/// Ask the oracle once, bounded by the call timeout, retrying failures
async fn call_oracle(
    oracle: &dyn VerificationOracle,
    entity_type: EntityType,
    task: &PairTask,
    settings: &VerificationSettings,
    worker_id: usize,
) -> PairVerdict {
    let mut backoff = settings.retry_backoff;
    let mut last_error = String::new();

    for attempt in 0..=settings.retries {
        match timeout(settings.call_timeout, oracle.verify(entity_type, &task.a, &task.b)).await {
            Ok(Ok(verdict)) => return PairVerdict::answered(task.pair.clone(), verdict),
            Ok(Err(e)) => {
                warn!(
                    target: TARGET_DEDUP,
                    "Worker {}: oracle error on {} {:?} (attempt {}/{}): {}",
                    worker_id, entity_type, task.pair.key(), attempt + 1, settings.retries + 1, e
                );
                let fatal = e.is_fatal();
                last_error = e.to_string();
                if fatal {
                    break;
                }
            }
            Err(_) => {
                let e = DedupError::OracleTimeout(settings.call_timeout);
                warn!(
                    target: TARGET_DEDUP,
                    "Worker {}: {} on {} {:?} (attempt {}/{})",
                    worker_id, e, entity_type, task.pair.key(), attempt + 1, settings.retries + 1
                );
                last_error = e.to_string();
            }
        }

        if attempt < settings.retries {
            sleep(backoff).await;
            backoff *= 2;
        }
    }

    PairVerdict::failed(task.pair.clone(), last_error)
}

async fn load_contexts(
    db: &Database,
    entity_type: EntityType,
    clusters: &[DuplicateCluster],
    related_documents: usize,
) -> Result<HashMap<i64, Arc<VerificationContext>>> {
    let mut contexts = HashMap::new();
    for id in clusters.iter().flat_map(|c| c.entity_ids.iter().copied()) {
        if contexts.contains_key(&id) {
            continue;
        }
        match db.get_entity(entity_type, id).await? {
            Some(entity) => {
                let context = VerificationContext::load(db, entity, related_documents).await?;
                contexts.insert(id, Arc::new(context));
            }
            None => warn!(target: TARGET_DEDUP, "{} {} vanished before verification", entity_type, id),
        }
    }
    Ok(contexts)
}

/// Verify every pair of every cluster on a fixed pool of workers.
///
/// Workers pull tasks from a shared channel and push verdicts onto a results
/// channel; verdicts are matched back to clusters by pair identity, so
/// arrival order does not matter. A pair with no verdict counts as a failed
/// call.
pub async fn verify_clusters(
    db: &Database,
    oracle: Arc<dyn VerificationOracle>,
    entity_type: EntityType,
    clusters: Vec<DuplicateCluster>,
    settings: &VerificationSettings,
) -> Result<Vec<VerifiedCluster>> {
    if clusters.is_empty() {
        return Ok(Vec::new());
    }

    let contexts = load_contexts(db, entity_type, &clusters, settings.related_documents).await?;

    let (task_tx, task_rx) = mpsc::unbounded_channel::<PairTask>();
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<((i64, i64), PairVerdict)>();
    let mut results: HashMap<(i64, i64), PairVerdict> = HashMap::new();

    let mut queued = 0usize;
    for pair in clusters.iter().flat_map(|c| c.pairs.iter()) {
        match (contexts.get(&pair.id_a), contexts.get(&pair.id_b)) {
            (Some(a), Some(b)) => {
                let task = PairTask {
                    pair: pair.clone(),
                    a: Arc::clone(a),
                    b: Arc::clone(b),
                };
                if task_tx.send(task).is_ok() {
                    queued += 1;
                }
            }
            _ => {
                results.insert(
                    pair.key(),
                    PairVerdict::failed(pair.clone(), "entity no longer exists".to_string()),
                );
            }
        }
    }
    drop(task_tx);

    let workers = settings.workers.clamp(1, 64).min(queued.max(1));
    info!(
        target: TARGET_DEDUP,
        "{}: verifying {} pairs across {} clusters with {} workers using the {} oracle",
        entity_type,
        queued,
        clusters.len(),
        workers,
        oracle.name()
    );

    let task_rx = Arc::new(Mutex::new(task_rx));
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let task_rx = Arc::clone(&task_rx);
        let result_tx = result_tx.clone();
        let oracle = Arc::clone(&oracle);
        let settings = settings.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let task = { task_rx.lock().await.recv().await };
                let Some(task) = task else {
                    break;
                };
                let verdict =
                    call_oracle(oracle.as_ref(), entity_type, &task, &settings, worker_id).await;
                if result_tx.send((task.pair.key(), verdict)).is_err() {
                    break;
                }
            }
            debug!(target: TARGET_DEDUP, "Verification worker {} finished", worker_id);
        }));
    }
    drop(result_tx);

    // Channel closes once every worker has exited
    while let Some((key, verdict)) = result_rx.recv().await {
        results.insert(key, verdict);
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!(target: TARGET_DEDUP, "Verification worker panicked: {}", e);
        }
    }

    // Barrier: a cluster is decided only with a verdict slot for every pair
    let verified = clusters
        .into_iter()
        .map(|cluster| {
            let verdicts = cluster
                .pairs
                .iter()
                .map(|pair| {
                    results.remove(&pair.key()).unwrap_or_else(|| {
                        PairVerdict::failed(pair.clone(), "no verdict received".to_string())
                    })
                })
                .collect();
            let members = cluster
                .entity_ids
                .iter()
                .filter_map(|id| contexts.get(id).map(|c| c.entity.clone()))
                .collect();
            VerifiedCluster {
                cluster,
                members,
                verdicts,
            }
        })
        .collect();

    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::candidates::DetectionMethod;
    use crate::dedup::cluster::build_clusters;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects listed pairs, hangs on others, fails on others, confirms the rest
    #[derive(Default)]
    struct ScriptedOracle {
        reject: HashSet<(i64, i64)>,
        hang: HashSet<(i64, i64)>,
        fail: HashSet<(i64, i64)>,
        hint: Option<String>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl VerificationOracle for ScriptedOracle {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn verify(
            &self,
            _entity_type: EntityType,
            a: &VerificationContext,
            b: &VerificationContext,
        ) -> Result<OracleVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let key = (a.id().min(b.id()), a.id().max(b.id()));
            // Yield so several workers overlap
            sleep(Duration::from_millis(10)).await;
            let result = if self.hang.contains(&key) {
                sleep(Duration::from_secs(3600)).await;
                Ok(OracleVerdict::duplicate("late"))
            } else if self.fail.contains(&key) {
                Err(DedupError::Oracle("backend unavailable".to_string()))
            } else if self.reject.contains(&key) {
                Ok(OracleVerdict::distinct("different things"))
            } else {
                let verdict = OracleVerdict::duplicate("same thing");
                Ok(match &self.hint {
                    Some(hint) => verdict.with_canonical_name(hint.clone()),
                    None => verdict,
                })
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    async fn seed(db: &Database, names: &[&str]) -> Vec<i64> {
        let mut ids = Vec::new();
        for name in names {
            ids.push(
                db.insert_or_get_entity(EntityType::Topic, name, &BTreeMap::new())
                    .await
                    .unwrap(),
            );
        }
        ids
    }

    fn triangle(ids: &[i64]) -> Vec<DuplicateCluster> {
        let pairs: Vec<CandidatePair> = [(0, 1), (0, 2), (1, 2)]
            .iter()
            .map(|(i, j)| CandidatePair::new(ids[*i], ids[*j], 1.0, DetectionMethod::Lexical).unwrap())
            .collect();
        build_clusters(&pairs)
    }

    fn fast_settings() -> VerificationSettings {
        VerificationSettings {
            workers: 4,
            call_timeout: Duration::from_millis(200),
            retries: 0,
            retry_backoff: Duration::from_millis(1),
            related_documents: 3,
        }
    }

    #[tokio::test]
    async fn test_all_pairs_confirmed() {
        let db = Database::in_memory().await.unwrap();
        let ids = seed(&db, &["Optimal Transport", "optimal transport", "Optimal  Transport "]).await;
        let oracle = Arc::new(ScriptedOracle::default());

        let verified = verify_clusters(&db, oracle.clone(), EntityType::Topic, triangle(&ids), &fast_settings())
            .await
            .unwrap();

        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].outcome(), ClusterOutcome::Verified);
        assert_eq!(verified[0].verdicts.len(), 3);
        assert_eq!(verified[0].members.len(), 3);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_one_rejection_rejects_cluster() {
        let db = Database::in_memory().await.unwrap();
        let ids = seed(&db, &["A", "B", "C"]).await;
        let oracle = Arc::new(ScriptedOracle {
            reject: HashSet::from([(ids[0], ids[2])]),
            ..Default::default()
        });

        let verified = verify_clusters(&db, oracle, EntityType::Topic, triangle(&ids), &fast_settings())
            .await
            .unwrap();
        assert_eq!(verified[0].outcome(), ClusterOutcome::Rejected);
        assert!(!verified[0].is_fully_verified());
    }

    #[tokio::test]
    async fn test_timeout_and_errors_do_not_block_batch() {
        let db = Database::in_memory().await.unwrap();
        let ids = seed(&db, &["A", "B", "C"]).await;
        let oracle = Arc::new(ScriptedOracle {
            hang: HashSet::from([(ids[0], ids[1])]),
            fail: HashSet::from([(ids[1], ids[2])]),
            ..Default::default()
        });

        let verified = tokio::time::timeout(
            Duration::from_secs(10),
            verify_clusters(&db, oracle, EntityType::Topic, triangle(&ids), &fast_settings()),
        )
        .await
        .expect("verification must not hang")
        .unwrap();

        let cluster = &verified[0];
        assert_eq!(cluster.outcome(), ClusterOutcome::Incomplete);
        let errors: Vec<_> = cluster.verdicts.iter().filter(|v| v.error.is_some()).collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|v| !v.is_duplicate));
    }

    #[tokio::test]
    async fn test_retries_failed_calls() {
        let db = Database::in_memory().await.unwrap();
        let ids = seed(&db, &["A", "B"]).await;
        let oracle = Arc::new(ScriptedOracle {
            fail: HashSet::from([(ids[0], ids[1])]),
            ..Default::default()
        });
        let pairs = vec![CandidatePair::new(ids[0], ids[1], 1.0, DetectionMethod::Lexical).unwrap()];
        let settings = VerificationSettings {
            retries: 2,
            ..fast_settings()
        };

        let verified = verify_clusters(&db, oracle.clone(), EntityType::Topic, build_clusters(&pairs), &settings)
            .await
            .unwrap();
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
        assert_eq!(verified[0].outcome(), ClusterOutcome::Incomplete);
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let db = Database::in_memory().await.unwrap();
        let names: Vec<String> = (0..12).map(|i| format!("Entity {}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let ids = seed(&db, &refs).await;
        let pairs: Vec<CandidatePair> = ids
            .chunks(2)
            .map(|c| CandidatePair::new(c[0], c[1], 0.9, DetectionMethod::Vector).unwrap())
            .collect();
        let oracle = Arc::new(ScriptedOracle::default());
        let settings = VerificationSettings {
            workers: 2,
            ..fast_settings()
        };

        let verified = verify_clusters(&db, oracle.clone(), EntityType::Topic, build_clusters(&pairs), &settings)
            .await
            .unwrap();
        assert_eq!(verified.len(), 6);
        assert!(verified.iter().all(|c| c.is_fully_verified()));
        assert!(oracle.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_hint_matching_a_member() {
        let db = Database::in_memory().await.unwrap();
        let ids = seed(&db, &["optimal transport", "Optimal Transport"]).await;
        let pairs = vec![CandidatePair::new(ids[0], ids[1], 1.0, DetectionMethod::Lexical).unwrap()];

        let oracle = Arc::new(ScriptedOracle {
            hint: Some("Optimal Transport".to_string()),
            ..Default::default()
        });
        let verified = verify_clusters(&db, oracle, EntityType::Topic, build_clusters(&pairs), &fast_settings())
            .await
            .unwrap();
        assert_eq!(verified[0].hinted_ids(), vec![ids[1]]);

        let oracle = Arc::new(ScriptedOracle {
            hint: Some("OT".to_string()),
            ..Default::default()
        });
        let verified = verify_clusters(&db, oracle, EntityType::Topic, build_clusters(&pairs), &fast_settings())
            .await
            .unwrap();
        assert!(verified[0].hinted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_missing_entity_counts_as_failed_pair() {
        let db = Database::in_memory().await.unwrap();
        let ids = seed(&db, &["A"]).await;
        let pairs = vec![CandidatePair::new(ids[0], 999, 1.0, DetectionMethod::Lexical).unwrap()];
        let oracle = Arc::new(ScriptedOracle::default());

        let verified = verify_clusters(&db, oracle.clone(), EntityType::Topic, build_clusters(&pairs), &fast_settings())
            .await
            .unwrap();
        assert_eq!(verified[0].outcome(), ClusterOutcome::Incomplete);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }
}
