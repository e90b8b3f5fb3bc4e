use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::entity::{EmbeddingVector, Entity, EntityNormalizer, EntityType};
use crate::error::Result;
use crate::TARGET_DEDUP;

/// How a candidate pair was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Lexical,
    Vector,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMethod::Lexical => write!(f, "lexical"),
            DetectionMethod::Vector => write!(f, "vector"),
        }
    }
}

/// Two entity ids flagged as possibly the same thing; `id_a < id_b`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub id_a: i64,
    pub id_b: i64,
    pub score: f64,
    pub methods: BTreeSet<DetectionMethod>,
}

impl CandidatePair {
    /// Builds a pair in canonical order. Returns `None` for a self-pair.
    pub fn new(id1: i64, id2: i64, score: f64, method: DetectionMethod) -> Option<Self> {
        if id1 == id2 {
            return None;
        }
        Some(CandidatePair {
            id_a: id1.min(id2),
            id_b: id1.max(id2),
            score: score.clamp(0.0, 1.0),
            methods: BTreeSet::from([method]),
        })
    }

    pub fn key(&self) -> (i64, i64) {
        (self.id_a, self.id_b)
    }

    pub fn methods_label(&self) -> String {
        self.methods
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// Knobs of the candidate generator
#[derive(Debug, Clone)]
pub struct CandidateSettings {
    pub embedding_threshold: f64,
    pub use_embeddings: bool,
    pub normalizer: EntityNormalizer,
}

impl Default for CandidateSettings {
    fn default() -> Self {
        Self {
            embedding_threshold: 0.85,
            use_embeddings: true,
            normalizer: EntityNormalizer::new(),
        }
    }
}

/// Lexical pass: exact matches after normalization score 1.0, everything
/// else is compared with the fuzzy ratio against the type threshold.
pub fn lexical_candidates(
    entities: &[Entity],
    entity_type: EntityType,
    normalizer: &EntityNormalizer,
) -> Vec<CandidatePair> {
    let normalized: Vec<(i64, String)> = entities
        .iter()
        .map(|e| (e.id, normalizer.normalize(&e.name)))
        .collect();
    let threshold = normalizer.similarity_threshold(entity_type);

    let mut pairs = Vec::new();
    for (i, (id1, norm1)) in normalized.iter().enumerate() {
        for (id2, norm2) in &normalized[i + 1..] {
            if norm1.is_empty() || norm2.is_empty() {
                continue;
            }
            if norm1 == norm2 {
                pairs.extend(CandidatePair::new(*id1, *id2, 1.0, DetectionMethod::Lexical));
                continue;
            }
            let ratio = normalizer.similarity(norm1, norm2);
            if ratio >= threshold {
                debug!(
                    target: TARGET_DEDUP,
                    "Fuzzy candidate {} {} ~ {}: {:.3}", entity_type, id1, id2, ratio
                );
                pairs.extend(CandidatePair::new(*id1, *id2, ratio, DetectionMethod::Lexical));
            }
        }
    }
    pairs
}

/// Cosine similarity of two vectors, `None` when undefined
pub fn cosine_similarity(vec1: &[f32], vec2: &[f32]) -> Option<f64> {
    if vec1.len() != vec2.len() || vec1.is_empty() {
        return None;
    }

    let mag1: f64 = vec1.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let mag2: f64 = vec2.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if mag1 < 1e-9 || mag2 < 1e-9 {
        return None;
    }

    let dot: f64 = vec1
        .iter()
        .zip(vec2.iter())
        .map(|(a, b)| (*a as f64) * (*b as f64))
        .sum();
    Some(dot / (mag1 * mag2))
}

/// Vector pass: every pair of embedded entities at or above the threshold
pub fn vector_candidates(embeddings: &[EmbeddingVector], threshold: f64) -> Vec<CandidatePair> {
    let mut pairs = Vec::new();
    let mut mismatched = 0usize;

    for (i, a) in embeddings.iter().enumerate() {
        for b in &embeddings[i + 1..] {
            match cosine_similarity(&a.vector, &b.vector) {
                Some(similarity) if similarity >= threshold => {
                    pairs.extend(CandidatePair::new(
                        a.entity_id,
                        b.entity_id,
                        similarity,
                        DetectionMethod::Vector,
                    ));
                }
                Some(_) => {}
                None => mismatched += 1,
            }
        }
    }

    if mismatched > 0 {
        warn!(
            target: TARGET_DEDUP,
            "Skipped {} vector comparisons with mismatched dimensions or zero magnitude", mismatched
        );
    }
    pairs
}

/// Union pairs by identity, keeping the max score and every method
pub fn combine_candidates(
    passes: impl IntoIterator<Item = Vec<CandidatePair>>,
) -> Vec<CandidatePair> {
    let mut combined: BTreeMap<(i64, i64), CandidatePair> = BTreeMap::new();
    for pair in passes.into_iter().flatten() {
        match combined.get_mut(&pair.key()) {
            Some(existing) => {
                existing.score = existing.score.max(pair.score);
                existing.methods.extend(pair.methods);
            }
            None => {
                combined.insert(pair.key(), pair);
            }
        }
    }
    combined.into_values().collect()
}

/// Candidate pairs for one entity type, ordered by `(id_a, id_b)`.
///
/// The scan is quadratic in the number of entities of the type.
pub async fn find_candidates(
    db: &Database,
    entity_type: EntityType,
    settings: &CandidateSettings,
) -> Result<Vec<CandidatePair>> {
    let entities = db.get_entities(entity_type).await?;
    find_candidates_among(db, &entities, entity_type, settings).await
}

/// Same as [`find_candidates`] over an already loaded entity list
pub async fn find_candidates_among(
    db: &Database,
    entities: &[Entity],
    entity_type: EntityType,
    settings: &CandidateSettings,
) -> Result<Vec<CandidatePair>> {
    let lexical = lexical_candidates(entities, entity_type, &settings.normalizer);

    let vector = if settings.use_embeddings {
        let embeddings = db.get_embeddings_for_type(entity_type).await?;
        vector_candidates(&embeddings, settings.embedding_threshold)
    } else {
        Vec::new()
    };

    info!(
        target: TARGET_DEDUP,
        "{}: {} lexical and {} vector candidate pairs over {} entities",
        entity_type,
        lexical.len(),
        vector.len(),
        entities.len()
    );

    Ok(combine_candidates([lexical, vector]))
}
