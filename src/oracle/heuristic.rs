use async_trait::async_trait;
use tracing::debug;

use super::{OracleVerdict, VerificationContext, VerificationOracle};
use crate::db::Database;
use crate::dedup::candidates::cosine_similarity;
use crate::entity::{EntityNormalizer, EntityType};
use crate::error::Result;
use crate::TARGET_DEDUP;

pub const DEFAULT_STRICT_EMBEDDING_THRESHOLD: f64 = 0.92;

/// Rule-based judge for offline runs.
///
/// Confirms a pair when the names match lexically at the type threshold, or
/// failing that, when both embeddings are closer than a stricter threshold
/// than the one used to propose candidates.
#[derive(Debug, Clone)]
pub struct HeuristicOracle {
    db: Option<Database>,
    normalizer: EntityNormalizer,
    strict_embedding_threshold: f64,
}

impl HeuristicOracle {
    pub fn new(normalizer: EntityNormalizer) -> Self {
        Self {
            db: None,
            normalizer,
            strict_embedding_threshold: DEFAULT_STRICT_EMBEDDING_THRESHOLD,
        }
    }

    /// Enables the embedding rule
    pub fn with_embeddings(mut self, db: Database, threshold: f64) -> Self {
        self.db = Some(db);
        self.strict_embedding_threshold = threshold;
        self
    }

    async fn embedding_similarity(
        &self,
        entity_type: EntityType,
        a: i64,
        b: i64,
    ) -> Result<Option<f64>> {
        let Some(db) = &self.db else {
            return Ok(None);
        };
        let (Some(vec_a), Some(vec_b)) = (
            db.get_embedding(entity_type, a).await?,
            db.get_embedding(entity_type, b).await?,
        ) else {
            return Ok(None);
        };
        Ok(cosine_similarity(&vec_a.vector, &vec_b.vector))
    }
}

#[async_trait]
impl VerificationOracle for HeuristicOracle {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn verify(
        &self,
        entity_type: EntityType,
        a: &VerificationContext,
        b: &VerificationContext,
    ) -> Result<OracleVerdict> {
        let name_a = &a.entity.name;
        let name_b = &b.entity.name;

        if self.normalizer.exact_match(name_a, name_b) {
            return Ok(OracleVerdict::duplicate(format!(
                "'{}' and '{}' are identical after normalization",
                name_a, name_b
            )));
        }

        let norm_a = self.normalizer.normalize(name_a);
        let norm_b = self.normalizer.normalize(name_b);
        let ratio = self.normalizer.similarity(&norm_a, &norm_b);
        let threshold = self.normalizer.similarity_threshold(entity_type);
        if ratio >= threshold {
            return Ok(OracleVerdict::duplicate(format!(
                "name similarity {:.3} meets the {} threshold {:.2}",
                ratio, entity_type, threshold
            )));
        }

        if let Some(similarity) = self.embedding_similarity(entity_type, a.id(), b.id()).await? {
            debug!(
                target: TARGET_DEDUP,
                "Heuristic embedding check {} {} ~ {}: {:.3}", entity_type, a.id(), b.id(), similarity
            );
            if similarity >= self.strict_embedding_threshold {
                return Ok(OracleVerdict::duplicate(format!(
                    "embedding similarity {:.3} meets the strict threshold {:.2}",
                    similarity, self.strict_embedding_threshold
                )));
            }
        }

        Ok(OracleVerdict::distinct(format!(
            "name similarity {:.3} below {:.2} and no strong embedding agreement",
            ratio, threshold
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use std::collections::BTreeMap;

    fn context(id: i64, name: &str) -> VerificationContext {
        VerificationContext {
            entity: Entity::new(id, EntityType::Topic, name),
            relationship_count: 0,
            related_documents: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_lexical_rules() {
        let oracle = HeuristicOracle::new(EntityNormalizer::new());

        let same = oracle
            .verify(EntityType::Topic, &context(1, "Optimal Transport"), &context(2, "optimal  transport"))
            .await
            .unwrap();
        assert!(same.is_duplicate);
        assert!(same.canonical_name_hint.is_none());

        let different = oracle
            .verify(EntityType::Topic, &context(1, "Optimal Transport"), &context(2, "Optimal Control"))
            .await
            .unwrap();
        assert!(!different.is_duplicate);
    }

    #[tokio::test]
    async fn test_embedding_rule() {
        let db = Database::in_memory().await.unwrap();
        let empty = BTreeMap::new();
        let a = db.insert_or_get_entity(EntityType::Topic, "LLMs", &empty).await.unwrap();
        let b = db
            .insert_or_get_entity(EntityType::Topic, "Large Language Models", &empty)
            .await
            .unwrap();
        db.upsert_embedding(EntityType::Topic, a, &[1.0, 0.0], "m").await.unwrap();
        db.upsert_embedding(EntityType::Topic, b, &[0.99, 0.01], "m").await.unwrap();

        let oracle = HeuristicOracle::new(EntityNormalizer::new()).with_embeddings(db, 0.95);
        let verdict = oracle
            .verify(EntityType::Topic, &context(a, "LLMs"), &context(b, "Large Language Models"))
            .await
            .unwrap();
        assert!(verdict.is_duplicate, "{}", verdict.explanation);
    }
}
