use std::collections::HashMap;
use strsim::normalized_levenshtein;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use super::types::EntityType;
use super::TARGET_ENTITY;

/// Lexical comparison of entity names.
///
/// Names are compared after case folding and whitespace collapsing, so
/// `"Optimal  Transport "` and `"optimal transport"` are an exact match.
#[derive(Debug, Clone, Default)]
pub struct EntityNormalizer {
    // Per-type overrides of the default lexical thresholds
    similarity_thresholds: HashMap<EntityType, f64>,
}

impl EntityNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, entity_type: EntityType, threshold: f64) -> Self {
        self.similarity_thresholds.insert(entity_type, threshold);
        self
    }

    /// Fuzzy similarity required for two names of this type to be candidates
    pub fn similarity_threshold(&self, entity_type: EntityType) -> f64 {
        self.similarity_thresholds
            .get(&entity_type)
            .copied()
            .unwrap_or_else(|| entity_type.lexical_threshold())
    }

    /// Apply basic normalization: Unicode normalization, lowercase, whitespace
    pub fn normalize(&self, name: &str) -> String {
        name.nfkc()
            .collect::<String>()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Edit-similarity ratio of two already-normalized names, in [0, 1]
    pub fn similarity(&self, norm1: &str, norm2: &str) -> f64 {
        if norm1 == norm2 {
            return 1.0;
        }
        normalized_levenshtein(norm1, norm2)
    }

    /// Determine if two entity names match exactly after normalization
    pub fn exact_match(&self, name1: &str, name2: &str) -> bool {
        self.normalize(name1) == self.normalize(name2)
    }

    /// Determine if two entity names match, exactly or fuzzily
    pub fn names_match(&self, name1: &str, name2: &str, entity_type: EntityType) -> bool {
        let norm1 = self.normalize(name1);
        let norm2 = self.normalize(name2);

        if norm1 == norm2 {
            debug!(
                target: TARGET_ENTITY,
                "Exact match after normalization: '{}' == '{}'", name1, name2
            );
            return true;
        }

        let threshold = self.similarity_threshold(entity_type);
        let similarity = self.similarity(&norm1, &norm2);
        if similarity >= threshold {
            debug!(
                target: TARGET_ENTITY,
                "Fuzzy match: '{}' and '{}' with similarity {:.3} (threshold: {:.3})",
                name1, name2, similarity, threshold
            );
            return true;
        }

        false
    }
}
