use std::cmp::Ordering;
use tracing::debug;

use crate::db::entity::{count_relationships, fetch_entity};
use crate::db::Database;
use crate::entity::{AttributeField, Entity, EntityType};
use crate::error::{DedupError, Result};
use crate::TARGET_DEDUP;

/// Quality score of an entity as a merge keeper.
///
/// Connectivity dominates; name formatting and attribute completeness only
/// separate entities with equal relationship counts.
pub fn canonical_score(entity: &Entity, relationship_count: i64) -> f64 {
    let name = entity.name.as_str();
    let mut score = relationship_count as f64 * 100.0;

    if name.chars().next().is_some_and(|c| c.is_uppercase()) {
        score += 50.0;
    }
    if !name.contains('-') && !name.contains('_') {
        score += 30.0;
    }
    if name.contains(". ") {
        score += 20.0;
    } else if has_unspaced_trailing_punctuation(name) {
        score -= 10.0;
    }
    score += name.chars().count() as f64 * 0.1;

    if entity.attribute(AttributeField::Description).is_some() {
        score += 10.0;
    }
    if [
        AttributeField::Category,
        AttributeField::Role,
        AttributeField::Affiliation,
    ]
    .iter()
    .any(|field| entity.attribute(*field).is_some())
    {
        score += 10.0;
    }

    score
}

// "Smith J." or "J.Smith" style names
fn has_unspaced_trailing_punctuation(name: &str) -> bool {
    let trimmed = name.trim_end();
    if trimmed.ends_with(['.', ',', ';', ':']) {
        return true;
    }
    let chars: Vec<char> = trimmed.chars().collect();
    chars
        .windows(2)
        .any(|w| matches!(w[0], '.' | ',' | ';' | ':') && w[1].is_alphabetic())
}

/// Rank `(entity, relationship_count)` candidates by `(-score, name)`
pub fn rank_candidates(candidates: &[(Entity, i64)]) -> Vec<(&Entity, f64)> {
    let mut ranked: Vec<(&Entity, f64)> = candidates
        .iter()
        .map(|(entity, count)| (entity, canonical_score(entity, *count)))
        .collect();

    ranked.sort_by(|(a, score_a), (b, score_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// Pick the keeper of a cluster. Ids that no longer exist are ignored.
pub async fn choose_canonical(
    db: &Database,
    entity_type: EntityType,
    ids: &[i64],
) -> Result<(i64, String)> {
    let mut candidates = Vec::with_capacity(ids.len());
    {
        let mut conn = db.pool().acquire().await?;
        for &id in ids {
            if let Some(entity) = fetch_entity(&mut conn, entity_type, id).await? {
                let count = count_relationships(&mut conn, entity_type, id).await?;
                candidates.push((entity, count));
            }
        }
    }

    let ranked = rank_candidates(&candidates);
    for (entity, score) in &ranked {
        debug!(
            target: TARGET_DEDUP,
            "Keeper score for {} {} '{}': {:.1}", entity_type, entity.id, entity.name, score
        );
    }

    ranked
        .first()
        .map(|(entity, _)| (entity.id, entity.name.clone()))
        .ok_or(DedupError::EntityNotFound {
            entity_type,
            id: ids.first().copied().unwrap_or_default(),
        })
}
