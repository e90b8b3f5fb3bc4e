//! Verification oracles: pluggable judges that confirm or reject a
//! candidate duplicate pair.
//!
//! The engine never decides duplication itself. It assembles a
//! [`VerificationContext`] for each side of a pair and asks an injected
//! [`VerificationOracle`]. Implementations shipped here:
//! - [`LlmOracle`]: asks an LLM (Ollama or OpenAI) for a JSON verdict
//! - [`HeuristicOracle`]: offline rules over names and embeddings

pub mod heuristic;
pub mod llm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::entity::{Entity, EntityType};
use crate::error::Result;

pub use heuristic::HeuristicOracle;
pub use llm::LlmOracle;

/// What an oracle gets to see about one side of a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationContext {
    pub entity: Entity,
    pub relationship_count: i64,
    pub related_documents: Vec<String>,
}

impl VerificationContext {
    pub async fn load(
        db: &Database,
        entity: Entity,
        related_documents_limit: usize,
    ) -> Result<Self> {
        let relationship_count = db.relationship_count(entity.entity_type, entity.id).await?;
        let related_documents = db
            .get_related_document_titles(entity.entity_type, entity.id, related_documents_limit)
            .await?;
        Ok(Self {
            entity,
            relationship_count,
            related_documents,
        })
    }

    pub fn id(&self) -> i64 {
        self.entity.id
    }
}

/// An oracle's judgment on one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub is_duplicate: bool,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_name_hint: Option<String>,
}

impl OracleVerdict {
    pub fn duplicate(explanation: impl Into<String>) -> Self {
        Self {
            is_duplicate: true,
            explanation: explanation.into(),
            canonical_name_hint: None,
        }
    }

    pub fn distinct(explanation: impl Into<String>) -> Self {
        Self {
            is_duplicate: false,
            explanation: explanation.into(),
            canonical_name_hint: None,
        }
    }

    pub fn with_canonical_name(mut self, name: impl Into<String>) -> Self {
        self.canonical_name_hint = Some(name.into());
        self
    }
}

#[async_trait]
pub trait VerificationOracle: Send + Sync {
    /// Short backend name for logs and reports
    fn name(&self) -> &str;

    /// Judge whether `a` and `b` refer to the same real-world thing.
    ///
    /// An `Err` is treated by the engine as "not a duplicate".
    async fn verify(
        &self,
        entity_type: EntityType,
        a: &VerificationContext,
        b: &VerificationContext,
    ) -> Result<OracleVerdict>;
}
