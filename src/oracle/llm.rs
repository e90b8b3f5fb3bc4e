use async_trait::async_trait;
use tracing::debug;

use super::{OracleVerdict, VerificationContext, VerificationOracle};
use crate::entity::EntityType;
use crate::error::Result;
use crate::llm::generate_llm_response;
use crate::prompt::{duplicate_verification_prompt, parse_verification_response};
use crate::{LLMParams, TARGET_LLM_REQUEST};

/// Oracle backed by an LLM judge
#[derive(Clone, Debug)]
pub struct LlmOracle {
    params: LLMParams,
}

impl LlmOracle {
    pub fn new(params: LLMParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl VerificationOracle for LlmOracle {
    fn name(&self) -> &str {
        "llm"
    }

    async fn verify(
        &self,
        entity_type: EntityType,
        a: &VerificationContext,
        b: &VerificationContext,
    ) -> Result<OracleVerdict> {
        let prompt = duplicate_verification_prompt(entity_type, a, b);
        let response = generate_llm_response(&prompt, &self.params).await?;
        let verdict = parse_verification_response(&response)?;

        debug!(
            target: TARGET_LLM_REQUEST,
            "{} {} vs {}: duplicate={} ({})",
            entity_type,
            a.id(),
            b.id(),
            verdict.is_duplicate,
            verdict.explanation
        );
        Ok(verdict)
    }
}
