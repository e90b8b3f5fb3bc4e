use async_openai::types::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs};
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::options::GenerationOptions;
use tracing::debug;

use crate::error::{DedupError, Result};
use crate::{LLMClient, LLMParams, TARGET_LLM_REQUEST};

/// Send one prompt to the configured LLM and return the raw text answer.
///
/// Timeouts and retries belong to the caller.
pub async fn generate_llm_response(prompt: &str, params: &LLMParams) -> Result<String> {
    debug!(target: TARGET_LLM_REQUEST, "Sending LLM request to model {}: {}", params.model, prompt);

    let response_text = match &params.llm_client {
        LLMClient::Ollama(ollama) => {
            let mut request = GenerationRequest::new(params.model.clone(), prompt.to_string());
            request.options = Some(GenerationOptions::default().temperature(params.temperature));

            ollama
                .generate(request)
                .await
                .map_err(|e| DedupError::Oracle(format!("Ollama request failed: {}", e)))?
                .response
        }
        LLMClient::OpenAI(client) => {
            let message = ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|e| DedupError::Oracle(format!("Invalid OpenAI message: {}", e)))?;
            let request = CreateChatCompletionRequestArgs::default()
                .model(params.model.clone())
                .temperature(params.temperature)
                .messages([message.into()])
                .build()
                .map_err(|e| DedupError::Oracle(format!("Invalid OpenAI request: {}", e)))?;

            let response = client
                .chat()
                .create(request)
                .await
                .map_err(|e| DedupError::Oracle(format!("OpenAI request failed: {}", e)))?;

            response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .unwrap_or_default()
        }
    };

    if response_text.trim().is_empty() {
        return Err(DedupError::Oracle("LLM returned an empty response".to_string()));
    }

    debug!(target: TARGET_LLM_REQUEST, "LLM response received: {}", response_text);
    Ok(response_text)
}
