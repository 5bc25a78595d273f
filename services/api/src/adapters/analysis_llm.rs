//! services/api/src/adapters/analysis_llm.rs
//!
//! This module contains the adapter for the CV-analysis LLM.
//! It implements the `LanguageModelService` port from the `core` crate.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use cv_pipeline_core::ports::{CompletionRequest, LanguageModelService, PortError, PortResult};
use tracing::debug;

/// An adapter that implements `LanguageModelService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiAnalysisAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiAnalysisAdapter {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

/// Sorts vendor failures into credential, quota and everything else.
fn classify(err: OpenAIError) -> PortError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("invalid_api_key")
        || lower.contains("incorrect api key")
        || lower.contains("401")
    {
        PortError::Unauthorized
    } else if lower.contains("insufficient_quota")
        || lower.contains("rate limit")
        || lower.contains("429")
    {
        PortError::QuotaExceeded(message)
    } else {
        PortError::Unexpected(message)
    }
}

#[async_trait]
impl LanguageModelService for OpenAiAnalysisAdapter {
    async fn complete(&self, request: &CompletionRequest) -> PortResult<String> {
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(request.system.as_str())
                    .build()
                    .map_err(|e| PortError::Unexpected(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(request.user.as_str())
                    .build()
                    .map_err(|e| PortError::Unexpected(e.to_string()))?,
            ),
        ];

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .max_tokens(request.max_tokens)
            .temperature(request.temperature)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(classify)?;

        if let Some(usage) = &response.usage {
            debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Analysis completion usage."
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                PortError::Unexpected("Analysis LLM response contained no text content.".to_string())
            })
    }
}
