//! OpenAI-compatible chat client that returns typed JSON.

use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use std::time::Instant;
use tracing::{debug, info};

/// Reasons a model reply is rejected before reaching the examination.
#[derive(Debug, thiserror::Error)]
pub enum ReplyParseError {
    #[error("model reply contained no text")]
    Empty,
    #[error("model reply was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model reply had an empty `response` field")]
    EmptyResponse,
    #[error("confidence score {0} is outside 1..=10")]
    ConfidenceOutOfRange(f64),
}

/// A single chat message, independent of the provider's request types.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    User(String),
    Assistant(String),
}

/// Strips markdown code fences and surrounding whitespace from a model reply.
pub fn extract_json(text: &str) -> Result<String, ReplyParseError> {
    let cleaned = text.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(ReplyParseError::Empty);
    }
    Ok(cleaned.to_string())
}

/// A thin wrapper over an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct LlmClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl LlmClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    /// Sends one non-streaming completion constrained to the JSON schema of `T`
    /// and returns the raw text of the first choice.
    pub async fn complete_raw<T: JsonSchema>(
        &self,
        label: &str,
        system_prompt: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String> {
        let mut request_messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt)
                .build()?
                .into(),
        ];
        for message in messages {
            match message {
                ChatMessage::User(text) => request_messages.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(text.as_str())
                        .build()?
                        .into(),
                ),
                ChatMessage::Assistant(text) => request_messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(text.as_str())
                        .build()?
                        .into(),
                ),
            }
        }

        let schema = serde_json::to_value(schemars::schema_for!(T))?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(request_messages)
            .max_completion_tokens(max_tokens)
            .response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: label.to_string(),
                    schema: Some(schema),
                    strict: Some(false),
                },
            })
            .build()?;

        debug!(label, messages = messages.len(), "Calling model");
        let start = Instant::now();
        let response = self.client.chat().create(request).await?;
        info!(
            label,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model call complete"
        );

        let content = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .clone()
            .context("No content in LLM response")?;
        Ok(content)
    }

    /// Like [`complete_raw`](Self::complete_raw), then decodes the reply as `T`.
    pub async fn complete_json<T: JsonSchema + DeserializeOwned>(
        &self,
        label: &str,
        system_prompt: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<T> {
        let raw = self
            .complete_raw::<T>(label, system_prompt, messages, max_tokens)
            .await?;
        let json = extract_json(&raw)?;
        let value = serde_json::from_str(&json).map_err(ReplyParseError::from)?;
        Ok(value)
    }
}
