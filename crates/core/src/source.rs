//! Reference Material Service
//!
//! When the learner brings no source text, the examination can still be held
//! against reference material generated for the topic.

use crate::llm_client::{ChatMessage, LlmClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ground truth the examiner compares the learner against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SourceMaterial {
    pub source_title: String,
    pub source_text: String,
}

/// Defines the contract for any service that can produce reference material.
///
/// This abstraction allows the system to swap between an LLM-backed
/// generator and a static one for development and tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceMaterialService: Send + Sync {
    /// Produces a summary of key concepts, definitions and common
    /// misconceptions for `topic`.
    async fn generate(&self, topic: &str) -> Result<SourceMaterial>;
}

/// An implementation of `SourceMaterialService` that uses an LLM.
pub struct LlmSourceMaterialService {
    client: LlmClient,
    prompts: HashMap<String, String>,
}

impl LlmSourceMaterialService {
    /// `prompts` must include a key for `"source_material"`; the template may
    /// use `{topic}`.
    pub fn new(client: LlmClient, prompts: HashMap<String, String>) -> Self {
        Self { client, prompts }
    }
}

#[async_trait]
impl SourceMaterialService for LlmSourceMaterialService {
    async fn generate(&self, topic: &str) -> Result<SourceMaterial> {
        let template = self
            .prompts
            .get("source_material")
            .context("Missing prompt template: 'source_material'")?;
        let system = template.replace("{topic}", topic);
        let message = ChatMessage::User(format!(
            "Generate comprehensive reference material for: {}",
            topic
        ));

        let material: SourceMaterial = self
            .client
            .complete_json("source_material", &system, &[message], 2048)
            .await?;
        if material.source_text.trim().is_empty() {
            anyhow::bail!("Reference material for '{}' was empty", topic);
        }
        Ok(material)
    }
}

/// A deterministic `SourceMaterialService` for development and tests.
pub struct StaticSourceMaterialService;

#[async_trait]
impl SourceMaterialService for StaticSourceMaterialService {
    async fn generate(&self, topic: &str) -> Result<SourceMaterial> {
        Ok(SourceMaterial {
            source_title: format!("Notes on {}", topic),
            source_text: format!(
                "{} has a precise definition, a mechanism that explains how it works, \
                 and concrete examples that show it in use.",
                topic
            ),
        })
    }
}

/// Fills in `brief.source_text` from `service` when the learner supplied none.
/// Failure leaves the brief without a source.
pub async fn ensure_source(
    service: &dyn SourceMaterialService,
    brief: &mut crate::dialogue::ExamBrief,
) {
    if brief
        .source_text
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty())
    {
        return;
    }
    match service.generate(&brief.topic).await {
        Ok(material) => {
            tracing::info!(title = %material.source_title, "Generated reference material");
            brief.source_text = Some(material.source_text);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Reference material unavailable; examining without a source");
            brief.source_text = None;
        }
    }
}
