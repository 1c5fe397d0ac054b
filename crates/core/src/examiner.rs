//! Examiner Call Contract
//!
//! The four conversational and reporting calls the examination makes against
//! the language model, plus an implementation over any OpenAI-compatible API.

use crate::{
    dialogue::{Assessment, DialogueTurn, ExamBrief, ExaminerReply, Mode, Report, Role},
    llm_client::{ChatMessage, LlmClient, ReplyParseError},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashMap;

/// Prompt keys the [`LlmExaminer`] expects in its template map.
pub const PROMPT_KEYS: [&str; 4] = ["opening", "follow_up", "closing", "report"];

/// Defines the contract for any service that can examine a learner.
///
/// Every method either returns a fully valid value or an error; a partially
/// parsed model reply is always an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Examiner: Send + Sync {
    /// First response to the learner's spoken explanation. There is no
    /// history yet.
    async fn opening(&self, brief: &ExamBrief, explanation: &str) -> Result<ExaminerReply>;

    /// Responds to the learner's answer and says whether to keep going.
    async fn follow_up(
        &self,
        brief: &ExamBrief,
        history: &[DialogueTurn],
        answer: &str,
    ) -> Result<ExaminerReply>;

    /// Delivers the final verdict. No question and no `should_continue`.
    async fn closing(
        &self,
        brief: &ExamBrief,
        history: &[DialogueTurn],
        answer: &str,
    ) -> Result<ExaminerReply>;

    /// Generates the end-of-session report across the full history.
    async fn report(&self, brief: &ExamBrief, history: &[DialogueTurn]) -> Result<Report>;
}

/// The model-facing shape of a conversational reply.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReplyWire {
    pub response: String,
    #[serde(default)]
    pub should_continue: Option<bool>,
    #[serde(default)]
    pub internal_assessment: Option<AssessmentWire>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AssessmentWire {
    pub mode: Mode,
    #[serde(default)]
    pub key_weakness_targeted: String,
    #[serde(default)]
    pub confidence_assessment: Option<f64>,
    #[serde(default)]
    pub what_they_nailed: Vec<String>,
}

impl TryFrom<ReplyWire> for ExaminerReply {
    type Error = ReplyParseError;

    fn try_from(wire: ReplyWire) -> Result<Self, Self::Error> {
        let response = wire.response.trim().to_string();
        if response.is_empty() {
            return Err(ReplyParseError::EmptyResponse);
        }
        let assessment = wire.internal_assessment.map(Assessment::try_from).transpose()?;
        Ok(Self {
            response,
            should_continue: wire.should_continue,
            assessment,
        })
    }
}

impl TryFrom<AssessmentWire> for Assessment {
    type Error = ReplyParseError;

    fn try_from(wire: AssessmentWire) -> Result<Self, Self::Error> {
        let confidence_score = wire
            .confidence_assessment
            .map(|score| {
                if (1.0..=10.0).contains(&score) {
                    Ok(score.round() as u8)
                } else {
                    Err(ReplyParseError::ConfidenceOutOfRange(score))
                }
            })
            .transpose()?;
        Ok(Self {
            mode: wire.mode,
            targeted_weakness: wire.key_weakness_targeted,
            confidence_score,
            strengths: wire.what_they_nailed,
        })
    }
}

/// Parses a raw model reply into an [`ExaminerReply`].
pub fn parse_reply(raw: &str) -> Result<ExaminerReply, ReplyParseError> {
    let json = crate::llm_client::extract_json(raw)?;
    let wire: ReplyWire = serde_json::from_str(&json)?;
    ExaminerReply::try_from(wire)
}

/// Parses a raw model reply into a [`Report`].
pub fn parse_report(raw: &str) -> Result<Report, ReplyParseError> {
    let json = crate::llm_client::extract_json(raw)?;
    let report: Report = serde_json::from_str(&json)?;
    if let Some(score) = report.confidence_after {
        if !(1..=10).contains(&score) {
            return Err(ReplyParseError::ConfidenceOutOfRange(f64::from(score)));
        }
    }
    Ok(report)
}

/// An implementation of [`Examiner`] that prompts an LLM.
pub struct LlmExaminer {
    client: LlmClient,
    prompts: HashMap<String, String>,
}

impl LlmExaminer {
    /// Creates a new LLM-backed examiner.
    ///
    /// `prompts` must contain a system prompt for every key in
    /// [`PROMPT_KEYS`]. Templates may use `{topic}`.
    pub fn new(client: LlmClient, prompts: HashMap<String, String>) -> Result<Self> {
        for key in PROMPT_KEYS {
            if !prompts.contains_key(key) {
                anyhow::bail!("Missing prompt template: '{}'", key);
            }
        }
        Ok(Self { client, prompts })
    }

    fn system_prompt(&self, key: &str, brief: &ExamBrief) -> Result<String> {
        let template = self
            .prompts
            .get(key)
            .with_context(|| format!("Missing prompt template: '{}'", key))?;
        let source = brief
            .source_text
            .as_deref()
            .unwrap_or("(No source material. Use your own knowledge of the topic.)");
        Ok(format!(
            "{}\n\n## Source Material\n{}",
            template.replace("{topic}", &brief.topic),
            source
        ))
    }

    async fn converse(
        &self,
        key: &str,
        brief: &ExamBrief,
        history: &[DialogueTurn],
        answer: &str,
    ) -> Result<ExaminerReply> {
        let system = self.system_prompt(key, brief)?;
        let mut messages = conversation_messages(brief, history);
        messages.push(ChatMessage::User(answer.to_string()));
        let raw = self
            .client
            .complete_raw::<ReplyWire>(key, &system, &messages, 1024)
            .await?;
        Ok(parse_reply(&raw)?)
    }
}

/// Maps the history onto alternating chat roles. The first learner turn is
/// framed with the brief so the model always sees the topic.
fn conversation_messages(brief: &ExamBrief, history: &[DialogueTurn]) -> Vec<ChatMessage> {
    history
        .iter()
        .enumerate()
        .map(|(i, turn)| match turn.role {
            Role::Learner if i == 0 => ChatMessage::User(opening_message(brief, &turn.text)),
            Role::Learner => ChatMessage::User(turn.text.clone()),
            Role::Examiner => ChatMessage::Assistant(turn.text.clone()),
        })
        .collect()
}

fn opening_message(brief: &ExamBrief, explanation: &str) -> String {
    format!(
        "## Topic\n{}\n\n## Student's Spoken Explanation\n{}\n\n## Self-Assessed Confidence: {}/10",
        brief.topic, explanation, brief.confidence_before
    )
}

#[async_trait]
impl Examiner for LlmExaminer {
    async fn opening(&self, brief: &ExamBrief, explanation: &str) -> Result<ExaminerReply> {
        let system = self.system_prompt("opening", brief)?;
        let messages = [ChatMessage::User(opening_message(brief, explanation))];
        let raw = self
            .client
            .complete_raw::<ReplyWire>("opening", &system, &messages, 1024)
            .await?;
        Ok(parse_reply(&raw)?)
    }

    async fn follow_up(
        &self,
        brief: &ExamBrief,
        history: &[DialogueTurn],
        answer: &str,
    ) -> Result<ExaminerReply> {
        self.converse("follow_up", brief, history, answer).await
    }

    async fn closing(
        &self,
        brief: &ExamBrief,
        history: &[DialogueTurn],
        answer: &str,
    ) -> Result<ExaminerReply> {
        let mut reply = self.converse("closing", brief, history, answer).await?;
        reply.should_continue = None;
        Ok(reply)
    }

    async fn report(&self, brief: &ExamBrief, history: &[DialogueTurn]) -> Result<Report> {
        let system = self.system_prompt("report", brief)?;
        let message = format!(
            "## Topic: {}\n## Student's initial confidence: {}/10\n\n## Full Transcript\n{}\n\nGenerate the report.",
            brief.topic,
            brief.confidence_before,
            crate::dialogue::render_transcript(history)
        );
        let raw = self
            .client
            .complete_raw::<Report>("report", &system, &[ChatMessage::User(message)], 1024)
            .await?;
        Ok(parse_report(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brief() -> ExamBrief {
        ExamBrief {
            topic: "Binary search".into(),
            source_text: None,
            confidence_before: 6,
        }
    }

    #[test]
    fn test_parse_follow_up_reply() {
        let raw = r#"```json
        {
          "response": "No. Define the invariant.",
          "should_continue": true,
          "internal_assessment": {
            "what_they_nailed": ["halving"],
            "key_weakness_targeted": "loop invariant",
            "mode": "gap_fix",
            "confidence_assessment": 4
          }
        }
        ```"#;

        let reply = parse_reply(raw).unwrap();
        assert_eq!(reply.response, "No. Define the invariant.");
        assert_eq!(reply.should_continue, Some(true));
        let assessment = reply.assessment.unwrap();
        assert_eq!(assessment.mode, Mode::GapFix);
        assert_eq!(assessment.targeted_weakness, "loop invariant");
        assert_eq!(assessment.confidence_score, Some(4));
        assert_eq!(assessment.strengths, vec!["halving"]);
    }

    #[test]
    fn test_parse_reply_without_assessment() {
        let reply = parse_reply(r#"{"response": "Be precise."}"#).unwrap();
        assert_eq!(reply.should_continue, None);
        assert!(reply.assessment.is_none());
    }

    #[test]
    fn test_parse_reply_rejects_partial_objects() {
        assert!(matches!(
            parse_reply(r#"{"response": "   "}"#),
            Err(ReplyParseError::EmptyResponse)
        ));
        assert!(matches!(
            parse_reply(r#"{"should_continue": true}"#),
            Err(ReplyParseError::Json(_))
        ));
        assert!(matches!(
            parse_reply(r#"{"response": "x", "internal_assessment": {"mode": "shouting"}}"#),
            Err(ReplyParseError::Json(_))
        ));
        assert!(matches!(
            parse_reply(
                r#"{"response": "x", "internal_assessment": {"mode": "level_up", "confidence_assessment": 12}}"#
            ),
            Err(ReplyParseError::ConfidenceOutOfRange(_))
        ));
    }

    #[test]
    fn test_parse_report() {
        let raw = r#"{
            "confidence_after": 6,
            "concepts_mastered": ["halving"],
            "remaining_gaps": ["invariants"],
            "key_correction": "The range shrinks every step.",
            "one_thing_to_remember": "lo <= target <= hi",
            "meta_learning_insight": "Reaches for analogies.",
            "next_session_seed": "Why does binary search need sorted input?",
            "mode": "socratic_probe"
        }"#;
        let report = parse_report(raw).unwrap();
        assert_eq!(report.confidence_after, Some(6));
        assert_eq!(report.mode, Some(Mode::SocraticProbe));
        assert!(parse_report(r#"{"concepts_mastered": []}"#).is_err());
    }

    #[test]
    fn test_conversation_messages_alternate_roles() {
        let history = vec![
            DialogueTurn::learner("It halves the range."),
            DialogueTurn::examiner("Which range?", None),
            DialogueTurn::learner("The search interval."),
            DialogueTurn::examiner("Define it.", None),
        ];
        let messages = conversation_messages(&brief(), &history);
        assert_eq!(messages.len(), 4);
        match &messages[0] {
            ChatMessage::User(text) => {
                assert!(text.contains("Binary search"));
                assert!(text.contains("It halves the range."));
                assert!(text.contains("6/10"));
            }
            other => panic!("expected framed opening, got {:?}", other),
        }
        assert_eq!(messages[1], ChatMessage::Assistant("Which range?".into()));
        assert_eq!(messages[2], ChatMessage::User("The search interval.".into()));
    }

    #[test]
    fn test_new_requires_every_prompt() {
        let config = async_openai::config::OpenAIConfig::new().with_api_key("test");
        let client = LlmClient::new(config, "gpt-4o".into());
        let mut prompts: HashMap<String, String> = PROMPT_KEYS
            .iter()
            .map(|k| (k.to_string(), format!("You examine {{topic}} ({})", k)))
            .collect();
        prompts.remove("closing");
        let err = LlmExaminer::new(client.clone(), prompts.clone()).err().unwrap();
        assert!(err.to_string().contains("closing"));

        prompts.insert("closing".into(), "Verdict on {topic}".into());
        let examiner = LlmExaminer::new(client, prompts).unwrap();
        let system = examiner.system_prompt("closing", &brief()).unwrap();
        assert!(system.starts_with("Verdict on Binary search"));
        assert!(system.contains("No source material"));
    }
}
