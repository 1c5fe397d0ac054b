//! Dialogue Data Model
//!
//! The append-only conversation history of an examination and the
//! structured assessments the examiner attaches to its own turns.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who spoke a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Examiner,
    Learner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Examiner => write!(f, "examiner"),
            Role::Learner => write!(f, "learner"),
        }
    }
}

/// The examiner's current strategy for the learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Major errors or blind spots detected.
    GapFix,
    /// Mostly correct, but fuzzy areas need sharpening.
    #[default]
    SocraticProbe,
    /// Strong understanding; push to harder, adjacent concepts.
    LevelUp,
    /// The learner contradicts the reference material.
    ConflictResolution,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Mode::GapFix => "gap_fix",
            Mode::SocraticProbe => "socratic_probe",
            Mode::LevelUp => "level_up",
            Mode::ConflictResolution => "conflict_resolution",
        };
        f.write_str(label)
    }
}

/// The examiner's internal judgement of a learner turn.
///
/// Produced only by an examiner call and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub mode: Mode,
    pub targeted_weakness: String,
    /// Assessed understanding on a 1..=10 scale, when the variant scores it.
    pub confidence_score: Option<u8>,
    pub strengths: Vec<String>,
}

/// One entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<Assessment>,
}

impl DialogueTurn {
    pub fn learner(text: impl Into<String>) -> Self {
        Self {
            role: Role::Learner,
            text: text.into(),
            assessment: None,
        }
    }

    pub fn examiner(text: impl Into<String>, assessment: Option<Assessment>) -> Self {
        Self {
            role: Role::Examiner,
            text: text.into(),
            assessment,
        }
    }
}

/// The result of any conversational examiner call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExaminerReply {
    pub response: String,
    /// Only the follow-up variant reports this; `None` reads as "stop".
    pub should_continue: Option<bool>,
    pub assessment: Option<Assessment>,
}

impl ExaminerReply {
    /// A scripted reply used in place of a failed call.
    pub fn scripted(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            should_continue: None,
            assessment: None,
        }
    }
}

/// What the examination is about. Passed to every examiner call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamBrief {
    pub topic: String,
    pub source_text: Option<String>,
    /// The learner's self-rated confidence before the exam, 1..=10.
    pub confidence_before: u8,
}

/// The end-of-session feedback report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Report {
    pub confidence_after: Option<u8>,
    pub concepts_mastered: Vec<String>,
    pub remaining_gaps: Vec<String>,
    pub key_correction: String,
    pub one_thing_to_remember: String,
    pub meta_learning_insight: String,
    pub next_session_seed: String,
    pub mode: Option<Mode>,
}

impl Report {
    /// Builds a report from the assessments already collected, for when the
    /// report call itself fails.
    pub fn from_trajectory(history: &[DialogueTurn]) -> Self {
        let assessments: Vec<&Assessment> = assessments(history).collect();

        let mut concepts_mastered: Vec<String> = Vec::new();
        let mut remaining_gaps: Vec<String> = Vec::new();
        for assessment in &assessments {
            for strength in &assessment.strengths {
                if !concepts_mastered.contains(strength) {
                    concepts_mastered.push(strength.clone());
                }
            }
            let weakness = assessment.targeted_weakness.trim();
            if !weakness.is_empty() && !remaining_gaps.iter().any(|g| g == weakness) {
                remaining_gaps.push(weakness.to_string());
            }
        }

        let key_correction = remaining_gaps.last().cloned().unwrap_or_default();
        Self {
            confidence_after: assessments.iter().rev().find_map(|a| a.confidence_score),
            concepts_mastered,
            remaining_gaps,
            key_correction,
            one_thing_to_remember: String::new(),
            meta_learning_insight: String::new(),
            next_session_seed: String::new(),
            mode: assessments.last().map(|a| a.mode),
        }
    }
}

/// Iterates the assessments attached to examiner turns, in speaking order.
pub fn assessments(history: &[DialogueTurn]) -> impl Iterator<Item = &Assessment> {
    history
        .iter()
        .filter(|t| t.role == Role::Examiner)
        .filter_map(|t| t.assessment.as_ref())
}

/// Confidence scores by examiner turn, as `(turn_number, score)` pairs
/// starting at 1. Turns without a score are skipped but still counted.
pub fn confidence_trajectory(history: &[DialogueTurn]) -> Vec<(usize, u8)> {
    history
        .iter()
        .filter(|t| t.role == Role::Examiner)
        .enumerate()
        .filter_map(|(i, t)| {
            t.assessment
                .as_ref()
                .and_then(|a| a.confidence_score)
                .map(|score| (i + 1, score))
        })
        .collect()
}

/// The history rendered as a plain transcript, one speaker per paragraph.
pub fn render_transcript(history: &[DialogueTurn]) -> String {
    history
        .iter()
        .map(|t| match t.role {
            Role::Learner => format!("Student: {}", t.text),
            Role::Examiner => format!("Examiner: {}", t.text),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
