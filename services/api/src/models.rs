//! API and Database Models
//!
//! This module defines the data structures used both for database mapping
//! with `sqlx` and for generating OpenAPI documentation with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// How an examination ended.
#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(type_name = "session_outcome", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The examiner closed the examination.
    Completed,
    /// The learner ended it once the round floor was met.
    EndedEarly,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => write!(f, "completed"),
            SessionOutcome::EndedEarly => write!(f, "ended_early"),
        }
    }
}

/// A completed examination as stored.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone, PartialEq)]
pub struct SavedSession {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    /// The scoping key sessions are listed by.
    pub device_id: String,
    pub topic: String,
    pub source_text: Option<String>,
    pub confidence_before: i16,
    pub confidence_after: Option<i16>,
    /// Follow-up rounds completed, not counting the opening.
    pub rounds: i32,
    #[schema(value_type = String, example = "completed")]
    pub outcome: SessionOutcome,
    /// The dialogue history, learner and examiner turns in speaking order.
    #[schema(value_type = Object)]
    pub transcript: serde_json::Value,
    #[schema(value_type = Object)]
    pub report: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A completed examination to store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub device_id: String,
    pub topic: String,
    pub source_text: Option<String>,
    pub confidence_before: i16,
    pub confidence_after: Option<i16>,
    pub rounds: i32,
    pub outcome: SessionOutcome,
    pub transcript: serde_json::Value,
    pub report: serde_json::Value,
}

impl NewSession {
    /// The stored form of this record, with the given identity.
    pub fn into_saved(self, id: Uuid, created_at: DateTime<Utc>) -> SavedSession {
        SavedSession {
            id,
            device_id: self.device_id,
            topic: self.topic,
            source_text: self.source_text,
            confidence_before: self.confidence_before,
            confidence_after: self.confidence_after,
            rounds: self.rounds,
            outcome: self.outcome,
            transcript: self.transcript,
            report: self.report,
            created_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
