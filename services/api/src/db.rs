//! Data Access Layer
//!
//! Completed examinations are appended to a record store and listed back by
//! device. [`PgSessionStore`] keeps them in PostgreSQL; [`EchoSessionStore`]
//! stands in when no database is configured so the examination never waits
//! on persistence.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{NewSession, SavedSession};

/// Maximum number of sessions returned by a listing.
pub const SESSION_LIST_LIMIT: i64 = 50;

/// The persistence contract for completed sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Appends a completed session and returns it as stored.
    async fn save_session(&self, record: NewSession) -> Result<SavedSession>;

    /// Sessions for `device_id`, newest first.
    async fn load_sessions(&self, device_id: &str) -> Result<Vec<SavedSession>>;

    /// A single session, scoped to `device_id`.
    async fn load_session(&self, id: Uuid, device_id: &str) -> Result<Option<SavedSession>>;
}

const SESSION_COLUMNS: &str = "id, device_id, topic, source_text, confidence_before, \
     confidence_after, rounds, outcome, transcript, report, created_at";

/// A `SessionStore` backed by a `PgPool`.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn save_session(&self, record: NewSession) -> Result<SavedSession> {
        let query = format!(
            r#"
            INSERT INTO exam_sessions
                (device_id, topic, source_text, confidence_before, confidence_after,
                 rounds, outcome, transcript, report)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, SavedSession>(&query)
            .bind(&record.device_id)
            .bind(&record.topic)
            .bind(&record.source_text)
            .bind(record.confidence_before)
            .bind(record.confidence_after)
            .bind(record.rounds)
            .bind(record.outcome)
            .bind(&record.transcript)
            .bind(&record.report)
            .fetch_one(&self.pool)
            .await?;
        Ok(session)
    }

    async fn load_sessions(&self, device_id: &str) -> Result<Vec<SavedSession>> {
        let query = format!(
            r#"
            SELECT {}
            FROM exam_sessions
            WHERE device_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, SavedSession>(&query)
            .bind(device_id)
            .bind(SESSION_LIST_LIMIT)
            .fetch_all(&self.pool)
            .await?;
        Ok(sessions)
    }

    async fn load_session(&self, id: Uuid, device_id: &str) -> Result<Option<SavedSession>> {
        let query = format!(
            r#"
            SELECT {}
            FROM exam_sessions
            WHERE id = $1 AND device_id = $2
            "#,
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, SavedSession>(&query)
            .bind(id)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }
}

/// The store used when no database is configured: saving echoes the record
/// back with a fresh id, loading finds nothing.
#[derive(Clone, Default)]
pub struct EchoSessionStore;

#[async_trait]
impl SessionStore for EchoSessionStore {
    async fn save_session(&self, record: NewSession) -> Result<SavedSession> {
        Ok(record.into_saved(Uuid::new_v4(), Utc::now()))
    }

    async fn load_sessions(&self, _device_id: &str) -> Result<Vec<SavedSession>> {
        Ok(Vec::new())
    }

    async fn load_session(&self, _id: Uuid, _device_id: &str) -> Result<Option<SavedSession>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionOutcome;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_store_degrades_gracefully() {
        let store = EchoSessionStore;
        let record = NewSession {
            device_id: "device-1".into(),
            topic: "Entropy".into(),
            source_text: Some("Disorder.".into()),
            confidence_before: 4,
            confidence_after: None,
            rounds: 3,
            outcome: SessionOutcome::EndedEarly,
            transcript: json!([]),
            report: json!({}),
        };

        let saved = store.save_session(record.clone()).await.unwrap();
        assert!(!saved.id.is_nil());
        assert_eq!(saved.topic, record.topic);
        assert_eq!(saved.outcome, SessionOutcome::EndedEarly);

        assert!(store.load_sessions("device-1").await.unwrap().is_empty());
        assert!(
            store
                .load_session(saved.id, "device-1")
                .await
                .unwrap()
                .is_none()
        );
    }
}
