//! Fixtures shared by the service's unit tests.

use crate::{
    config::{Config, Provider},
    db::SessionStore,
    models::{NewSession, SavedSession, SessionOutcome},
    state::AppState,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};
use uuid::Uuid;
use viva_core::{
    ExamPolicy,
    dialogue::{Assessment, DialogueTurn, ExamBrief, ExaminerReply, Mode, Report},
    examiner::Examiner,
    source::StaticSourceMaterialService,
};

/// Keeps saved sessions in memory.
#[derive(Default)]
pub struct MemoryStore {
    pub sessions: Mutex<Vec<SavedSession>>,
    fail: bool,
}

impl MemoryStore {
    /// A store whose every operation fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_session(&self, record: NewSession) -> Result<SavedSession> {
        if self.fail {
            anyhow::bail!("connection refused");
        }
        let saved = record.into_saved(Uuid::new_v4(), Utc::now());
        self.sessions.lock().unwrap().push(saved.clone());
        Ok(saved)
    }

    async fn load_sessions(&self, device_id: &str) -> Result<Vec<SavedSession>> {
        if self.fail {
            anyhow::bail!("connection refused");
        }
        let mut sessions: Vec<SavedSession> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn load_session(&self, id: Uuid, device_id: &str) -> Result<Option<SavedSession>> {
        if self.fail {
            anyhow::bail!("connection refused");
        }
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id && s.device_id == device_id)
            .cloned())
    }
}

/// Answers every call immediately. Follow-ups ask to stop, so the round floor
/// decides when closing starts.
pub struct StubExaminer;

fn assessed(mode: Mode, score: u8) -> Assessment {
    Assessment {
        mode,
        targeted_weakness: "edge cases".into(),
        confidence_score: Some(score),
        strengths: vec!["core idea".into()],
    }
}

#[async_trait]
impl Examiner for StubExaminer {
    async fn opening(&self, _brief: &ExamBrief, _explanation: &str) -> Result<ExaminerReply> {
        Ok(ExaminerReply {
            response: "What happens at the boundaries?".into(),
            should_continue: None,
            assessment: Some(assessed(Mode::GapFix, 4)),
        })
    }

    async fn follow_up(
        &self,
        _brief: &ExamBrief,
        history: &[DialogueTurn],
        _answer: &str,
    ) -> Result<ExaminerReply> {
        Ok(ExaminerReply {
            response: format!("Follow-up {}", history.len() / 2),
            should_continue: Some(false),
            assessment: Some(assessed(Mode::SocraticProbe, 6)),
        })
    }

    async fn closing(
        &self,
        _brief: &ExamBrief,
        _history: &[DialogueTurn],
        _answer: &str,
    ) -> Result<ExaminerReply> {
        Ok(ExaminerReply {
            response: "Good work today.".into(),
            should_continue: None,
            assessment: Some(assessed(Mode::LevelUp, 8)),
        })
    }

    async fn report(&self, _brief: &ExamBrief, _history: &[DialogueTurn]) -> Result<Report> {
        Ok(Report {
            confidence_after: Some(8),
            key_correction: "Check the empty range.".into(),
            ..Report::default()
        })
    }
}

pub fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        database_url: None,
        provider: Provider::OpenAI,
        openai_api_key: Some("test".into()),
        gemini_api_key: None,
        chat_model: "gpt-4o".into(),
        log_level: tracing::Level::INFO,
        prompts_path: PathBuf::from("./prompts"),
        generate_source: false,
        policy: ExamPolicy::default(),
    }
}

pub fn app_state(store: Arc<dyn SessionStore>) -> Arc<AppState> {
    Arc::new(AppState {
        store,
        examiner: Arc::new(StubExaminer),
        source_service: Arc::new(StaticSourceMaterialService),
        config: Arc::new(test_config()),
    })
}

pub fn saved_session(device_id: &str, topic: &str, age_minutes: i64) -> SavedSession {
    NewSession {
        device_id: device_id.into(),
        topic: topic.into(),
        source_text: None,
        confidence_before: 5,
        confidence_after: Some(7),
        rounds: 3,
        outcome: SessionOutcome::Completed,
        transcript: json!([]),
        report: json!({}),
    }
    .into_saved(Uuid::new_v4(), Utc::now() - Duration::minutes(age_minutes))
}
