//! Executes the commands an examination returns.
//!
//! Client-facing commands become [`ServerMessage`]s; timing commands are
//! surfaced to the session loop, which owns the timers. A finished examination
//! is turned into a [`NewSession`] and stored.

use super::protocol::ServerMessage;
use crate::{
    db::SessionStore,
    models::{NewSession, SessionOutcome},
};
use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;
use viva_core::{
    Command,
    dialogue::{Report, Role},
    examination::Examination,
};

/// What a batch of commands asks of the session.
#[derive(Debug, Default)]
pub(super) struct Effects {
    pub messages: Vec<ServerMessage>,
    /// Generate the report once this delay has passed.
    pub report_after: Option<Duration>,
    /// The examination is over with this report.
    pub completed: Option<Report>,
}

/// Maps `commands`, just returned by `exam`, to their effects.
pub(super) fn translate(exam: &Examination, commands: Vec<Command>) -> Effects {
    let mut effects = Effects::default();
    for command in commands {
        match command {
            Command::Speak(text) => {
                let examiner_turns = exam
                    .history()
                    .iter()
                    .filter(|turn| turn.role == Role::Examiner);
                let turn = examiner_turns.clone().count();
                let assessment = examiner_turns.last().and_then(|t| t.assessment.clone());
                effects.messages.push(ServerMessage::ExaminerTurn {
                    text,
                    turn,
                    assessment,
                });
            }
            Command::ModeChanged(mode) => {
                effects.messages.push(ServerMessage::ModeChanged { mode });
            }
            Command::PhaseChanged(phase) => {
                effects.messages.push(ServerMessage::PhaseChanged {
                    phase,
                    completed_rounds: exam.state().completed_rounds,
                    can_finish: exam.can_finish_early(),
                });
            }
            Command::BeginReport { after } => effects.report_after = Some(after),
            Command::SessionComplete(report) => effects.completed = Some(report),
        }
    }
    effects
}

/// The stored form of a finished examination.
pub(super) fn session_record(
    device_id: &str,
    exam: &Examination,
    report: &Report,
    ended_early: bool,
) -> Result<NewSession> {
    let brief = exam.brief();
    Ok(NewSession {
        device_id: device_id.to_string(),
        topic: brief.topic.clone(),
        source_text: brief.source_text.clone(),
        confidence_before: i16::from(brief.confidence_before),
        confidence_after: report.confidence_after.map(i16::from),
        rounds: i32::try_from(exam.state().completed_rounds)?,
        outcome: if ended_early {
            SessionOutcome::EndedEarly
        } else {
            SessionOutcome::Completed
        },
        transcript: serde_json::to_value(exam.history())?,
        report: serde_json::to_value(report)?,
    })
}

/// Stores `record`. A storage failure is logged and never reaches the learner.
pub(super) async fn persist(store: &dyn SessionStore, record: NewSession) -> Option<Uuid> {
    match store.save_session(record).await {
        Ok(saved) => {
            info!(session_id = %saved.id, outcome = %saved.outcome, "Examination saved");
            Some(saved.id)
        }
        Err(e) => {
            warn!(error = ?e, "Failed to save examination; the report is still delivered");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStore, StubExaminer};
    use std::sync::Arc;
    use viva_core::{
        ExamPolicy,
        dialogue::{ExamBrief, Mode},
        machine::Phase,
        telemetry::EventBus,
    };

    fn exam() -> Examination {
        Examination::new(
            ExamBrief {
                topic: "Binary search".into(),
                source_text: Some("Halve the range each step.".into()),
                confidence_before: 5,
            },
            Arc::new(StubExaminer),
            ExamPolicy::default(),
            EventBus::new(),
        )
    }

    /// Answers typed rounds until the examination reaches `phase`.
    async fn answer_until(exam: &mut Examination, phase: Phase) -> Effects {
        let mut last = Effects::default();
        while exam.phase() != phase {
            let commands = exam.submit_typed("An answer").await.unwrap();
            last = translate(exam, commands);
        }
        last
    }

    #[tokio::test]
    async fn test_opening_becomes_examiner_turn() {
        let mut exam = exam();
        let commands = exam.open("It halves the search space.").await.unwrap();
        let effects = translate(&exam, commands);

        match &effects.messages[0] {
            ServerMessage::ExaminerTurn {
                text,
                turn,
                assessment,
            } => {
                assert_eq!(text, "What happens at the boundaries?");
                assert_eq!(*turn, 1);
                assert_eq!(assessment.as_ref().map(|a| a.mode), Some(Mode::GapFix));
            }
            other => panic!("expected an examiner turn, got {:?}", other),
        }
        assert!(effects.messages.iter().any(|m| matches!(
            m,
            ServerMessage::ModeChanged {
                mode: Mode::GapFix
            }
        )));
        assert!(effects.report_after.is_none());
        assert!(effects.completed.is_none());
    }

    #[tokio::test]
    async fn test_closing_schedules_report() {
        let mut exam = exam();
        exam.open("It halves the search space.").await.unwrap();
        answer_until(&mut exam, Phase::Closing).await;
        let effects = answer_until(&mut exam, Phase::ReportPending).await;

        assert_eq!(effects.report_after, Some(Duration::from_secs(2)));
        assert!(effects.messages.iter().any(|m| matches!(
            m,
            ServerMessage::PhaseChanged {
                phase: Phase::ReportPending,
                completed_rounds: 3,
                can_finish: false,
            }
        )));

        let commands = exam.finish_report().await.unwrap();
        let effects = translate(&exam, commands);
        assert_eq!(
            effects.completed.map(|r| r.key_correction),
            Some("Check the empty range.".to_string())
        );
    }

    #[tokio::test]
    async fn test_session_record() {
        let mut exam = exam();
        exam.open("It halves the search space.").await.unwrap();
        answer_until(&mut exam, Phase::Closing).await;
        assert!(exam.request_finish().is_err());
        answer_until(&mut exam, Phase::ReportPending).await;
        let commands = exam.finish_report().await.unwrap();
        let report = translate(&exam, commands).completed.unwrap();

        let record = session_record("device-1", &exam, &report, false).unwrap();
        assert_eq!(record.topic, "Binary search");
        assert_eq!(record.source_text.as_deref(), Some("Halve the range each step."));
        assert_eq!(record.confidence_before, 5);
        assert_eq!(record.confidence_after, Some(8));
        assert_eq!(record.rounds, 3);
        assert_eq!(record.outcome, SessionOutcome::Completed);
        assert_eq!(record.transcript.as_array().map(|t| t.len()), Some(10));
    }

    #[tokio::test]
    async fn test_persist_tolerates_storage_failure() {
        let mut exam = exam();
        exam.open("It halves the search space.").await.unwrap();
        let report = Report::default();

        let store = MemoryStore::default();
        let record = session_record("device-1", &exam, &report, true).unwrap();
        let id = persist(&store, record.clone()).await;
        assert!(id.is_some());
        assert_eq!(store.sessions.lock().unwrap()[0].outcome, SessionOutcome::EndedEarly);

        assert_eq!(persist(&MemoryStore::failing(), record).await, None);
    }
}
