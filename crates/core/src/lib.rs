pub mod dialogue;
pub mod error;
pub mod examination;
pub mod examiner;
pub mod llm_client;
pub mod machine;
pub mod policy;
pub mod precall;
pub mod source;
pub mod telemetry;
pub mod transcription;

pub use error::ExamError;
pub use policy::ExamPolicy;

use dialogue::{Mode, Report};
use machine::Phase;
use std::time::Duration;

/// Represents commands that the core logic issues to an external runtime.
///
/// This enum decouples the examination's decisions from the runtime's
/// execution of side effects (speaking text, timers, persisting a session).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Speak the examiner's turn to the learner.
    Speak(String),
    /// The examiner switched strategy.
    ModeChanged(Mode),
    PhaseChanged(Phase),
    /// Call [`Examination::finish_report`](examination::Examination::finish_report)
    /// once `after` has elapsed.
    BeginReport { after: Duration },
    /// The examination is over; hand the report to persistence.
    SessionComplete(Report),
}
