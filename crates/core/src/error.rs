use crate::machine::Phase;
use thiserror::Error;

/// Errors returned when an [`Examination`](crate::examination::Examination)
/// operation is not valid in its current state.
///
/// Examiner failures are never surfaced through this type; the examination
/// substitutes a scripted turn and moves on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExamError {
    #[error("Operation is not valid in the {0:?} phase")]
    WrongPhase(Phase),
    #[error("The examination can end after {required} rounds, only {completed} completed")]
    TooEarlyToFinish { completed: u32, required: u32 },
    #[error("The answer is empty")]
    EmptyAnswer,
}
