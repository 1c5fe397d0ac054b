//! Examination State Machine
//!
//! Pure transitions from `(state, event)` to `(state, commands)`. The
//! [`Examination`](crate::examination::Examination) driver performs the calls
//! and feeds their outcomes back in as events.
//!
//! ```text
//! Opening ──► Continuing ──► … ──► Closing ──► ReportPending ──► Done
//!                 │  (floor met and stop, or cap hit)  ▲
//!                 └──────────── early finish ──────────┘
//! ```

use crate::{Command, policy::RoundPolicy};
use serde::Serialize;

/// Where the examination is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for the learner's initial explanation.
    Opening,
    /// A follow-up round is awaiting the learner's answer.
    Continuing,
    /// The terminal round is awaiting the learner's answer.
    Closing,
    /// The closing remark has been given; the report is next.
    ReportPending,
    Done,
}

/// The machine's full state. `completed_rounds` counts follow-up rounds only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineState {
    pub phase: Phase,
    pub completed_rounds: u32,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            phase: Phase::Opening,
            completed_rounds: 0,
        }
    }
}

impl MachineState {
    /// The 1-based index of the round awaiting an answer, if any. The
    /// closing round counts as a round.
    pub fn round_index(&self) -> Option<u32> {
        match self.phase {
            Phase::Continuing | Phase::Closing => Some(self.completed_rounds + 1),
            _ => None,
        }
    }

    pub fn awaiting_answer(&self) -> bool {
        matches!(self.phase, Phase::Continuing | Phase::Closing)
    }

    pub fn can_finish_early(&self, policy: &RoundPolicy) -> bool {
        self.phase == Phase::Continuing && self.completed_rounds >= policy.min_rounds
    }
}

/// Things that happen to the examination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The examiner's turn for the current phase is in the history, whether it
    /// came from the model or a scripted fallback.
    ExaminerSpoke { should_continue: bool },
    /// The learner asked to end the examination.
    FinishRequested,
    /// The report exists, generated or derived.
    ReportReady,
}

/// Whether the round after `completed_rounds` follow-ups must be terminal.
pub fn next_round_is_terminal(
    completed_rounds: u32,
    should_continue: bool,
    policy: &RoundPolicy,
) -> bool {
    completed_rounds >= policy.max_rounds
        || (completed_rounds >= policy.min_rounds && !should_continue)
}

/// Applies `event` to `state`. Events that make no sense in the current phase
/// leave the state untouched and produce no commands.
pub fn transition(
    state: MachineState,
    event: Event,
    policy: &RoundPolicy,
) -> (MachineState, Vec<Command>) {
    let next = match (state.phase, event) {
        (Phase::Opening, Event::ExaminerSpoke { .. }) => MachineState {
            phase: Phase::Continuing,
            completed_rounds: 0,
        },
        (Phase::Continuing, Event::ExaminerSpoke { should_continue }) => {
            let completed_rounds = state.completed_rounds + 1;
            let phase = if next_round_is_terminal(completed_rounds, should_continue, policy) {
                Phase::Closing
            } else {
                Phase::Continuing
            };
            MachineState {
                phase,
                completed_rounds,
            }
        }
        (Phase::Closing, Event::ExaminerSpoke { .. }) => {
            let next = MachineState {
                phase: Phase::ReportPending,
                completed_rounds: state.completed_rounds,
            };
            return (
                next,
                vec![
                    Command::PhaseChanged(Phase::ReportPending),
                    Command::BeginReport {
                        after: policy.report_delay,
                    },
                ],
            );
        }
        (Phase::Continuing, Event::FinishRequested) if state.can_finish_early(policy) => {
            let next = MachineState {
                phase: Phase::ReportPending,
                completed_rounds: state.completed_rounds,
            };
            return (
                next,
                vec![
                    Command::PhaseChanged(Phase::ReportPending),
                    Command::BeginReport {
                        after: std::time::Duration::ZERO,
                    },
                ],
            );
        }
        (Phase::ReportPending, Event::ReportReady) => MachineState {
            phase: Phase::Done,
            completed_rounds: state.completed_rounds,
        },
        _ => return (state, Vec::new()),
    };

    let commands = if next.phase != state.phase {
        vec![Command::PhaseChanged(next.phase)]
    } else {
        Vec::new()
    };
    (next, commands)
}
