//! Diagnostics Event Bus
//!
//! Typed pub/sub for an operator-facing live view of the scheduler. Publishing
//! with no subscriber drops the event before it is allocated into the channel,
//! so an unobserved bus costs one atomic load per event.

use crate::{dialogue::Mode, machine::Phase};
use serde::Serialize;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 100;

/// Which examiner call an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallVariant {
    Opening,
    FollowUp,
    Closing,
    Report,
}

/// Events emitted by the pre-caller, the settlement resolver and the
/// examination driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExamEvent {
    /// A background call was fired.
    CallStarted {
        variant: CallVariant,
        call_number: u64,
        text_len: usize,
    },
    /// A background call returned.
    CallCompleted {
        variant: CallVariant,
        call_number: u64,
        text_len: usize,
        elapsed_ms: u64,
        /// False when a fresher result was already cached.
        accepted: bool,
    },
    /// A background call failed and was ignored.
    CallFailed {
        variant: CallVariant,
        call_number: u64,
        reason: String,
    },
    /// Settlement returned the cached result.
    CacheHit { cached_len: usize, final_len: usize },
    /// Settlement awaited the in-flight call.
    JoinedPending { cached_len: usize, final_len: usize },
    /// Settlement issued a fresh call with the final text.
    FreshCall { variant: CallVariant, final_len: usize },
    /// A non-speculative call (opening or report) finished.
    DirectCall {
        variant: CallVariant,
        elapsed_ms: u64,
        ok: bool,
    },
    ModeChanged { from: Mode, to: Mode },
    PhaseChanged { phase: Phase },
}

/// Clonable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExamEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes lazily; `make` only runs when someone is listening.
    pub fn publish_with(&self, make: impl FnOnce() -> ExamEvent) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let _ = self.tx.send(make());
    }

    pub fn publish(&self, event: ExamEvent) {
        self.publish_with(|| event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExamEvent> {
        self.tx.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}
