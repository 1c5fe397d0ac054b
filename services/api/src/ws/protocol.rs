//! Defines the WebSocket message protocol between the browser client and the API server.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use viva_core::{
    dialogue::{Assessment, Mode, Report},
    machine::Phase,
    telemetry::ExamEvent,
};

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts an examination. This must be the first message.
    Init {
        topic: String,
        /// Material to examine against. Generated when absent.
        #[serde(default)]
        source_text: Option<String>,
        /// Self-rated confidence before the examination, 1 to 10.
        confidence_before: u8,
        /// Scoping key for the stored session.
        device_id: String,
    },
    /// The learner's initial explanation of the topic.
    Explanation { text: String },
    /// The learner started speaking an answer.
    StartRecording {
        /// Whether the client has a working speech recogniser.
        #[serde(default = "default_true")]
        stt_available: bool,
    },
    /// Live output of the client's speech recogniser. `text` is everything
    /// recognised so far in this recording.
    Transcript {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    /// The speech recogniser failed mid-recording.
    SttError { reason: String },
    /// The learner stopped speaking.
    StopRecording,
    /// An answer typed instead of spoken.
    TypedAnswer { text: String },
    /// The learner asks to end the examination early.
    EndExamination,
    /// Subscribes to or unsubscribes from scheduler diagnostics.
    SetDiagnostics { enabled: bool },
}

fn default_true() -> bool {
    true
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the examination is ready for the opening explanation.
    Initialized {
        topic: String,
        has_source_text: bool,
        min_rounds: u32,
        max_rounds: u32,
        max_speaking_secs: u64,
    },
    /// Something the examiner says, to be shown and spoken.
    ExaminerTurn {
        text: String,
        /// 1 for the opening response, counting up.
        turn: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        assessment: Option<Assessment>,
    },
    ModeChanged { mode: Mode },
    PhaseChanged {
        phase: Phase,
        completed_rounds: u32,
        /// Whether `end_examination` is currently accepted.
        can_finish: bool,
    },
    /// Speech recognition cannot be used; the learner should type.
    TranscriptionUnavailable { reason: String },
    /// Recording ended, by the learner or the speaking time limit.
    RecordingStopped { forced: bool, transcript: String },
    /// The end-of-session report.
    Report {
        report: Report,
        confidence_before: u8,
        trajectory: Vec<(usize, u8)>,
        /// Absent when the session could not be stored.
        session_id: Option<Uuid>,
    },
    /// A scheduler event, sent only while diagnostics are enabled.
    Diagnostic { event: ExamEvent },
    /// A request was rejected or failed.
    Error { message: String },
}
