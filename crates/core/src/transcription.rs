//! Transcription Source Contract
//!
//! Speech-to-text is external. A source pushes interim and final text through
//! registered handlers; [`LiveTranscript`] collects it into a snapshot the
//! pre-caller can poll.

use crate::precall::TextSource;
use std::sync::{Arc, Mutex, PoisonError};

/// Callback invoked with the transcript text so far.
pub type TextHandler = Box<dyn Fn(String) + Send + Sync>;

/// Callback invoked with a human-readable failure reason.
pub type ErrorHandler = Box<dyn Fn(String) + Send + Sync>;

/// The handlers a consumer registers with a [`TranscriptionSource`].
pub struct TranscriptHandlers {
    /// Fires many times with growing prefixes of the utterance.
    pub on_interim: TextHandler,
    /// Fires once per utterance boundary with everything recognised so far.
    pub on_final: TextHandler,
    pub on_error: ErrorHandler,
}

/// A streaming speech-to-text provider.
pub trait TranscriptionSource: Send {
    /// Begins delivering text to `handlers`. Returns `false` when
    /// transcription is unsupported or unavailable; the learner must then
    /// type their answer.
    fn start_listening(&mut self, handlers: TranscriptHandlers) -> bool;

    /// Stops delivery. Safe to call when not listening.
    fn stop_listening(&mut self);
}

#[derive(Default)]
struct TranscriptBuffer {
    text: String,
    last_error: Option<String>,
}

/// Accumulates the latest transcript of the current recording segment.
#[derive(Clone, Default)]
pub struct LiveTranscript {
    inner: Arc<Mutex<TranscriptBuffer>>,
}

impl LiveTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers that write into this transcript. Interim and final callbacks
    /// both carry the full text so far, so each simply replaces the snapshot.
    pub fn handlers(&self) -> TranscriptHandlers {
        let interim = self.clone();
        let fin = self.clone();
        let errors = self.clone();
        TranscriptHandlers {
            on_interim: Box::new(move |text| interim.replace(text)),
            on_final: Box::new(move |text| fin.replace(text)),
            on_error: Box::new(move |reason| {
                errors
                    .inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .last_error = Some(reason);
            }),
        }
    }

    /// A pull accessor suitable for the pre-caller.
    pub fn text_source(&self) -> TextSource {
        let this = self.clone();
        Arc::new(move || this.snapshot())
    }

    pub fn snapshot(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .text
            .clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }

    pub fn clear(&self) {
        let mut buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.text.clear();
        buffer.last_error = None;
    }

    fn replace(&self, text: String) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .text = text;
    }
}
