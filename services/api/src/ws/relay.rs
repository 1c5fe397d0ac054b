//! A [`TranscriptionSource`] fed by the browser.
//!
//! Speech recognition runs on the client, which forwards interim and final
//! text over the socket. The relay hands each update to whoever is listening.

use tracing::debug;
use viva_core::transcription::{TranscriptHandlers, TranscriptionSource};

pub struct RelayedTranscription {
    available: bool,
    handlers: Option<TranscriptHandlers>,
}

impl RelayedTranscription {
    /// `available` is the client's report of whether it can recognise speech.
    pub fn new(available: bool) -> Self {
        Self {
            available,
            handlers: None,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.handlers.is_some()
    }

    /// Delivers one update from the client.
    pub fn relay(&self, text: String, is_final: bool) {
        match &self.handlers {
            Some(handlers) if is_final => (handlers.on_final)(text),
            Some(handlers) => (handlers.on_interim)(text),
            None => debug!("Dropping transcript update; not listening"),
        }
    }

    /// Reports a recogniser failure and stops listening.
    pub fn fail(&mut self, reason: String) {
        if let Some(handlers) = self.handlers.take() {
            (handlers.on_error)(reason);
        }
    }
}

impl TranscriptionSource for RelayedTranscription {
    fn start_listening(&mut self, handlers: TranscriptHandlers) -> bool {
        if !self.available {
            return false;
        }
        self.handlers = Some(handlers);
        true
    }

    fn stop_listening(&mut self) {
        self.handlers = None;
    }
}
