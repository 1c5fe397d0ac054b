//! Manages the WebSocket connection lifecycle for one examination.

use super::{
    cycle,
    protocol::{ClientMessage, ServerMessage},
    relay::RelayedTranscription,
};
use crate::{db::SessionStore, state::AppState};
use anyhow::{Result, anyhow, ensure};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{pin::Pin, sync::Arc};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{self, Sleep},
};
use tracing::{Instrument, debug, error, info, instrument, warn};
use viva_core::{
    Command, ExamError,
    dialogue::{ExamBrief, Report},
    examination::Examination,
    source::ensure_source,
    telemetry::{EventBus, ExamEvent},
    transcription::{LiveTranscript, TranscriptionSource},
};

const TRANSCRIPTION_UNAVAILABLE: &str =
    "Speech recognition is not available. Please type your answer instead.";

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// A validated `init` message.
#[derive(Debug, PartialEq)]
struct SessionInit {
    brief: ExamBrief,
    device_id: String,
}

/// Main handler for an individual WebSocket connection.
///
/// Performs the `init` handshake, resolves the reference material and then
/// spawns the examination loop.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let temp_id: u32 = rand::random();
    tracing::Span::current().record("session_id", temp_id.to_string());
    info!("New WebSocket connection. Awaiting initialization...");

    let (mut socket_tx, mut socket_rx) = socket.split();

    // The first message from the client must be an `init` message.
    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_init(&text),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let SessionInit {
        mut brief,
        device_id,
    } = match init {
        Ok(init) => init,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    ensure_source(state.source_service.as_ref(), &mut brief).await;
    let policy = state.config.policy.clone();
    let initialized = ServerMessage::Initialized {
        topic: brief.topic.clone(),
        has_source_text: brief.source_text.is_some(),
        min_rounds: policy.rounds.min_rounds,
        max_rounds: policy.rounds.max_rounds,
        max_speaking_secs: policy.rounds.max_speaking.as_secs(),
    };
    if send_msg(&mut socket_tx, initialized).await.is_err() {
        error!("Failed to send Initialized message to client.");
        return;
    }

    let session_span = tracing::info_span!("exam_runtime", session_id = temp_id, topic = %brief.topic);
    let events = EventBus::new();
    let exam = Examination::new(brief, Arc::clone(&state.examiner), policy, events.clone());
    let mut session = ExamSession::new(exam, events, socket_tx, Arc::clone(&state.store), device_id);

    // Spawn the examination loop in a separate, instrumented task.
    tokio::spawn(
        async move {
            if let Err(e) = session.run(socket_rx).await {
                error!(error = ?e, "Examination session terminated with error.");
            }
            info!("Examination session finished.");
        }
        .instrument(session_span),
    );
}

/// Parses and validates the `init` message.
fn parse_init(init_text: &str) -> Result<SessionInit> {
    let init_msg: ClientMessage = serde_json::from_str(init_text)?;
    let ClientMessage::Init {
        topic,
        source_text,
        confidence_before,
        device_id,
    } = init_msg
    else {
        return Err(anyhow!("First message must be `init`"));
    };

    let topic = topic.trim().to_string();
    ensure!(!topic.is_empty(), "`topic` must not be empty");
    ensure!(
        (1..=10).contains(&confidence_before),
        "`confidence_before` must be between 1 and 10"
    );
    ensure!(!device_id.trim().is_empty(), "`device_id` is required");

    Ok(SessionInit {
        brief: ExamBrief {
            topic,
            source_text: source_text.filter(|s| !s.trim().is_empty()),
            confidence_before,
        },
        device_id,
    })
}

/// Everything one connection owns while its examination runs. `S` is the
/// outgoing half of the socket.
struct ExamSession<S> {
    exam: Examination,
    events: EventBus,
    socket_tx: S,
    store: Arc<dyn SessionStore>,
    device_id: String,
    /// Present while the client's recogniser is feeding a recording.
    relay: Option<RelayedTranscription>,
    live: LiveTranscript,
    speaking_deadline: Option<Pin<Box<Sleep>>>,
    report_timer: Option<Pin<Box<Sleep>>>,
    diagnostics: Option<broadcast::Receiver<ExamEvent>>,
    ended_early: bool,
    finished: bool,
}

/// Completes when `timer` fires, and clears it. Pends forever when unset.
async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => {
            sleep.as_mut().await;
            *timer = None;
        }
        None => std::future::pending().await,
    }
}

/// The next diagnostic event. Pends forever when diagnostics are off.
async fn next_event(diagnostics: &mut Option<broadcast::Receiver<ExamEvent>>) -> ExamEvent {
    let Some(rx) = diagnostics.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return event,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Diagnostics subscriber lagged."),
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}

impl<S> ExamSession<S>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    fn new(
        exam: Examination,
        events: EventBus,
        socket_tx: S,
        store: Arc<dyn SessionStore>,
        device_id: String,
    ) -> Self {
        Self {
            exam,
            events,
            socket_tx,
            store,
            device_id,
            relay: None,
            live: LiveTranscript::new(),
            speaking_deadline: None,
            report_timer: None,
            diagnostics: None,
            ended_early: false,
            finished: false,
        }
    }

    /// The main event loop for an active examination.
    ///
    /// Listens for client messages, the speaking time limit, the report delay and,
    /// when enabled, scheduler diagnostics. Ends once the report is delivered or
    /// the client goes away.
    async fn run<R, E>(&mut self, mut socket_rx: R) -> Result<()>
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: std::fmt::Debug,
    {
        loop {
            tokio::select! {
                msg = socket_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(msg) => self.handle_client(msg).await?,
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed client message.");
                            self.send(ServerMessage::Error { message: format!("Malformed message: {}", e) }).await?;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed the connection.");
                        break;
                    }
                    Some(Ok(_)) => debug!("Ignoring non-text frame."),
                    Some(Err(e)) => {
                        error!("Error receiving from client WebSocket: {:?}", e);
                        break;
                    }
                },
                _ = expire(&mut self.speaking_deadline) => {
                    info!("Speaking time limit reached; stopping the recording.");
                    self.settle(true).await?;
                },
                _ = expire(&mut self.report_timer) => self.generate_report().await?,
                event = next_event(&mut self.diagnostics) => {
                    self.send(ServerMessage::Diagnostic { event }).await?;
                },
            }
            if self.finished {
                break;
            }
        }

        if let Some(mut relay) = self.relay.take() {
            relay.stop_listening();
        }
        self.exam.cancel_recording();
        Ok(())
    }

    async fn handle_client(&mut self, msg: ClientMessage) -> Result<()> {
        match msg {
            ClientMessage::Init { .. } => {
                warn!("Ignoring repeated init message.");
                self.send(ServerMessage::Error {
                    message: "The examination is already initialized".into(),
                })
                .await
            }
            ClientMessage::Explanation { text } => {
                let result = self.exam.open(&text).await;
                self.execute(result).await
            }
            ClientMessage::StartRecording { stt_available } => {
                self.start_recording(stt_available).await
            }
            ClientMessage::Transcript { text, is_final } => {
                match &self.relay {
                    Some(relay) => relay.relay(text, is_final),
                    None => debug!("Transcript received outside a recording."),
                }
                Ok(())
            }
            ClientMessage::SttError { reason } => self.transcription_failed(reason).await,
            ClientMessage::StopRecording => self.settle(false).await,
            ClientMessage::TypedAnswer { text } => {
                self.stop_listening();
                let result = self.exam.submit_typed(&text).await;
                self.execute(result).await
            }
            ClientMessage::EndExamination => {
                self.stop_listening();
                let result = self.exam.request_finish();
                if result.is_ok() {
                    self.ended_early = true;
                }
                self.execute(result).await
            }
            ClientMessage::SetDiagnostics { enabled } => {
                info!(enabled, "Diagnostics toggled.");
                self.diagnostics = enabled.then(|| self.events.subscribe());
                Ok(())
            }
        }
    }

    /// Opens a recording segment fed by the client's recogniser.
    async fn start_recording(&mut self, stt_available: bool) -> Result<()> {
        if self.exam.is_recording() {
            return self
                .send(ServerMessage::Error {
                    message: "Already recording".into(),
                })
                .await;
        }

        let live = LiveTranscript::new();
        let mut relay = RelayedTranscription::new(stt_available);
        if !relay.start_listening(live.handlers()) {
            warn!("Client has no speech recogniser; falling back to typing.");
            return self
                .send(ServerMessage::TranscriptionUnavailable {
                    reason: TRANSCRIPTION_UNAVAILABLE.into(),
                })
                .await;
        }

        if let Err(e) = self.exam.begin_recording(live.text_source()) {
            relay.stop_listening();
            return self.reject(e).await;
        }
        self.live = live;
        self.relay = Some(relay);
        let limit = self.exam.policy().rounds.max_speaking;
        self.speaking_deadline = Some(Box::pin(time::sleep(limit)));
        Ok(())
    }

    /// The recogniser failed; drop speculation and let the learner type.
    async fn transcription_failed(&mut self, reason: String) -> Result<()> {
        warn!(%reason, "Speech recognition failed mid-recording.");
        if let Some(mut relay) = self.relay.take() {
            relay.fail(reason.clone());
        }
        self.speaking_deadline = None;
        self.exam.cancel_recording();
        self.send(ServerMessage::TranscriptionUnavailable { reason })
            .await
    }

    fn stop_listening(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            relay.stop_listening();
        }
        self.speaking_deadline = None;
    }

    /// Ends the recording and settles the round on the final transcript.
    async fn settle(&mut self, forced: bool) -> Result<()> {
        if !self.exam.is_recording() {
            if forced {
                return Ok(());
            }
            return self
                .send(ServerMessage::Error {
                    message: "Not recording".into(),
                })
                .await;
        }

        self.stop_listening();
        debug!(precall = ?self.exam.precall_status(), forced, "Settling the recording.");
        let transcript = self.live.snapshot();
        self.send(ServerMessage::RecordingStopped {
            forced,
            transcript: transcript.clone(),
        })
        .await?;
        let result = self.exam.submit_recording(&transcript).await;
        self.execute(result).await
    }

    async fn generate_report(&mut self) -> Result<()> {
        let result = self.exam.finish_report().await;
        self.execute(result).await
    }

    /// Runs the commands from an examination operation, or reports its
    /// rejection to the client.
    async fn execute(&mut self, result: Result<Vec<Command>, ExamError>) -> Result<()> {
        let commands = match result {
            Ok(commands) => commands,
            Err(e) => return self.reject(e).await,
        };

        let effects = cycle::translate(&self.exam, commands);
        for message in effects.messages {
            self.send(message).await?;
        }
        if let Some(after) = effects.report_after {
            self.report_timer = Some(Box::pin(time::sleep(after)));
        }
        if let Some(report) = effects.completed {
            self.complete(report).await?;
        }
        Ok(())
    }

    async fn reject(&mut self, e: ExamError) -> Result<()> {
        warn!(error = %e, "Rejected client request.");
        self.send(ServerMessage::Error {
            message: e.to_string(),
        })
        .await
    }

    /// Stores the examination and delivers the report.
    async fn complete(&mut self, report: Report) -> Result<()> {
        let session_id =
            match cycle::session_record(&self.device_id, &self.exam, &report, self.ended_early) {
                Ok(record) => cycle::persist(self.store.as_ref(), record).await,
                Err(e) => {
                    warn!(error = ?e, "Could not build the session record.");
                    None
                }
            };

        let message = ServerMessage::Report {
            report,
            confidence_before: self.exam.brief().confidence_before,
            trajectory: self.exam.confidence_trajectory(),
            session_id,
        };
        self.send(message).await?;
        self.finished = true;
        Ok(())
    }

    async fn send(&mut self, msg: ServerMessage) -> Result<()> {
        send_msg(&mut self.socket_tx, msg).await
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg<S>(socket_tx: &mut S, msg: ServerMessage) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStore, StubExaminer};
    use futures::{channel::mpsc, stream};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::time::Instant;
    use viva_core::ExamPolicy;

    type TestSession = ExamSession<mpsc::UnboundedSender<Message>>;

    fn test_session(store: Arc<MemoryStore>) -> (TestSession, mpsc::UnboundedReceiver<Message>) {
        let events = EventBus::new();
        let exam = Examination::new(
            ExamBrief {
                topic: "Binary search".into(),
                source_text: None,
                confidence_before: 4,
            },
            Arc::new(StubExaminer),
            ExamPolicy::default(),
            events.clone(),
        );
        let (tx, rx) = mpsc::unbounded();
        (ExamSession::new(exam, events, tx, store, "device-1".into()), rx)
    }

    fn client(msg: Value) -> Result<Message, axum::Error> {
        Ok(Message::Text(msg.to_string().into()))
    }

    /// Plays `script`, then keeps the connection open until the session ends.
    async fn play(session: &mut TestSession, script: Vec<Result<Message, axum::Error>>) {
        session
            .run(stream::iter(script).chain(stream::pending()))
            .await
            .unwrap();
    }

    async fn sent(session: TestSession, rx: mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        drop(session);
        rx.collect::<Vec<Message>>()
            .await
            .into_iter()
            .filter_map(|m| match m {
                Message::Text(text) => Some(serde_json::from_str(text.as_str()).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn position(messages: &[Value], pred: impl Fn(&Value) -> bool) -> usize {
        messages
            .iter()
            .position(pred)
            .unwrap_or_else(|| panic!("message not found in {:?}", messages))
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_limit_settles_and_report_follows_closing() {
        let store = Arc::new(MemoryStore::default());
        let (mut session, rx) = test_session(store.clone());
        let answer = "An empty range returns immediately without any comparisons.";
        let mut script = vec![client(
            json!({"type":"explanation","text":"It halves the range each step."}),
        )];
        for _ in 0..3 {
            script.push(client(json!({"type":"typed_answer","text":"The midpoint moves."})));
        }
        script.push(client(json!({"type":"start_recording"})));
        script.push(client(
            json!({"type":"transcript","text":answer,"is_final":true}),
        ));

        let started = Instant::now();
        play(&mut session, script).await;
        let elapsed = started.elapsed();

        // 60s speaking limit, then the 2s closing delay.
        assert!(elapsed >= Duration::from_secs(62), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(63), "{:?}", elapsed);
        assert!(session.finished);
        assert_eq!(session.exam.history().len(), 10);
        assert_eq!(session.exam.history()[8].text, answer);
        // One pre-call at 5s; the unchanged transcript never fires another.
        let precall = session.exam.precall_status();
        assert_eq!(precall.call_count, 1);
        assert!(!precall.running);

        let messages = sent(session, rx).await;
        let stopped = position(&messages, |m| m["type"] == "recording_stopped");
        assert_eq!(messages[stopped]["forced"], true);
        assert_eq!(messages[stopped]["transcript"], answer);
        let closing = position(&messages, |m| {
            m["type"] == "examiner_turn" && m["text"] == "Good work today."
        });
        let pending = position(&messages, |m| {
            m["type"] == "phase_changed" && m["phase"] == "report_pending"
        });
        assert!(stopped < closing && closing < pending);

        let report = messages.last().unwrap();
        assert_eq!(report["type"], "report");
        assert_eq!(report["report"]["key_correction"], "Check the empty range.");
        assert!(report["session_id"].is_string());

        let saved = store.sessions.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].rounds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_recording_cancels_speaking_limit() {
        let store = Arc::new(MemoryStore::default());
        let (mut session, rx) = test_session(store);
        let script = vec![
            client(json!({"type":"explanation","text":"It halves the range each step."})),
            client(json!({"type":"start_recording"})),
            client(json!({"type":"transcript","text":"The midpoint moves.","is_final":true})),
            client(json!({"type":"stop_recording"})),
            client(json!({"type":"typed_answer","text":"Compare with the target."})),
            client(json!({"type":"typed_answer","text":"Discard the other half."})),
            client(json!({"type":"typed_answer","text":"Stop when empty."})),
        ];

        let started = Instant::now();
        play(&mut session, script).await;

        // Only the closing delay elapses; the speaking limit never fires.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        let messages = sent(session, rx).await;
        let stopped: Vec<&Value> = messages
            .iter()
            .filter(|m| m["type"] == "recording_stopped")
            .collect();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0]["forced"], false);
        assert_eq!(messages.last().unwrap()["type"], "report");
    }

    #[test]
    fn test_parse_init_trims_and_keeps_source() {
        let init = parse_init(
            r#"{"type":"init","topic":"  Entropy ","source_text":"Disorder grows.","confidence_before":3,"device_id":"d1"}"#,
        )
        .unwrap();
        assert_eq!(
            init,
            SessionInit {
                brief: ExamBrief {
                    topic: "Entropy".into(),
                    source_text: Some("Disorder grows.".into()),
                    confidence_before: 3,
                },
                device_id: "d1".into(),
            }
        );
    }

    #[test]
    fn test_parse_init_blank_source_means_generate() {
        let init = parse_init(
            r#"{"type":"init","topic":"Entropy","source_text":"  ","confidence_before":3,"device_id":"d1"}"#,
        )
        .unwrap();
        assert_eq!(init.brief.source_text, None);
    }

    #[test]
    fn test_parse_init_rejects_invalid_input() {
        let cases = [
            r#"{"type":"init","topic":" ","confidence_before":3,"device_id":"d1"}"#,
            r#"{"type":"init","topic":"Entropy","confidence_before":0,"device_id":"d1"}"#,
            r#"{"type":"init","topic":"Entropy","confidence_before":11,"device_id":"d1"}"#,
            r#"{"type":"init","topic":"Entropy","confidence_before":3,"device_id":""}"#,
            r#"{"type":"explanation","text":"Hello"}"#,
            "not json",
        ];
        for case in cases {
            assert!(parse_init(case).is_err(), "accepted {}", case);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_fires_once_and_clears() {
        let mut timer = Some(Box::pin(time::sleep(std::time::Duration::from_secs(60))));
        expire(&mut timer).await;
        assert!(timer.is_none());

        let pending = time::timeout(std::time::Duration::from_secs(1), expire(&mut timer)).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_next_event_relays_diagnostics() {
        let bus = EventBus::new();
        let mut diagnostics = Some(bus.subscribe());
        bus.publish(ExamEvent::JoinedPending {
            cached_len: 40,
            final_len: 44,
        });
        assert!(matches!(
            next_event(&mut diagnostics).await,
            ExamEvent::JoinedPending {
                cached_len: 40,
                final_len: 44
            }
        ));

        let mut off = None;
        let pending =
            time::timeout(std::time::Duration::from_millis(10), next_event(&mut off)).await;
        assert!(pending.is_err());
    }
}
