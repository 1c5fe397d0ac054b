//! Turn Orchestrator
//!
//! [`Examination`] owns the dialogue history, the round state machine and one
//! [`BackgroundPreCaller`]. The runtime feeds it learner input and executes the
//! [`Command`]s it returns.
//!
//! Every examiner failure is absorbed here: a scripted line appropriate to the
//! phase stands in for the missing reply and the machine advances as if the
//! call had succeeded.

use crate::{
    Command, ExamError,
    dialogue::{self, Assessment, DialogueTurn, ExamBrief, ExaminerReply, Mode, Report},
    examiner::Examiner,
    machine::{self, Event, MachineState, Phase},
    policy::ExamPolicy,
    precall::{BackgroundPreCaller, CallFn, PrecallStatus, TextSource},
    telemetry::{CallVariant, EventBus, ExamEvent},
};
use futures::FutureExt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

const OPENING_FALLBACK: &str =
    "Thanks for that explanation. Walk me through the core idea again, one step at a time.";
const FOLLOW_UP_FALLBACK: &str = "Let's keep going. Can you say more about that?";
const CLOSING_FALLBACK: &str =
    "Thank you, that brings the examination to a close. Let's look at how you did.";

/// Snapshot of the round awaiting an answer. Built fresh each round.
#[derive(Debug, Clone)]
pub struct RoundContext {
    /// 1-based; the closing round counts.
    pub round_index: u32,
    pub is_terminal_round: bool,
    pub history_snapshot: Arc<[DialogueTurn]>,
}

impl RoundContext {
    pub fn variant(&self) -> CallVariant {
        if self.is_terminal_round {
            CallVariant::Closing
        } else {
            CallVariant::FollowUp
        }
    }
}

/// One oral examination, from the opening explanation to the report.
pub struct Examination {
    brief: ExamBrief,
    examiner: Arc<dyn Examiner>,
    policy: ExamPolicy,
    machine: MachineState,
    history: Vec<DialogueTurn>,
    precaller: BackgroundPreCaller,
    events: EventBus,
    mode: Mode,
    recording: bool,
    report: Option<Report>,
}

impl Examination {
    pub fn new(
        brief: ExamBrief,
        examiner: Arc<dyn Examiner>,
        policy: ExamPolicy,
        events: EventBus,
    ) -> Self {
        let precaller = BackgroundPreCaller::new(policy.precall.clone(), events.clone());
        Self {
            brief,
            examiner,
            policy,
            machine: MachineState::default(),
            history: Vec::new(),
            precaller,
            events,
            mode: Mode::default(),
            recording: false,
            report: None,
        }
    }

    pub fn brief(&self) -> &ExamBrief {
        &self.brief
    }

    pub fn policy(&self) -> &ExamPolicy {
        &self.policy
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase
    }

    pub fn state(&self) -> MachineState {
        self.machine
    }

    pub fn history(&self) -> &[DialogueTurn] {
        &self.history
    }

    /// The examiner's current strategy.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn assessments(&self) -> Vec<&Assessment> {
        dialogue::assessments(&self.history).collect()
    }

    pub fn confidence_trajectory(&self) -> Vec<(usize, u8)> {
        dialogue::confidence_trajectory(&self.history)
    }

    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn precall_status(&self) -> PrecallStatus {
        self.precaller.status()
    }

    pub fn can_finish_early(&self) -> bool {
        self.machine.can_finish_early(&self.policy.rounds)
    }

    /// Runs the opening call on the learner's initial explanation. Nothing is
    /// speculated here; there is no partial text to speculate on.
    pub async fn open(&mut self, explanation: &str) -> Result<Vec<Command>, ExamError> {
        if self.machine.phase != Phase::Opening || !self.history.is_empty() {
            return Err(ExamError::WrongPhase(self.machine.phase));
        }
        if explanation.trim().is_empty() {
            return Err(ExamError::EmptyAnswer);
        }

        let started = Instant::now();
        let result = self.examiner.opening(&self.brief, explanation).await;
        self.publish_direct(CallVariant::Opening, started, result.is_ok());
        let reply = result.unwrap_or_else(|e| {
            warn!(error = %e, "Opening call failed; using scripted reply");
            ExaminerReply::scripted(OPENING_FALLBACK)
        });

        Ok(self.complete_turn(explanation, reply))
    }

    /// The round awaiting an answer, if any.
    pub fn round_context(&self) -> Option<RoundContext> {
        let round_index = self.machine.round_index()?;
        Some(RoundContext {
            round_index,
            is_terminal_round: self.machine.phase == Phase::Closing,
            history_snapshot: Arc::from(self.history.clone()),
        })
    }

    /// The examiner call for `ctx`: closing on the terminal round, follow-up
    /// otherwise.
    pub fn bind_call(&self, ctx: &RoundContext) -> CallFn {
        let examiner = Arc::clone(&self.examiner);
        let brief = Arc::new(self.brief.clone());
        let history = Arc::clone(&ctx.history_snapshot);
        let terminal = ctx.is_terminal_round;
        Arc::new(move |text: String| {
            let examiner = Arc::clone(&examiner);
            let brief = Arc::clone(&brief);
            let history = Arc::clone(&history);
            async move {
                if terminal {
                    examiner.closing(&brief, &history, &text).await
                } else {
                    examiner.follow_up(&brief, &history, &text).await
                }
            }
            .boxed()
        })
    }

    /// The learner started speaking. Speculates on `text` until
    /// [`submit_recording`](Self::submit_recording) or
    /// [`cancel_recording`](Self::cancel_recording).
    pub fn begin_recording(&mut self, text: TextSource) -> Result<(), ExamError> {
        let ctx = self.awaiting_round()?;
        info!(
            round = ctx.round_index,
            terminal = ctx.is_terminal_round,
            "Learner started speaking"
        );
        let call = self.bind_call(&ctx);
        self.precaller.start(ctx.variant(), call, text);
        self.recording = true;
        Ok(())
    }

    /// Stops speculation without settling, e.g. when transcription fails and
    /// the learner switches to typing.
    pub fn cancel_recording(&mut self) {
        self.precaller.stop();
        self.recording = false;
    }

    /// The learner stopped speaking with `final_text`. Settles the round and
    /// appends both turns.
    pub async fn submit_recording(&mut self, final_text: &str) -> Result<Vec<Command>, ExamError> {
        let ctx = self.awaiting_round()?;
        if final_text.trim().is_empty() {
            self.cancel_recording();
            return Err(ExamError::EmptyAnswer);
        }

        let fresh = self.bind_call(&ctx);
        let settled = self.precaller.finish(fresh, final_text).await;
        self.recording = false;
        let reply = match settled {
            Ok(settlement) => {
                info!(round = ctx.round_index, path = ?settlement.path, "Round settled");
                settlement.reply
            }
            Err(e) => {
                warn!(round = ctx.round_index, error = %e, "Examiner call failed; using scripted reply");
                fallback_reply(&ctx)
            }
        };

        Ok(self.complete_turn(final_text, reply))
    }

    /// A typed answer. Bypasses speculation: only the one final call runs.
    pub async fn submit_typed(&mut self, text: &str) -> Result<Vec<Command>, ExamError> {
        let ctx = self.awaiting_round()?;
        if text.trim().is_empty() {
            return Err(ExamError::EmptyAnswer);
        }
        self.cancel_recording();

        let started = Instant::now();
        let result = self.bind_call(&ctx)(text.to_string()).await;
        self.publish_direct(ctx.variant(), started, result.is_ok());
        let reply = result.unwrap_or_else(|e| {
            warn!(round = ctx.round_index, error = %e, "Examiner call failed; using scripted reply");
            fallback_reply(&ctx)
        });

        Ok(self.complete_turn(text, reply))
    }

    /// Ends the examination before the examiner would. Only allowed once the
    /// round floor is met.
    pub fn request_finish(&mut self) -> Result<Vec<Command>, ExamError> {
        if !self.can_finish_early() {
            if self.machine.phase != Phase::Continuing {
                return Err(ExamError::WrongPhase(self.machine.phase));
            }
            return Err(ExamError::TooEarlyToFinish {
                completed: self.machine.completed_rounds,
                required: self.policy.rounds.min_rounds,
            });
        }
        self.cancel_recording();
        info!(
            completed_rounds = self.machine.completed_rounds,
            "Learner ended the examination"
        );
        Ok(self.apply(Event::FinishRequested))
    }

    /// Generates the report across the whole history. A failed call yields a
    /// report derived from the assessment trajectory.
    pub async fn finish_report(&mut self) -> Result<Vec<Command>, ExamError> {
        if self.machine.phase != Phase::ReportPending {
            return Err(ExamError::WrongPhase(self.machine.phase));
        }

        let started = Instant::now();
        let result = self.examiner.report(&self.brief, &self.history).await;
        self.publish_direct(CallVariant::Report, started, result.is_ok());
        let report = result.unwrap_or_else(|e| {
            warn!(error = %e, "Report call failed; deriving report from assessments");
            Report::from_trajectory(&self.history)
        });

        self.report = Some(report.clone());
        let mut commands = self.apply(Event::ReportReady);
        commands.push(Command::SessionComplete(report));
        Ok(commands)
    }

    fn awaiting_round(&self) -> Result<RoundContext, ExamError> {
        self.round_context()
            .ok_or(ExamError::WrongPhase(self.machine.phase))
    }

    /// Appends the learner's turn then the examiner's, in speaking order, and
    /// advances the machine.
    fn complete_turn(&mut self, learner_text: &str, reply: ExaminerReply) -> Vec<Command> {
        let ExaminerReply {
            response,
            should_continue,
            assessment,
        } = reply;

        let mut commands = vec![Command::Speak(response.clone())];
        if let Some(next) = assessment.as_ref().map(|a| a.mode) {
            if next != self.mode {
                info!(from = %self.mode, to = %next, "Examiner mode changed");
                self.events.publish(ExamEvent::ModeChanged {
                    from: self.mode,
                    to: next,
                });
                self.mode = next;
                commands.push(Command::ModeChanged(next));
            }
        }

        self.history.push(DialogueTurn::learner(learner_text));
        self.history.push(DialogueTurn::examiner(response, assessment));

        commands.extend(self.apply(Event::ExaminerSpoke {
            should_continue: should_continue.unwrap_or(false),
        }));
        commands
    }

    fn apply(&mut self, event: Event) -> Vec<Command> {
        let (next, commands) = machine::transition(self.machine, event, &self.policy.rounds);
        self.machine = next;
        for command in &commands {
            if let Command::PhaseChanged(phase) = command {
                info!(?phase, completed_rounds = next.completed_rounds, "Phase changed");
                self.events.publish(ExamEvent::PhaseChanged { phase: *phase });
            }
        }
        commands
    }

    fn publish_direct(&self, variant: CallVariant, started: Instant, ok: bool) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(?variant, elapsed_ms, ok, "Examiner call finished");
        self.events.publish(ExamEvent::DirectCall {
            variant,
            elapsed_ms,
            ok,
        });
    }
}

fn fallback_reply(ctx: &RoundContext) -> ExaminerReply {
    if ctx.is_terminal_round {
        ExaminerReply::scripted(CLOSING_FALLBACK)
    } else {
        ExaminerReply::scripted(FOLLOW_UP_FALLBACK)
    }
}
