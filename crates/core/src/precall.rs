//! Background Pre-Caller and Settlement Resolver
//!
//! While the learner is speaking, the pre-caller polls the live transcript on
//! a fixed interval and fires a speculative examiner call whenever the text
//! has grown enough to be worth another round trip. The freshest completed
//! result is cached. When the learner stops, [`BackgroundPreCaller::finish`]
//! settles the round in three tiers:
//!
//! 1. **cached**: the cached result covers nearly all of the final text;
//! 2. **joined**: a call is still in flight and covers most of it;
//! 3. **fresh**: one full call with the final text.
//!
//! In-flight calls are never aborted. Stopping the pre-caller only stops the
//! timer; a call that resolves after settlement writes into state that nobody
//! reads any more.

use crate::{
    dialogue::ExaminerReply,
    policy::PrecallPolicy,
    telemetry::{CallVariant, EventBus, ExamEvent},
};
use anyhow::Result;
use futures::{
    FutureExt, TryFutureExt,
    future::{BoxFuture, Shared},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// The future an examiner call produces.
pub type ReplyFuture = BoxFuture<'static, Result<ExaminerReply>>;

/// An examiner call bound to the right variant and history for one round.
/// Takes the transcript text seen so far.
pub type CallFn = Arc<dyn Fn(String) -> ReplyFuture + Send + Sync>;

/// Pull accessor for the live transcript.
pub type TextSource = Arc<dyn Fn() -> String + Send + Sync>;

/// An in-flight call that both the timer task and settlement may await.
type PendingReply = Shared<BoxFuture<'static, Result<ExaminerReply, Arc<anyhow::Error>>>>;

/// Transcript length as the pre-caller measures it.
pub fn text_len(text: &str) -> usize {
    text.chars().count()
}

/// Proportional growth of the final text past what the cache already covers.
/// Infinite when nothing is cached.
pub fn growth_ratio(final_len: usize, cached_len: usize) -> f64 {
    if cached_len == 0 {
        return f64::INFINITY;
    }
    (final_len as f64 - cached_len as f64) / cached_len as f64
}

/// Mutable state of one recording segment.
#[derive(Default)]
pub struct SpeculativeState {
    latest_result: Option<ExaminerReply>,
    /// Length of the text that produced `latest_result`. Never decreases.
    latest_text_len: usize,
    last_fired_len: usize,
    pending: Option<PendingReply>,
    call_count: u64,
}

impl SpeculativeState {
    /// Whether a tick that sees `text_len` characters should fire a call.
    pub fn should_fire(&self, text_len: usize, policy: &PrecallPolicy) -> bool {
        text_len >= policy.min_text_len
            && text_len.saturating_sub(self.last_fired_len) >= policy.min_growth
    }

    /// Stores a completed result unless a result for longer text is already
    /// cached. Returns whether the result was kept.
    pub fn record(&mut self, text_len: usize, reply: ExaminerReply) -> bool {
        if text_len < self.latest_text_len {
            return false;
        }
        self.latest_result = Some(reply);
        self.latest_text_len = text_len;
        true
    }

    pub fn latest_result(&self) -> Option<&ExaminerReply> {
        self.latest_result.as_ref()
    }

    pub fn latest_text_len(&self) -> usize {
        self.latest_text_len
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    /// Whether the most recently fired call has yet to resolve.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

fn lock(state: &Mutex<SpeculativeState>) -> MutexGuard<'_, SpeculativeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which tier produced the settled result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementPath {
    Cached,
    Joined,
    Fresh,
}

/// The result of a round, with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub reply: ExaminerReply,
    pub path: SettlementPath,
}

/// Read-only view of the speculative state, for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecallStatus {
    pub call_count: u64,
    pub cached_text_len: usize,
    pub has_cached_result: bool,
    pub running: bool,
}

/// Fires speculative calls while the learner speaks and settles the round
/// when they stop. One instance per recording segment.
pub struct BackgroundPreCaller {
    policy: PrecallPolicy,
    variant: CallVariant,
    state: Arc<Mutex<SpeculativeState>>,
    ticker: Option<JoinHandle<()>>,
    events: EventBus,
}

impl BackgroundPreCaller {
    pub fn new(policy: PrecallPolicy, events: EventBus) -> Self {
        Self {
            policy,
            variant: CallVariant::FollowUp,
            state: Arc::new(Mutex::new(SpeculativeState::default())),
            ticker: None,
            events,
        }
    }

    /// Starts polling `text` and speculating with `call`.
    ///
    /// Any previous run is stopped and its state discarded; calls still in
    /// flight from that run can no longer affect this one.
    pub fn start(&mut self, variant: CallVariant, call: CallFn, text: TextSource) {
        self.stop();
        self.variant = variant;
        self.state = Arc::new(Mutex::new(SpeculativeState::default()));

        let state = Arc::clone(&self.state);
        let policy = self.policy.clone();
        let events = self.events.clone();
        let period = policy.interval;

        info!(?variant, interval_ms = period.as_millis() as u64, "Starting background pre-calls");
        self.ticker = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let transcript = text();
                let len = text_len(&transcript);

                let (call_number, pending) = {
                    let mut st = lock(&state);
                    if !st.should_fire(len, &policy) {
                        debug!(text_len = len, "Skipping pre-call tick");
                        continue;
                    }
                    st.call_count += 1;
                    st.last_fired_len = len;
                    let pending: PendingReply = call(transcript).map_err(Arc::new).boxed().shared();
                    st.pending = Some(pending.clone());
                    (st.call_count, pending)
                };

                info!(call_number, text_len = len, "Background pre-call fired");
                events.publish(ExamEvent::CallStarted {
                    variant,
                    call_number,
                    text_len: len,
                });
                tokio::spawn(settle_background_call(
                    Arc::clone(&state),
                    events.clone(),
                    variant,
                    call_number,
                    len,
                    pending,
                ));
            }
        }));
    }

    /// Stops the timer. Safe to call repeatedly or before `start`.
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            debug!("Background pre-call timer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn status(&self) -> PrecallStatus {
        let st = lock(&self.state);
        PrecallStatus {
            call_count: st.call_count,
            cached_text_len: st.latest_text_len,
            has_cached_result: st.latest_result.is_some(),
            running: self.ticker.is_some(),
        }
    }

    /// Resolves the round's result for `final_text` as fast as correctness
    /// allows. Errors only when the fresh call itself fails.
    pub async fn finish(&mut self, fresh: CallFn, final_text: &str) -> Result<Settlement> {
        self.stop();

        let (cached, pending, cached_len) = {
            let st = lock(&self.state);
            // A settled call has nothing left to join; its result is already cached.
            let in_flight = st.pending.clone().filter(|p| p.peek().is_none());
            (st.latest_result.clone(), in_flight, st.latest_text_len)
        };
        let final_len = text_len(final_text);
        let growth = growth_ratio(final_len, cached_len);
        info!(
            has_cached = cached.is_some(),
            cached_len,
            final_len,
            growth,
            "Settling round"
        );

        if let Some(reply) = cached {
            if growth < self.policy.fast_path_growth {
                info!("Using cached background result");
                self.events.publish(ExamEvent::CacheHit {
                    cached_len,
                    final_len,
                });
                return Ok(Settlement {
                    reply,
                    path: SettlementPath::Cached,
                });
            }
        }

        if let Some(pending) = pending {
            if growth < self.policy.join_growth {
                info!("Waiting for in-flight background call");
                match time::timeout(self.policy.join_timeout, pending).await {
                    Ok(Ok(reply)) => {
                        self.events.publish(ExamEvent::JoinedPending {
                            cached_len,
                            final_len,
                        });
                        return Ok(Settlement {
                            reply,
                            path: SettlementPath::Joined,
                        });
                    }
                    Ok(Err(e)) => warn!(error = %e, "In-flight call failed; falling back to a fresh call"),
                    Err(_) => warn!(
                        timeout_ms = self.policy.join_timeout.as_millis() as u64,
                        "In-flight call timed out; falling back to a fresh call"
                    ),
                }
            }
        }

        info!("No usable background result; firing fresh call");
        self.events.publish(ExamEvent::FreshCall {
            variant: self.variant,
            final_len,
        });
        let reply = fresh(final_text.to_string()).await?;
        Ok(Settlement {
            reply,
            path: SettlementPath::Fresh,
        })
    }
}

impl Drop for BackgroundPreCaller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Awaits one speculative call and caches its result if it is still the
/// freshest. Failures are logged and dropped.
async fn settle_background_call(
    state: Arc<Mutex<SpeculativeState>>,
    events: EventBus,
    variant: CallVariant,
    call_number: u64,
    len: usize,
    pending: PendingReply,
) {
    let started = Instant::now();
    let outcome = pending.await;
    let accepted = {
        let mut st = lock(&state);
        if st.call_count == call_number {
            st.pending = None;
        }
        match &outcome {
            Ok(reply) => st.record(len, reply.clone()),
            Err(_) => false,
        }
    };
    match outcome {
        Ok(_) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            if accepted {
                info!(call_number, text_len = len, elapsed_ms, "Background pre-call complete");
            } else {
                debug!(call_number, text_len = len, "Discarding superseded background result");
            }
            events.publish(ExamEvent::CallCompleted {
                variant,
                call_number,
                text_len: len,
                elapsed_ms,
                accepted,
            });
        }
        Err(e) => {
            warn!(call_number, error = %e, "Background pre-call failed");
            events.publish_with(|| ExamEvent::CallFailed {
                variant,
                call_number,
                reason: e.to_string(),
            });
        }
    }
}
