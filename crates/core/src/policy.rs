//! Tunable timing and threshold policy for an examination.

use std::time::Duration;

/// Settings for the background pre-caller and the settlement resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecallPolicy {
    /// Period between transcript polls while the learner speaks.
    pub interval: Duration,
    /// Transcripts shorter than this carry too little signal to analyse.
    pub min_text_len: usize,
    /// Growth needed since the last fired call before firing another.
    pub min_growth: usize,
    /// Settlement reuses the cached result below this growth ratio.
    pub fast_path_growth: f64,
    /// Settlement joins the in-flight call below this growth ratio.
    pub join_growth: f64,
    /// Ceiling on how long settlement waits for the in-flight call.
    pub join_timeout: Duration,
}

impl Default for PrecallPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_text_len: 30,
            min_growth: 20,
            fast_path_growth: 0.30,
            join_growth: 0.50,
            join_timeout: Duration::from_secs(15),
        }
    }
}

/// Round limits and pacing of the examination state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundPolicy {
    /// Follow-up rounds that must complete before closing is allowed.
    pub min_rounds: u32,
    /// Follow-up rounds after which closing is forced.
    pub max_rounds: u32,
    /// Pause between the closing remark and report generation.
    pub report_delay: Duration,
    /// Recording is force-stopped after this long in a single round.
    pub max_speaking: Duration,
}

impl Default for RoundPolicy {
    fn default() -> Self {
        Self {
            min_rounds: 3,
            max_rounds: 5,
            report_delay: Duration::from_secs(2),
            max_speaking: Duration::from_secs(60),
        }
    }
}

/// Everything an [`Examination`](crate::examination::Examination) needs to know
/// about pacing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExamPolicy {
    pub precall: PrecallPolicy,
    pub rounds: RoundPolicy,
}
