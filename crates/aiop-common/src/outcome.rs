//! Reconciliation outcomes and the failure taxonomy
//!
//! Every reconcile pass ends in a [`ReconciliationOutcome`]. The outcome
//! decides the requeue delay and is handed to the status reporter, which
//! turns it into phase and condition updates.

use std::time::Duration;

use kube::runtime::controller::Action;
use serde::{Deserialize, Serialize};

use crate::crd::Phase;
use crate::Error;

/// Base delay in seconds for retry backoff (5s * 2^retry_count, capped at 5 min)
pub const RETRY_BASE_DELAY_SECS: u64 = 5;

/// Maximum retry delay in seconds (5 minutes)
pub const RETRY_MAX_DELAY_SECS: u64 = 300;

/// Delay before the next pass after a successful phase transition
pub const PHASE_STEP_DELAY: Duration = Duration::from_secs(1);

/// Interval for re-verifying resources that are Ready
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Failure categories used for retry decisions and status reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum FailureKind {
    /// Network failures, timeouts, 5xx responses
    Transient,
    /// A dependency (secret, model service, pipeline) does not exist yet
    NotYetReady,
    /// Malformed or ambiguous spec, requires a spec edit
    Configuration,
    /// Credentials rejected, requires operator intervention
    Unauthorized,
}

impl FailureKind {
    /// Classify an HTTP-style status code
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            404 => Self::NotYetReady,
            408 | 409 | 429 => Self::Transient,
            400..=499 => Self::Configuration,
            _ => Self::Transient,
        }
    }

    /// Whether failures of this kind are retried automatically
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::NotYetReady)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "Transient"),
            Self::NotYetReady => write!(f, "NotYetReady"),
            Self::Configuration => write!(f, "Configuration"),
            Self::Unauthorized => write!(f, "Unauthorized"),
        }
    }
}

/// Result of a single reconcile pass
#[derive(Clone, Debug, PartialEq)]
pub enum ReconciliationOutcome {
    /// The pass made progress; `phase` is the phase to record
    Success {
        /// Phase the resource is now in
        phase: Phase,
        /// Human-readable summary
        message: String,
        /// When to look at the resource again (None waits for a change)
        requeue_after: Option<Duration>,
    },
    /// The pass could not complete and should be retried after `backoff`
    Retryable {
        /// Failure category (Transient or NotYetReady)
        kind: FailureKind,
        /// Machine-readable reason, used as the condition reason
        reason: String,
        /// Human-readable message
        message: String,
        /// Delay before the next attempt
        backoff: Duration,
    },
    /// The pass failed in a way that retrying cannot fix
    Fatal {
        /// Failure category (Configuration or Unauthorized)
        kind: FailureKind,
        /// Human-readable message
        message: String,
    },
}

impl ReconciliationOutcome {
    /// Successful transition into `phase`, continuing shortly
    pub fn advance(phase: Phase, message: impl Into<String>) -> Self {
        Self::Success {
            phase,
            message: message.into(),
            requeue_after: Some(PHASE_STEP_DELAY),
        }
    }

    /// Successful pass that stays in `phase` and checks back after `delay`
    pub fn wait(phase: Phase, message: impl Into<String>, delay: Duration) -> Self {
        Self::Success {
            phase,
            message: message.into(),
            requeue_after: Some(delay),
        }
    }

    /// Build the outcome for an error, given the number of consecutive failures so far
    ///
    /// Retryable errors get `min(base * 2^retry_count, max)` of backoff. Any
    /// other error becomes Fatal.
    pub fn from_error(error: &Error, reason: impl Into<String>, retry_count: u32) -> Self {
        let kind = error.kind();
        if kind.is_retryable() {
            Self::Retryable {
                kind,
                reason: reason.into(),
                message: error.to_string(),
                backoff: backoff_delay(retry_count),
            }
        } else {
            Self::Fatal {
                kind,
                message: error.to_string(),
            }
        }
    }

    /// Fatal configuration failure
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Fatal {
            kind: FailureKind::Configuration,
            message: message.into(),
        }
    }

    /// Dependency not available yet
    pub fn not_yet_ready(
        reason: impl Into<String>,
        message: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self::Retryable {
            kind: FailureKind::NotYetReady,
            reason: reason.into(),
            message: message.into(),
            backoff: backoff_delay(retry_count),
        }
    }

    /// True for Fatal outcomes
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// The controller action for this outcome
    pub fn action(&self) -> Action {
        match self {
            Self::Success {
                requeue_after: Some(delay),
                ..
            } => Action::requeue(*delay),
            Self::Success {
                requeue_after: None,
                ..
            } => Action::await_change(),
            Self::Retryable { backoff, .. } => Action::requeue(*backoff),
            Self::Fatal { .. } => Action::await_change(),
        }
    }
}

/// Exponential backoff delay for the given number of consecutive failures
pub fn backoff_delay(retry_count: u32) -> Duration {
    let secs = std::cmp::min(
        RETRY_BASE_DELAY_SECS.saturating_mul(2u64.saturating_pow(retry_count)),
        RETRY_MAX_DELAY_SECS,
    );
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn backoff_doubles_then_caps_at_max_delay() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(20));
        assert_eq!(backoff_delay(5), Duration::from_secs(160));
        // 5 * 2^6 = 320 → capped at 300
        assert_eq!(backoff_delay(6), Duration::from_secs(300));
        // Large retry_count is safe (saturating arithmetic)
        assert_eq!(backoff_delay(100), Duration::from_secs(300));
    }

    #[test]
    fn backoff_is_monotonic() {
        let delays: Vec<Duration> = (0..40).map(backoff_delay).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(
            delays.last().copied(),
            Some(Duration::from_secs(RETRY_MAX_DELAY_SECS))
        );
    }

    #[rstest]
    #[case::transient(FailureKind::Transient, true)]
    #[case::not_yet_ready(FailureKind::NotYetReady, true)]
    #[case::configuration(FailureKind::Configuration, false)]
    #[case::unauthorized(FailureKind::Unauthorized, false)]
    fn retryability_by_kind(#[case] kind: FailureKind, #[case] retryable: bool) {
        assert_eq!(kind.is_retryable(), retryable);
    }

    #[test]
    fn retryable_errors_carry_backoff() {
        let err = Error::api("kubeflow", 503, "unavailable");
        let outcome = ReconciliationOutcome::from_error(&err, "PipelineUnavailable", 2);
        match &outcome {
            ReconciliationOutcome::Retryable {
                kind,
                reason,
                backoff,
                ..
            } => {
                assert_eq!(*kind, FailureKind::Transient);
                assert_eq!(reason, "PipelineUnavailable");
                assert_eq!(*backoff, Duration::from_secs(20));
            }
            other => panic!("expected Retryable, got {other:?}"),
        }
        assert_eq!(outcome.action(), Action::requeue(Duration::from_secs(20)));
    }

    #[test]
    fn fatal_errors_wait_for_a_change() {
        let err = Error::validation("two services match model 'llama'");
        let outcome = ReconciliationOutcome::from_error(&err, "Ignored", 0);
        assert!(outcome.is_fatal());
        assert_eq!(outcome.action(), Action::await_change());
    }

    #[test]
    fn success_actions() {
        let step = ReconciliationOutcome::advance(Phase::Resolving, "resolving");
        assert_eq!(step.action(), Action::requeue(PHASE_STEP_DELAY));

        let idle = ReconciliationOutcome::Success {
            phase: Phase::Ready,
            message: "ready".into(),
            requeue_after: None,
        };
        assert_eq!(idle.action(), Action::await_change());
    }

    #[test]
    fn failure_kind_display_matches_condition_reasons() {
        assert_eq!(FailureKind::Configuration.to_string(), "Configuration");
        assert_eq!(FailureKind::NotYetReady.to_string(), "NotYetReady");
    }
}
