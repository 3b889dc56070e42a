//! Status reporting
//!
//! Turns a [`ReconciliationOutcome`] into phase, condition and counter
//! updates, and writes the result back through a read-modify-write loop
//! guarded by the object's resourceVersion.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::crd::{
    Agent, AgentStatus, Condition, ConditionStatus, KnowledgeBase, KnowledgeBaseStatus,
    ManagedStatus, Phase,
};
use crate::outcome::{backoff_delay, FailureKind, ReconciliationOutcome, RETRY_MAX_DELAY_SECS};
use crate::{Error, Result};

/// Consecutive transient failures tolerated before a Degraded condition is written
pub const TRANSIENT_SURFACE_THRESHOLD: u32 = 3;

/// Attempts at a status write before giving up on repeated conflicts
pub const MAX_STATUS_WRITE_ATTEMPTS: u32 = 5;

/// Condition type summarising whether the resource is converged
pub const CONDITION_READY: &str = "Ready";

/// Condition type raised after repeated transient failures
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Failed cleanup attempts tolerated before deletion waits for an operator
pub const MAX_CLEANUP_ATTEMPTS: u32 = 5;

/// Ready condition reason once cleanup has given up
pub const REASON_CLEANUP_FAILED: &str = "CleanupFailed";

/// Insert or replace a condition by type
///
/// `lastTransitionTime` is carried over from the existing condition unless
/// the status flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Apply a reconcile outcome to a status
///
/// - Success: phase recorded, failure count reset, Ready reflects the phase.
/// - Retryable: failure count incremented and phase kept. NotYetReady always
///   updates the Ready condition; Transient only raises Degraded once the
///   count reaches [`TRANSIENT_SURFACE_THRESHOLD`].
/// - Fatal: phase Failed, Ready=False with the failure kind as reason.
pub fn apply_outcome<S: ManagedStatus>(status: &mut S, outcome: &ReconciliationOutcome) {
    match outcome {
        ReconciliationOutcome::Success { phase, message, .. } => {
            status.set_phase(*phase);
            status.set_retry_count(0);
            status.set_message(Some(message.clone()));
            let conditions = status.conditions_mut();
            remove_condition(conditions, CONDITION_DEGRADED);
            let ready = if *phase == Phase::Ready {
                Condition::new(CONDITION_READY, ConditionStatus::True, "Ready", message)
            } else {
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    phase.to_string(),
                    message,
                )
            };
            set_condition(conditions, ready);
        }
        ReconciliationOutcome::Retryable {
            kind,
            reason,
            message,
            ..
        } => {
            let count = status.retry_count().saturating_add(1);
            status.set_retry_count(count);
            status.set_message(Some(message.clone()));
            let conditions = status.conditions_mut();
            match kind {
                FailureKind::NotYetReady => set_condition(
                    conditions,
                    Condition::new(CONDITION_READY, ConditionStatus::False, reason, message),
                ),
                _ if count >= TRANSIENT_SURFACE_THRESHOLD => set_condition(
                    conditions,
                    Condition::new(CONDITION_DEGRADED, ConditionStatus::True, reason, message),
                ),
                _ => {}
            }
        }
        ReconciliationOutcome::Fatal { kind, message } => {
            status.set_phase(Phase::Failed);
            status.set_message(Some(message.clone()));
            set_condition(
                status.conditions_mut(),
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    kind.to_string(),
                    message,
                ),
            );
        }
    }
}

/// Mark a status as Deleting
///
/// The failure counter restarts when deletion begins so cleanup attempts
/// are counted on their own.
pub fn begin_deletion<S: ManagedStatus>(status: &mut S) {
    if status.phase() != Phase::Deleting {
        status.set_phase(Phase::Deleting);
        status.set_retry_count(0);
        status.set_message(Some("cleaning up".to_string()));
    }
}

/// Record cleanup attempt number `attempts` as failed
///
/// Past [`MAX_CLEANUP_ATTEMPTS`] the Ready condition carries
/// [`REASON_CLEANUP_FAILED`]; the phase stays Deleting and the finalizer is
/// kept.
pub fn record_cleanup_failure<S: ManagedStatus>(status: &mut S, attempts: u32, message: &str) {
    status.set_phase(Phase::Deleting);
    status.set_retry_count(attempts);
    status.set_message(Some(message.to_string()));
    if attempts > MAX_CLEANUP_ATTEMPTS {
        set_condition(
            status.conditions_mut(),
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                REASON_CLEANUP_FAILED,
                message,
            ),
        );
    }
}

/// Delay before cleanup attempt `attempts + 1`
pub fn cleanup_delay(attempts: u32) -> Duration {
    if attempts > MAX_CLEANUP_ATTEMPTS {
        Duration::from_secs(RETRY_MAX_DELAY_SECS)
    } else {
        backoff_delay(attempts.saturating_sub(1))
    }
}

/// Resources whose status is a [`ManagedStatus`]
pub trait StatusResource: kube::Resource + Clone {
    /// Status type
    type Status: ManagedStatus;

    /// Current status, if any has been written
    fn current_status(&self) -> Option<&Self::Status>;
}

impl StatusResource for KnowledgeBase {
    type Status = KnowledgeBaseStatus;

    fn current_status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl StatusResource for Agent {
    type Status = AgentStatus;

    fn current_status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

/// Result of a status write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusWrite {
    /// The status was patched
    Written,
    /// The mutation produced no change, nothing was sent
    Unchanged,
    /// The object no longer exists
    Gone,
}

/// Read-modify-write a resource status
///
/// `fetch` returns the latest copy of the object; `mutate` is applied to its
/// current status; `patch` receives the resourceVersion read and the new
/// status and must send it with that version as a precondition. A conflict
/// (409) restarts the loop from a fresh read, up to
/// [`MAX_STATUS_WRITE_ATTEMPTS`] times. No write is issued when the mutation
/// leaves the status unchanged.
pub async fn update_status<R, F, FFut, P, PFut, M>(
    fetch: F,
    patch: P,
    mutate: M,
) -> Result<StatusWrite>
where
    R: StatusResource,
    F: Fn() -> FFut,
    FFut: Future<Output = Result<Option<R>>>,
    P: Fn(String, R::Status) -> PFut,
    PFut: Future<Output = Result<()>>,
    M: Fn(&mut R::Status),
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let Some(latest) = fetch().await? else {
            return Ok(StatusWrite::Gone);
        };
        let resource_version = latest.meta().resource_version.clone().ok_or_else(|| {
            Error::internal_with_context("status", "object has no resourceVersion")
        })?;

        let current = latest.current_status().cloned().unwrap_or_default();
        let mut next = current.clone();
        mutate(&mut next);
        if next == current {
            return Ok(StatusWrite::Unchanged);
        }
        next.set_last_updated(Utc::now());

        match patch(resource_version, next).await {
            Ok(()) => return Ok(StatusWrite::Written),
            Err(e) if e.is_conflict() && attempt < MAX_STATUS_WRITE_ATTEMPTS => {
                debug!(attempt, "status write conflicted, retrying from a fresh read");
            }
            Err(e) => return Err(e),
        }
    }
}
