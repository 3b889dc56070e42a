//! Metrics registry for the AI operators
//!
//! Provides OpenTelemetry metrics for:
//! - Reconciliation (duration and result per kind, errors by failure kind)
//! - Resources by phase, sampled from each controller's cache
//! - Pipeline runs submitted to the pipeline service

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::crd::Phase;
use crate::outcome::FailureKind;

/// Global meter for operator metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("aiop"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `kind`: KnowledgeBase, Agent
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("aiop_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile passes that returned an error
///
/// Labels:
/// - `kind`: KnowledgeBase, Agent
/// - `error_type`: transient, not_yet_ready, configuration, unauthorized
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("aiop_reconcile_errors_total")
        .with_description("Total number of failed reconcile passes")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Resource Metrics
// ============================================================================

/// Gauge of managed resources by phase
///
/// Labels:
/// - `kind`: KnowledgeBase, Agent
/// - `scope`: watched namespace, or `cluster`
/// - `phase`: pending, resolving, provisioning, ready, failed, deleting
pub static RESOURCES_TOTAL: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("aiop_resources_total")
        .with_description("Number of managed resources by phase")
        .with_unit("{resources}")
        .build()
});

// ============================================================================
// Pipeline Metrics
// ============================================================================

/// Counter of pipeline runs submitted
///
/// Labels:
/// - `pipeline`: pipeline display name
pub static PIPELINE_RUNS_SUBMITTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("aiop_pipeline_runs_submitted_total")
        .with_description("Total number of pipeline runs submitted")
        .with_unit("{runs}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Every phase, in lifecycle order
pub const PHASES: [Phase; 6] = [
    Phase::Pending,
    Phase::Resolving,
    Phase::Provisioning,
    Phase::Ready,
    Phase::Failed,
    Phase::Deleting,
];

/// Label value for a phase
pub fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Pending => "pending",
        Phase::Resolving => "resolving",
        Phase::Provisioning => "provisioning",
        Phase::Ready => "ready",
        Phase::Failed => "failed",
        Phase::Deleting => "deleting",
    }
}

/// Label value for a failure kind
pub fn error_type_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Transient => "transient",
        FailureKind::NotYetReady => "not_yet_ready",
        FailureKind::Configuration => "configuration",
        FailureKind::Unauthorized => "unauthorized",
    }
}

/// Count `phases` per phase, including phases with no resources
pub fn count_phases(phases: impl IntoIterator<Item = Phase>) -> [(Phase, i64); 6] {
    let mut counts = PHASES.map(|phase| (phase, 0i64));
    for phase in phases {
        if let Some((_, count)) = counts.iter_mut().find(|(p, _)| *p == phase) {
            *count += 1;
        }
    }
    counts
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one reconcile pass
pub struct ReconcileTimer {
    kind: &'static str,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile pass of `kind`
    pub fn start(kind: &'static str) -> Self {
        Self {
            kind,
            start: std::time::Instant::now(),
        }
    }

    /// Record a pass that returned an action
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a pass that returned an error
    pub fn error(self, kind: FailureKind) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("error_type", error_type_label(kind)),
            ],
        );
    }

    /// Record the pass according to its result
    pub fn finish<T>(self, result: &Result<T, crate::Error>) {
        match result {
            Ok(_) => self.success(),
            Err(e) => self.error(e.kind()),
        }
    }
}

/// Update the resources-by-phase gauge for one controller scope
pub fn set_phase_counts(kind: &'static str, scope: &str, phases: impl IntoIterator<Item = Phase>) {
    for (phase, count) in count_phases(phases) {
        RESOURCES_TOTAL.record(
            count,
            &[
                KeyValue::new("kind", kind),
                KeyValue::new("scope", scope.to_string()),
                KeyValue::new("phase", phase_label(phase)),
            ],
        );
    }
}

/// Record a submitted pipeline run
pub fn record_run_submitted(pipeline: &str) {
    PIPELINE_RUNS_SUBMITTED.add(1, &[KeyValue::new("pipeline", pipeline.to_string())]);
}
