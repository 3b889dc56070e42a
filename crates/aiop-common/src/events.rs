//! Kubernetes Event recording for the AI operators.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "PipelineSubmitted")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "knowledge-base-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Shared lifecycle
    /// Spec change picked up, dependencies are being resolved
    pub const RESOLVING_STARTED: &str = "ResolvingStarted";
    /// Spec validation or dependency resolution failed permanently
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Deletion cleanup started
    pub const DELETION_STARTED: &str = "DeletionStarted";
    /// Cleanup exhausted its attempts, the finalizer stays
    pub const CLEANUP_FAILED: &str = "CleanupFailed";

    // KnowledgeBase
    /// Pipeline run submitted
    pub const PIPELINE_SUBMITTED: &str = "PipelineSubmitted";
    /// Pipeline run failed or was canceled
    pub const PIPELINE_FAILED: &str = "PipelineFailed";
    /// Pipeline run succeeded
    pub const KNOWLEDGE_BASE_READY: &str = "KnowledgeBaseReady";

    // Agent
    /// Agent artifact applied
    pub const AGENT_DEPLOYED: &str = "AgentDeployed";
    /// Agent moved between providers
    pub const PROVIDER_SWITCHED: &str = "ProviderSwitched";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Submitting or tracking a pipeline run
    pub const RUN_PIPELINE: &str = "RunPipeline";
    /// Applying a deployment artifact
    pub const DEPLOY: &str = "Deploy";
    /// Deleting external resources
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::PIPELINE_SUBMITTED, "PipelineSubmitted");
        assert_eq!(reasons::AGENT_DEPLOYED, "AgentDeployed");
        assert_eq!(reasons::CLEANUP_FAILED, "CleanupFailed");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::KNOWLEDGE_BASE_READY,
                actions::RECONCILE,
                Some("indexed".to_string()),
            )
            .await;
    }
}
