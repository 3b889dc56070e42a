//! Custom Resource Definitions for the AI operators
//!
//! Both kinds live in the `akamai.io/v1alpha1` API group and share the
//! [`Phase`] state machine and [`Condition`] reporting through
//! [`ManagedStatus`].

mod agent;
mod knowledge_base;
mod types;

use chrono::{DateTime, Utc};

pub use agent::{
    Agent, AgentSpec, AgentStatus, DeploymentRef, GitOpsSource, ProviderKind, RouteSpec, ToolSpec,
    AGENT_FINALIZER, DEFAULT_MAX_TOKENS, TOOL_TYPE_KNOWLEDGE_BASE,
};
pub use knowledge_base::{
    DataSource, DatabaseSpec, EmbeddingSpec, KnowledgeBase, KnowledgeBaseSpec,
    KnowledgeBaseStatus, PipelineAuthType, PipelineSource, DEFAULT_DATABASE_PORT,
    DEFAULT_EMBED_BATCH_SIZE, DEFAULT_PIPELINE_VERSION, KNOWLEDGE_BASE_FINALIZER,
};
pub use types::{Condition, ConditionStatus, Phase, SecretKeyRef};

/// API group of all operator CRDs
pub const API_GROUP: &str = "akamai.io";

/// Status fields the reconcilers manage uniformly across kinds
pub trait ManagedStatus: Clone + Default + PartialEq + serde::Serialize {
    /// Current phase
    fn phase(&self) -> Phase;
    /// Set the phase
    fn set_phase(&mut self, phase: Phase);
    /// Consecutive failures
    fn retry_count(&self) -> u32;
    /// Set the consecutive failure count
    fn set_retry_count(&mut self, count: u32);
    /// Spec hash the status was computed for
    fn spec_hash(&self) -> Option<&str>;
    /// Set the summary message
    fn set_message(&mut self, message: Option<String>);
    /// Conditions, for merging
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    /// Record the generation acted on
    fn set_observed_generation(&mut self, generation: Option<i64>);
    /// Stamp the write time
    fn set_last_updated(&mut self, at: DateTime<Utc>);
    /// Adopt a new spec hash, clearing per-spec progress
    fn reset_for_spec(&mut self, spec_hash: &str);
}
