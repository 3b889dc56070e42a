//! Agent CRD types
//!
//! An `Agent` is an LLM agent backed by a foundation model served in the
//! cluster, optionally equipped with knowledge-base tools. The agent
//! controller resolves the model service and tools, renders the agent
//! configuration and deploys it through a [`ProviderKind`] backend.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, Phase};
use super::ManagedStatus;
use crate::Error;

/// Default completion token limit
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// Tool type resolved against a KnowledgeBase in the Agent's namespace
pub const TOOL_TYPE_KNOWLEDGE_BASE: &str = "knowledgeBase";

/// Finalizer blocking removal until the deployment artifact is removed
pub const AGENT_FINALIZER: &str = "akamai.io/agent-cleanup";

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

/// Deployment backend for agents
///
/// Parsed from free-form strings so the process-level `PROVIDER` setting and
/// the per-Agent override accept the same spellings.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// ConfigMap, Deployment and Service applied straight to the cluster
    Direct,
    /// Argo CD Application rendering the agent Helm chart
    GitOps,
}

impl ProviderKind {
    /// Both providers
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Direct, ProviderKind::GitOps];

    /// Parse a provider name
    ///
    /// `direct` and `linode` select [`ProviderKind::Direct`]; `gitops` and
    /// `apl` select [`ProviderKind::GitOps`]. Anything else is a
    /// configuration error.
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" | "linode" => Ok(Self::Direct),
            "gitops" | "apl" => Ok(Self::GitOps),
            other => Err(Error::validation_for_field(
                "agent",
                "spec.provider",
                format!("unknown provider '{other}', expected one of: direct, linode, gitops, apl"),
            )),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::GitOps => write!(f, "gitops"),
        }
    }
}

/// Tool made available to the agent
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    /// Tool name; for knowledge-base tools, the KnowledgeBase name
    pub name: String,

    /// Tool type (e.g. `knowledgeBase`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Description shown to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolSpec {
    /// Whether this tool is backed by a KnowledgeBase
    pub fn is_knowledge_base(&self) -> bool {
        self.type_ == TOOL_TYPE_KNOWLEDGE_BASE
    }
}

/// Routing hint passed through to the agent
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Route name
    pub name: String,

    /// What the route handles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Example utterances
    #[serde(default)]
    pub examples: Vec<String>,
}

/// Chart coordinates overriding the operator defaults
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsSource {
    /// Git repository URL
    pub repo_url: String,
    /// Branch, tag or commit
    pub revision: String,
    /// Chart path inside the repository
    pub path: String,
}

/// Specification for an Agent
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "akamai.io",
    version = "v1alpha1",
    kind = "Agent",
    plural = "agents",
    shortname = "agt",
    namespaced,
    status = "AgentStatus",
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.foundationModel"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".status.deploymentRef.provider"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Foundation model, matched against the `modelName` Service label
    pub foundation_model: String,

    /// Restrict model discovery to this namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_namespace: Option<String>,

    /// System prompt
    pub agent_instructions: String,

    /// Completion token limit
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Deployment backend (`direct` or `gitops`), defaults to the operator setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Tools
    #[serde(default)]
    pub tools: Vec<ToolSpec>,

    /// Routes
    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    /// Chart coordinates for the GitOps provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitops: Option<GitOpsSource>,
}

impl AgentSpec {
    /// Validate fields the schema cannot express
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        if self.foundation_model.trim().is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.foundationModel",
                "foundationModel cannot be empty",
            ));
        }
        if self.max_tokens == 0 {
            return Err(Error::validation_for_field(
                resource,
                "spec.maxTokens",
                "maxTokens must be greater than zero",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.replace('-', "_")) {
                return Err(Error::validation_for_field(
                    resource,
                    "spec.tools",
                    format!("duplicate tool name '{}'", tool.name),
                ));
            }
        }
        Ok(())
    }
}

/// Where an Agent's deployment artifact lives
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRef {
    /// Provider that owns the artifact
    pub provider: ProviderKind,
    /// Artifact name
    pub name: String,
    /// Artifact namespace
    pub namespace: String,
}

/// Status of an Agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Current phase
    #[serde(default)]
    pub phase: Phase,

    /// Generation last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Resolved foundation model endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_endpoint: Option<String>,

    /// Deployed artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_ref: Option<DeploymentRef>,

    /// Hash of the spec the status describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,

    /// Consecutive failed attempts
    #[serde(default)]
    pub retry_count: u32,

    /// Human-readable summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Time of the last status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ManagedStatus for AgentStatus {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn set_retry_count(&mut self, count: u32) {
        self.retry_count = count;
    }

    fn spec_hash(&self) -> Option<&str> {
        self.spec_hash.as_deref()
    }

    fn set_message(&mut self, message: Option<String>) {
        self.message = message;
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn set_observed_generation(&mut self, generation: Option<i64>) {
        self.observed_generation = generation;
    }

    fn set_last_updated(&mut self, at: DateTime<Utc>) {
        self.last_updated = Some(at);
    }

    // deploymentRef survives a spec change: it is what a provider switch removes
    fn reset_for_spec(&mut self, spec_hash: &str) {
        self.spec_hash = Some(spec_hash.to_string());
        self.retry_count = 0;
        self.message = None;
    }
}
