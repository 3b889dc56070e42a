//! Deployment provider abstraction
//!
//! An Agent is deployed through exactly one backend at a time. Each backend
//! implements [`DeploymentProvider`]; [`Providers`] holds one instance per
//! [`ProviderKind`] and hands out the one a resource asks for.
//!
//! # Supported Providers
//!
//! - [`DirectProvider`] - ConfigMap, Deployment and Service applied to the cluster
//! - [`GitOpsProvider`] - Argo CD Application rendering the agent Helm chart

mod direct;
mod gitops;

pub use direct::{DirectProvider, KubeWorkloadApi, WorkloadApi};
pub use gitops::{render_application, GitOpsClient, GitOpsProvider, KubeGitOpsClient};

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use aiop_common::crd::{DeploymentRef, GitOpsSource, ProviderKind};
use aiop_common::kube_utils::artifact_name;
use aiop_common::Error;

use crate::config::AgentConfig;

/// Component label value on agent artifacts
pub const AGENT_COMPONENT: &str = "agent";

/// Everything a provider needs to deploy one agent
#[derive(Clone, Debug, PartialEq)]
pub struct AgentDeployment {
    /// Agent name
    pub name: String,
    /// Agent namespace (where the workload runs)
    pub namespace: String,
    /// Rendered agent configuration
    pub config: AgentConfig,
    /// Chart coordinates for the GitOps provider
    pub chart: GitOpsSource,
}

/// Name of the direct provider's ConfigMap, Deployment and Service
pub fn direct_artifact_name(name: &str) -> String {
    artifact_name(&["agent", name])
}

/// Name of the GitOps provider's Application
///
/// Applications share the Argo CD namespace, so the Agent namespace is part
/// of the name.
pub fn application_name(namespace: &str, name: &str) -> String {
    artifact_name(&["agent", namespace, name])
}

/// A backend that deploys agents
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentProvider: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> ProviderKind;

    /// Deterministic reference of the artifact for an Agent
    fn artifact_ref(&self, namespace: &str, name: &str) -> DeploymentRef;

    /// Create or update the artifact; repeated calls converge on one artifact
    async fn ensure_deployed(&self, deployment: &AgentDeployment) -> Result<DeploymentRef, Error>;

    /// Delete the artifact; already-absent artifacts are not an error
    async fn ensure_removed(&self, artifact: &DeploymentRef) -> Result<(), Error>;

    /// Whether the artifact exists
    async fn exists(&self, artifact: &DeploymentRef) -> Result<bool, Error>;
}

/// One provider per [`ProviderKind`]
#[derive(Clone)]
pub struct Providers {
    direct: Arc<dyn DeploymentProvider>,
    gitops: Arc<dyn DeploymentProvider>,
}

impl Providers {
    /// Create the provider set
    pub fn new(direct: Arc<dyn DeploymentProvider>, gitops: Arc<dyn DeploymentProvider>) -> Self {
        Self { direct, gitops }
    }

    /// Provider for `kind`
    pub fn get(&self, kind: ProviderKind) -> &dyn DeploymentProvider {
        match kind {
            ProviderKind::Direct => self.direct.as_ref(),
            ProviderKind::GitOps => self.gitops.as_ref(),
        }
    }
}

/// Provider an Agent asks for, falling back to the operator default
pub fn resolve_kind(requested: Option<&str>, default: ProviderKind) -> Result<ProviderKind, Error> {
    requested.map_or(Ok(default), ProviderKind::parse)
}
