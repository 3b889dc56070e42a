//! Process-level operator configuration
//!
//! Every setting is a CLI flag with an environment-variable fallback, so the
//! same binary works from a Deployment manifest and from a shell.

use std::time::Duration;

use clap::Args;

use crate::crd::{GitOpsSource, ProviderKind};

/// Default Git repository holding the agent Helm chart
pub const DEFAULT_AGENT_CHART_REPO_URL: &str = "https://github.com/linode/ai-operators.git";

/// Default chart revision
pub const DEFAULT_AGENT_CHART_REVISION: &str = "main";

/// Default chart path inside the repository
pub const DEFAULT_AGENT_CHART_PATH: &str = "agent";

/// Default namespace of the Argo CD installation
pub const DEFAULT_ARGOCD_NAMESPACE: &str = "argocd";

/// Default agent container image for the direct provider
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/linode/ai-operators/agent:main";

/// Default name of the ConfigMap listing pipeline sources
pub const DEFAULT_PIPELINES_CONFIGMAP: &str = "pipelines";

fn parse_provider(value: &str) -> Result<ProviderKind, String> {
    ProviderKind::parse(value).map_err(|e| e.to_string())
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("expected whole seconds: {e}"))
}

/// Operator settings shared by all controllers
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Default deployment backend for Agents (direct|linode|gitops|apl)
    #[arg(long, env = "PROVIDER", default_value = "apl", value_parser = parse_provider)]
    pub provider: ProviderKind,

    /// Git repository holding the agent Helm chart
    #[arg(long, env = "AGENT_CHART_REPO_URL", default_value = DEFAULT_AGENT_CHART_REPO_URL)]
    pub agent_chart_repo_url: String,

    /// Chart revision (branch, tag or commit)
    #[arg(long, env = "AGENT_CHART_REPO_REVISION", default_value = DEFAULT_AGENT_CHART_REVISION)]
    pub agent_chart_repo_revision: String,

    /// Chart path inside the repository
    #[arg(long, env = "AGENT_CHART_PATH", default_value = DEFAULT_AGENT_CHART_PATH)]
    pub agent_chart_path: String,

    /// Namespace Argo CD watches for Applications
    #[arg(long, env = "ARGOCD_NAMESPACE", default_value = DEFAULT_ARGOCD_NAMESPACE)]
    pub argocd_namespace: String,

    /// Agent container image used by the direct provider
    #[arg(long, env = "AGENT_IMAGE", default_value = DEFAULT_AGENT_IMAGE)]
    pub agent_image: String,

    /// Base URL of the Kubeflow Pipelines API; the knowledge-base controller
    /// and pipeline sync are disabled without it
    #[arg(long, env = "KUBEFLOW_ENDPOINT")]
    pub kubeflow_endpoint: Option<String>,

    /// Comma-separated namespaces to watch; all namespaces when empty
    #[arg(long, env = "WATCH_NAMESPACES", value_delimiter = ',')]
    pub watch_namespaces: Vec<String>,

    /// Objects reconciled concurrently per controller
    #[arg(long, env = "WORKERS", default_value_t = 8)]
    pub workers: u16,

    /// Namespace the operator runs in (holds the pipelines ConfigMap)
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub operator_namespace: String,

    /// ConfigMap listing pipeline sources to keep uploaded
    #[arg(long, env = "PIPELINES_CONFIGMAP", default_value = DEFAULT_PIPELINES_CONFIGMAP)]
    pub pipelines_configmap: String,

    /// Seconds between reads of the pipelines ConfigMap
    #[arg(long, env = "PIPELINE_CONFIG_INTERVAL", default_value = "30", value_parser = parse_seconds)]
    pub pipeline_config_interval: Duration,

    /// Seconds between fetches of each pipeline source
    #[arg(long, env = "PIPELINE_FETCH_INTERVAL", default_value = "10", value_parser = parse_seconds)]
    pub pipeline_fetch_interval: Duration,
}

impl OperatorConfig {
    /// Chart coordinates used when an Agent does not override them
    pub fn default_chart_source(&self) -> GitOpsSource {
        GitOpsSource {
            repo_url: self.agent_chart_repo_url.clone(),
            revision: self.agent_chart_repo_revision.clone(),
            path: self.agent_chart_path.clone(),
        }
    }

    /// Namespaces to watch, with blanks removed; empty means cluster-wide
    pub fn namespaces(&self) -> Vec<String> {
        self.watch_namespaces
            .iter()
            .map(|ns| ns.trim())
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect()
    }
}
