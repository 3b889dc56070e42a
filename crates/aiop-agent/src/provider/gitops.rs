//! GitOps provider
//!
//! Deploys an agent by handing Argo CD an `Application` that renders the
//! agent Helm chart with the agent configuration as values. Argo CD owns the
//! workload; removal only deletes the Application and Argo CD prunes the rest.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use aiop_common::crd::{DeploymentRef, GitOpsSource, ProviderKind};
use aiop_common::kube_utils::{managed_labels, FIELD_MANAGER};
use aiop_common::retry::{retry_with_backoff, RetryConfig};
use aiop_common::Error;

use super::{application_name, AgentDeployment, DeploymentProvider, AGENT_COMPONENT};

/// Argo CD API group
pub const ARGOCD_GROUP: &str = "argoproj.io";

/// Argo CD API version
pub const ARGOCD_VERSION: &str = "v1alpha1";

/// Cluster the Applications deploy into
const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";

fn application_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        ARGOCD_GROUP,
        ARGOCD_VERSION,
        "Application",
    ))
}

/// Access to Argo CD Application objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GitOpsClient: Send + Sync {
    /// Create or update an Application (server-side apply)
    async fn apply_application(&self, namespace: &str, name: &str, application: &Value)
        -> Result<(), Error>;

    /// Delete an Application; 404 is ok
    async fn delete_application(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get an Application, `None` when absent
    async fn get_application(&self, namespace: &str, name: &str) -> Result<Option<Value>, Error>;
}

/// Real [`GitOpsClient`] using dynamic objects
pub struct KubeGitOpsClient {
    client: Client,
    retry: RetryConfig,
}

impl KubeGitOpsClient {
    /// Create a new KubeGitOpsClient wrapping the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &application_resource())
    }
}

#[async_trait]
impl GitOpsClient for KubeGitOpsClient {
    async fn apply_application(
        &self,
        namespace: &str,
        name: &str,
        application: &Value,
    ) -> Result<(), Error> {
        let object: DynamicObject = serde_json::from_value(application.clone())
            .map_err(|e| Error::serialization_for_kind("Application", e.to_string()))?;
        let api = self.api(namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        retry_with_backoff(&self.retry, "apply_application", || async {
            api.patch(name, &params, &Patch::Apply(&object))
                .await
                .map(|_| ())
                .map_err(Error::from)
        })
        .await
    }

    async fn delete_application(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api = self.api(namespace);
        retry_with_backoff(&self.retry, "delete_application", || async {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }

    async fn get_application(&self, namespace: &str, name: &str) -> Result<Option<Value>, Error> {
        let api = self.api(namespace);
        let found = retry_with_backoff(&self.retry, "get_application", || async {
            api.get_opt(name).await.map_err(Error::from)
        })
        .await?;
        found.map(serde_json::to_value).transpose().map_err(Error::from)
    }
}

/// Render the Argo CD Application for an agent
pub fn render_application(
    name: &str,
    argocd_namespace: &str,
    target_namespace: &str,
    chart: &GitOpsSource,
    helm_values: &str,
) -> Value {
    json!({
        "apiVersion": format!("{ARGOCD_GROUP}/{ARGOCD_VERSION}"),
        "kind": "Application",
        "metadata": {
            "name": name,
            "namespace": argocd_namespace,
            "annotations": {
                "argocd.argoproj.io/compare-options": "ServerSideDiff=true,IncludeMutationWebhook=true"
            },
            "labels": managed_labels(name, AGENT_COMPONENT),
        },
        "spec": {
            "project": "default",
            "source": {
                "repoURL": chart.repo_url,
                "path": chart.path,
                "targetRevision": chart.revision,
                "helm": { "values": helm_values },
            },
            "destination": {
                "server": IN_CLUSTER_SERVER,
                "namespace": target_namespace,
            },
            "syncPolicy": {
                "automated": { "prune": true, "allowEmpty": false, "selfHeal": true },
                "syncOptions": ["ServerSideApply=true"],
            },
        },
    })
}

/// Deploys agents through Argo CD
pub struct GitOpsProvider {
    client: Arc<dyn GitOpsClient>,
    argocd_namespace: String,
}

impl GitOpsProvider {
    /// Create a provider writing Applications into `argocd_namespace`
    pub fn new(client: Arc<dyn GitOpsClient>, argocd_namespace: impl Into<String>) -> Self {
        Self {
            client,
            argocd_namespace: argocd_namespace.into(),
        }
    }
}

#[async_trait]
impl DeploymentProvider for GitOpsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitOps
    }

    fn artifact_ref(&self, namespace: &str, name: &str) -> DeploymentRef {
        DeploymentRef {
            provider: ProviderKind::GitOps,
            name: application_name(namespace, name),
            namespace: self.argocd_namespace.clone(),
        }
    }

    async fn ensure_deployed(&self, deployment: &AgentDeployment) -> Result<DeploymentRef, Error> {
        let artifact = self.artifact_ref(&deployment.namespace, &deployment.name);
        let application = render_application(
            &artifact.name,
            &artifact.namespace,
            &deployment.namespace,
            &deployment.chart,
            &deployment.config.helm_values()?,
        );
        self.client
            .apply_application(&artifact.namespace, &artifact.name, &application)
            .await?;
        info!(agent = %deployment.name, application = %artifact.name, "argo cd application applied");
        Ok(artifact)
    }

    async fn ensure_removed(&self, artifact: &DeploymentRef) -> Result<(), Error> {
        debug!(application = %artifact.name, "requesting application deletion");
        self.client
            .delete_application(&artifact.namespace, &artifact.name)
            .await
    }

    async fn exists(&self, artifact: &DeploymentRef) -> Result<bool, Error> {
        Ok(self
            .client
            .get_application(&artifact.namespace, &artifact.name)
            .await?
            .is_some())
    }
}
