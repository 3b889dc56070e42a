//! Direct provider
//!
//! Renders the agent workload (ConfigMap with `agent.json`, Deployment and
//! Service, all named `agent-<name>`) and applies it with server-side apply.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use aiop_common::crd::{DeploymentRef, ProviderKind};
use aiop_common::kube_utils::{deterministic_hash, managed_labels, FIELD_MANAGER};
use aiop_common::retry::{retry_with_backoff, RetryConfig};
use aiop_common::{Error, LABEL_NAME};

use super::{direct_artifact_name, AgentDeployment, DeploymentProvider, AGENT_COMPONENT};
use crate::config::AGENT_CONFIG_KEY;

/// Port the agent container listens on
pub const AGENT_PORT: i32 = 8000;

/// Directory the configuration is mounted at
const CONFIG_MOUNT_PATH: &str = "/etc/agent";

/// Pod annotation carrying the configuration hash, so edits roll the pods
pub const CONFIG_HASH_ANNOTATION: &str = "akamai.io/config-hash";

/// Cluster operations used by the direct provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Server-side apply a ConfigMap
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Server-side apply a Deployment
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Server-side apply a Service
    async fn apply_service(&self, service: &Service) -> Result<(), Error>;

    /// Delete the ConfigMap, Deployment and Service named `name`; 404 is ok
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Whether the Deployment named `name` exists
    async fn deployment_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// Real [`WorkloadApi`] backed by the cluster
pub struct KubeWorkloadApi {
    client: Client,
    retry: RetryConfig,
}

impl KubeWorkloadApi {
    /// Create a new KubeWorkloadApi wrapping the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }

    async fn apply<K>(&self, object: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let meta = object.meta();
        let (Some(name), Some(namespace)) = (meta.name.as_deref(), meta.namespace.as_deref())
        else {
            return Err(Error::internal_with_context(
                "direct-provider",
                format!("{} without name or namespace", K::kind(&())),
            ));
        };
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        retry_with_backoff(&self.retry, "apply_agent_object", || async {
            api.patch(name, &params, &Patch::Apply(object))
                .await
                .map(|_| ())
                .map_err(Error::from)
        })
        .await
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        retry_with_backoff(&self.retry, "delete_agent_object", || async {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        self.apply(config_map).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.apply(deployment).await
    }

    async fn apply_service(&self, service: &Service) -> Result<(), Error> {
        self.apply(service).await
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete::<Service>(namespace, name).await?;
        self.delete::<Deployment>(namespace, name).await?;
        self.delete::<ConfigMap>(namespace, name).await
    }

    async fn deployment_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        retry_with_backoff(&self.retry, "get_agent_deployment", || async {
            api.get_opt(name)
                .await
                .map(|d| d.is_some())
                .map_err(Error::from)
        })
        .await
    }
}

/// Deploys agents as plain workloads in their own namespace
pub struct DirectProvider {
    api: Arc<dyn WorkloadApi>,
    image: String,
}

impl DirectProvider {
    /// Create a provider deploying `image`
    pub fn new(api: Arc<dyn WorkloadApi>, image: impl Into<String>) -> Self {
        Self {
            api,
            image: image.into(),
        }
    }
}

fn metadata(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(managed_labels(name, AGENT_COMPONENT)),
        ..Default::default()
    }
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_NAME.to_string(), name.to_string())])
}

/// ConfigMap holding `agent.json`
pub fn render_config_map(name: &str, namespace: &str, config_json: &str) -> ConfigMap {
    ConfigMap {
        metadata: metadata(name, namespace),
        data: Some(BTreeMap::from([(
            AGENT_CONFIG_KEY.to_string(),
            config_json.to_string(),
        )])),
        ..Default::default()
    }
}

/// Single-replica Deployment running the agent image
pub fn render_deployment(name: &str, namespace: &str, image: &str, config_json: &str) -> Deployment {
    let mut pod_labels = managed_labels(name, AGENT_COMPONENT);
    pod_labels.extend(selector_labels(name));

    Deployment {
        metadata: metadata(name, namespace),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(BTreeMap::from([(
                        CONFIG_HASH_ANNOTATION.to_string(),
                        deterministic_hash(config_json),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "agent".to_string(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: AGENT_PORT,
                            ..Default::default()
                        }]),
                        env: Some(vec![EnvVar {
                            name: "AGENT_CONFIG_PATH".to_string(),
                            value: Some(format!("{CONFIG_MOUNT_PATH}/{AGENT_CONFIG_KEY}")),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "config".to_string(),
                            mount_path: CONFIG_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: name.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP Service in front of the agent
pub fn render_service(name: &str, namespace: &str) -> Service {
    Service {
        metadata: metadata(name, namespace),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(name)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(IntOrString::String("http".to_string())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl DeploymentProvider for DirectProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Direct
    }

    fn artifact_ref(&self, namespace: &str, name: &str) -> DeploymentRef {
        DeploymentRef {
            provider: ProviderKind::Direct,
            name: direct_artifact_name(name),
            namespace: namespace.to_string(),
        }
    }

    async fn ensure_deployed(&self, deployment: &AgentDeployment) -> Result<DeploymentRef, Error> {
        let artifact = self.artifact_ref(&deployment.namespace, &deployment.name);
        let config_json = deployment.config.to_json()?;
        let (name, namespace) = (artifact.name.as_str(), artifact.namespace.as_str());

        self.api
            .apply_config_map(&render_config_map(name, namespace, &config_json))
            .await?;
        self.api
            .apply_deployment(&render_deployment(name, namespace, &self.image, &config_json))
            .await?;
        self.api
            .apply_service(&render_service(name, namespace))
            .await?;

        info!(agent = %deployment.name, artifact = %name, "agent workload applied");
        Ok(artifact)
    }

    async fn ensure_removed(&self, artifact: &DeploymentRef) -> Result<(), Error> {
        debug!(artifact = %artifact.name, "removing agent workload");
        self.api
            .delete_workload(&artifact.namespace, &artifact.name)
            .await
    }

    async fn exists(&self, artifact: &DeploymentRef) -> Result<bool, Error> {
        self.api
            .deployment_exists(&artifact.namespace, &artifact.name)
            .await
    }
}
