//! Agent controller implementation
//!
//! Resolves an Agent's foundation model and tools, renders its configuration
//! and deploys it through the provider the Agent (or the operator default)
//! selects. Exactly one deployment artifact exists per Agent; switching
//! providers removes the old artifact before the new one is created.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use aiop_common::config::OperatorConfig;
use aiop_common::crd::{
    Agent, AgentStatus, DeploymentRef, GitOpsSource, KnowledgeBase, ManagedStatus, Phase,
    ProviderKind, AGENT_FINALIZER,
};
use aiop_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use aiop_common::kube_utils::{
    finalizer_patch, finalizers_with, finalizers_without, has_finalizer, spec_hash, status_patch,
};
use aiop_common::metrics::ReconcileTimer;
use aiop_common::outcome::{PHASE_STEP_DELAY, RESYNC_INTERVAL};
use aiop_common::retry::{retry_with_backoff, RetryConfig};
use aiop_common::status::{
    apply_outcome, begin_deletion, cleanup_delay, record_cleanup_failure, update_status,
    StatusWrite, MAX_CLEANUP_ATTEMPTS,
};
use aiop_common::{Error, ReconciliationOutcome};

use crate::config::AgentConfig;
use crate::discovery::{model_selector, select_model_service, ModelService};
use crate::error::AgentError;
use crate::provider::{
    resolve_kind, AgentDeployment, DirectProvider, GitOpsProvider, KubeGitOpsClient,
    KubeWorkloadApi, Providers,
};

/// Trait abstracting Kubernetes client operations for Agent
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get an Agent, `None` when it no longer exists
    async fn get_agent(&self, namespace: &str, name: &str) -> Result<Option<Agent>, Error>;

    /// Replace the status, failing with 409 unless `resource_version` is current
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &AgentStatus,
    ) -> Result<(), Error>;

    /// Replace the finalizer list
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// List Services matching `selector`, in `namespace` or cluster-wide
    async fn list_services(
        &self,
        namespace: Option<String>,
        selector: &str,
    ) -> Result<Vec<Service>, Error>;

    /// Get a KnowledgeBase by name and namespace
    async fn get_knowledge_base(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KnowledgeBase>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    retry: RetryConfig,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }

    fn api(&self, namespace: &str) -> Api<Agent> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_agent(&self, namespace: &str, name: &str) -> Result<Option<Agent>, Error> {
        let api = self.api(namespace);
        retry_with_backoff(&self.retry, "get_agent", || async {
            api.get_opt(name).await.map_err(Error::from)
        })
        .await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &AgentStatus,
    ) -> Result<(), Error> {
        let api = self.api(namespace);
        let patch = status_patch(resource_version, status);
        retry_with_backoff(&self.retry, "patch_agent_status", || async {
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map(|_| ())
                .map_err(Error::from)
        })
        .await
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let api = self.api(namespace);
        let patch = finalizer_patch(finalizers, resource_version.as_deref());
        retry_with_backoff(&self.retry, "set_agent_finalizers", || async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map(|_| ())
                .map_err(Error::from)
        })
        .await
    }

    async fn list_services(
        &self,
        namespace: Option<String>,
        selector: &str,
    ) -> Result<Vec<Service>, Error> {
        let api: Api<Service> = match &namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(selector);
        retry_with_backoff(&self.retry, "list_model_services", || async {
            api.list(&params)
                .await
                .map(|list| list.items)
                .map_err(Error::from)
        })
        .await
    }

    async fn get_knowledge_base(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KnowledgeBase>, Error> {
        let api: Api<KnowledgeBase> = Api::namespaced(self.client.clone(), namespace);
        retry_with_backoff(&self.retry, "get_knowledge_base", || async {
            api.get_opt(name).await.map_err(Error::from)
        })
        .await
    }
}

/// Controller context for Agent reconciliation
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// One deployment provider per kind
    pub providers: Providers,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Provider for Agents that do not name one
    pub default_provider: ProviderKind,
    /// Chart coordinates for Agents that do not override them
    pub chart: GitOpsSource,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: &OperatorConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        providers: Providers,
        default_provider: ProviderKind,
    ) -> Self {
        Self {
            kube,
            providers,
            events: Arc::new(aiop_common::events::NoopEventPublisher),
            default_provider,
            chart: GitOpsSource {
                repo_url: aiop_common::config::DEFAULT_AGENT_CHART_REPO_URL.to_string(),
                revision: aiop_common::config::DEFAULT_AGENT_CHART_REVISION.to_string(),
                path: aiop_common::config::DEFAULT_AGENT_CHART_PATH.to_string(),
            },
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    default_provider: ProviderKind,
    chart: GitOpsSource,
    agent_image: String,
    argocd_namespace: String,
    kube: Option<Arc<dyn KubeClient>>,
    providers: Option<Providers>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            client,
            default_provider: config.provider,
            chart: config.default_chart_source(),
            agent_image: config.agent_image.clone(),
            argocd_namespace: config.argocd_namespace.clone(),
            kube: None,
            providers: None,
            events: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the deployment providers
    pub fn providers(mut self, providers: Providers) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let providers = self.providers.unwrap_or_else(|| {
            Providers::new(
                Arc::new(DirectProvider::new(
                    Arc::new(KubeWorkloadApi::new(client.clone())),
                    self.agent_image,
                )),
                Arc::new(GitOpsProvider::new(
                    Arc::new(KubeGitOpsClient::new(client.clone())),
                    self.argocd_namespace,
                )),
            )
        });
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(client.clone()))),
            providers,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(client, "agent-controller"))),
            default_provider: self.default_provider,
            chart: self.chart,
        }
    }
}

/// Error policy for the Agent controller
pub fn error_policy(agent: Arc<Agent>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        agent = %agent.name_any(),
        namespace = %agent.namespace().unwrap_or_default(),
        error = %error,
        "reconcile failed, will retry"
    );
    Action::requeue(Duration::from_secs(30))
}

/// One reconcile pass over a namespaced Agent
struct Pass<'a> {
    agent: &'a Agent,
    ctx: &'a Context,
    name: String,
    namespace: String,
    status: AgentStatus,
}

impl Pass<'_> {
    /// Read-modify-write the status, stamping the observed generation
    async fn write_status<M>(&self, mutate: M) -> Result<StatusWrite, Error>
    where
        M: Fn(&mut AgentStatus) + Send + Sync,
    {
        let kube = self.ctx.kube.as_ref();
        let (namespace, name) = (self.namespace.as_str(), self.name.as_str());
        let generation = self.agent.metadata.generation;
        update_status(
            || kube.get_agent(namespace, name),
            |rv: String, status: AgentStatus| async move {
                kube.patch_status(namespace, name, &rv, &status).await
            },
            |status: &mut AgentStatus| {
                status.set_observed_generation(generation);
                mutate(status);
            },
        )
        .await
    }

    async fn record(&self, outcome: ReconciliationOutcome) -> Result<Action, Error> {
        self.write_status(|status| apply_outcome(status, &outcome))
            .await?;
        if let ReconciliationOutcome::Fatal { kind, message } = &outcome {
            warn!(%kind, %message, "agent failed");
            self.publish(
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(message.clone()),
            )
            .await;
        }
        Ok(outcome.action())
    }

    /// Record a resolution failure with its specific reason
    async fn record_agent_error(&self, e: AgentError) -> Result<Action, Error> {
        let reason = e.reason();
        let error: Error = e.into();
        self.record(ReconciliationOutcome::from_error(
            &error,
            reason,
            self.status.retry_count,
        ))
        .await
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let object_ref = self.agent.object_ref(&());
        self.ctx
            .events
            .publish(&object_ref, type_, reason, action, note)
            .await;
    }

    fn provider_kind(&self) -> Result<ProviderKind, Error> {
        resolve_kind(
            self.agent.spec.provider.as_deref(),
            self.ctx.default_provider,
        )
    }

    /// The one Service serving the foundation model
    async fn discover_model(&self) -> Result<ModelService, AgentError> {
        let spec = &self.agent.spec;
        let scope = spec.model_namespace.clone();
        let services = self
            .ctx
            .kube
            .list_services(scope.clone(), &model_selector(&spec.foundation_model))
            .await?;
        select_model_service(&spec.foundation_model, scope.as_deref(), &services)
    }

    /// KnowledgeBases behind the Agent's knowledge-base tools, by tool name
    async fn knowledge_bases(&self) -> Result<BTreeMap<String, KnowledgeBase>, AgentError> {
        let mut found = BTreeMap::new();
        for tool in self.agent.spec.tools.iter().filter(|t| t.is_knowledge_base()) {
            let kb = self
                .ctx
                .kube
                .get_knowledge_base(&self.namespace, &tool.name)
                .await?
                .ok_or_else(|| AgentError::KnowledgeBaseNotFound {
                    name: tool.name.clone(),
                    namespace: self.namespace.clone(),
                })?;
            found.insert(tool.name.clone(), kb);
        }
        Ok(found)
    }

    /// Every artifact that may exist for this Agent
    fn cleanup_targets(&self) -> Vec<DeploymentRef> {
        let mut targets: Vec<DeploymentRef> = self.status.deployment_ref.iter().cloned().collect();
        for kind in ProviderKind::ALL {
            let artifact = self
                .ctx
                .providers
                .get(kind)
                .artifact_ref(&self.namespace, &self.name);
            if !targets.contains(&artifact) {
                targets.push(artifact);
            }
        }
        targets
    }
}

/// Reconcile an Agent
#[instrument(skip(agent, ctx), fields(agent = %agent.name_any()))]
pub async fn reconcile(agent: Arc<Agent>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start("Agent");
    let result = reconcile_pass(agent, ctx).await;
    timer.finish(&result);
    result
}

async fn reconcile_pass(agent: Arc<Agent>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = agent.namespace().ok_or_else(|| {
        Error::validation_for_field(agent.name_any(), "metadata.namespace", "Agent must be namespaced")
    })?;
    let pass = Pass {
        agent: agent.as_ref(),
        ctx: ctx.as_ref(),
        name: agent.name_any(),
        namespace,
        status: agent.status.clone().unwrap_or_default(),
    };
    debug!(phase = %pass.status.phase, "reconciling agent");

    if agent.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&pass).await;
    }

    if !has_finalizer(&agent.metadata, AGENT_FINALIZER) {
        info!("adding finalizer");
        ctx.kube
            .set_finalizers(
                &pass.namespace,
                &pass.name,
                finalizers_with(&agent.metadata, AGENT_FINALIZER),
                agent.resource_version(),
            )
            .await?;
        return Ok(Action::requeue(PHASE_STEP_DELAY));
    }

    let hash = spec_hash(&agent.spec, &agent.metadata)?;
    if pass.status.spec_hash.as_deref() != Some(hash.as_str()) {
        return start_resolving(&pass, &hash).await;
    }

    match pass.status.phase {
        Phase::Pending | Phase::Resolving => resolve(&pass).await,
        Phase::Provisioning => provision(&pass).await,
        Phase::Ready => verify_ready(&pass).await,
        Phase::Failed => Ok(Action::await_change()),
        Phase::Deleting => start_resolving(&pass, &hash).await,
    }
}

async fn start_resolving(pass: &Pass<'_>, hash: &str) -> Result<Action, Error> {
    info!(spec_hash = %hash, "spec changed, resolving");
    pass.write_status(|status| {
        status.reset_for_spec(hash);
        apply_outcome(
            status,
            &ReconciliationOutcome::advance(Phase::Resolving, "resolving foundation model"),
        );
    })
    .await?;
    pass.publish(
        EventType::Normal,
        reasons::RESOLVING_STARTED,
        actions::RECONCILE,
        None,
    )
    .await;
    Ok(Action::requeue(PHASE_STEP_DELAY))
}

/// Resolving: validate, pick the provider, find the model and the tools
async fn resolve(pass: &Pass<'_>) -> Result<Action, Error> {
    let retry_count = pass.status.retry_count;

    if let Err(e) = pass.agent.spec.validate(&pass.name) {
        return pass.record(ReconciliationOutcome::from_error(&e, "InvalidSpec", retry_count)).await;
    }
    if let Err(e) = pass.provider_kind() {
        return pass.record(ReconciliationOutcome::from_error(&e, "InvalidProvider", retry_count)).await;
    }
    let model = match pass.discover_model().await {
        Ok(model) => model,
        Err(e) => return pass.record_agent_error(e).await,
    };
    if let Err(e) = pass.knowledge_bases().await {
        return pass.record_agent_error(e).await;
    }

    let endpoint = model.endpoint();
    info!(%endpoint, "foundation model resolved");
    let outcome = ReconciliationOutcome::advance(
        Phase::Provisioning,
        format!("foundation model served at {endpoint}"),
    );
    pass.write_status(|status| {
        status.model_endpoint = Some(endpoint.clone());
        apply_outcome(status, &outcome);
    })
    .await?;
    Ok(outcome.action())
}

/// Provisioning: remove an artifact left by another provider, then deploy
async fn provision(pass: &Pass<'_>) -> Result<Action, Error> {
    let retry_count = pass.status.retry_count;
    let kind = match pass.provider_kind() {
        Ok(kind) => kind,
        Err(e) => {
            return pass
                .record(ReconciliationOutcome::from_error(&e, "InvalidProvider", retry_count))
                .await;
        }
    };
    let Some(endpoint) = pass.status.model_endpoint.clone() else {
        return pass
            .record(ReconciliationOutcome::advance(
                Phase::Resolving,
                "model endpoint unknown, resolving again",
            ))
            .await;
    };
    let knowledge_bases = match pass.knowledge_bases().await {
        Ok(kbs) => kbs,
        Err(e) => return pass.record_agent_error(e).await,
    };

    if let Some(previous) = pass.status.deployment_ref.as_ref().filter(|r| r.provider != kind) {
        info!(from = %previous.provider, to = %kind, "provider changed, removing previous artifact");
        if let Err(e) = pass.ctx.providers.get(previous.provider).ensure_removed(previous).await {
            return pass
                .record(ReconciliationOutcome::from_error(&e, "ProviderSwitchFailed", retry_count))
                .await;
        }
        pass.publish(
            EventType::Normal,
            reasons::PROVIDER_SWITCHED,
            actions::DEPLOY,
            Some(format!("{} -> {kind}", previous.provider)),
        )
        .await;
    }

    let deployment = AgentDeployment {
        name: pass.name.clone(),
        namespace: pass.namespace.clone(),
        config: AgentConfig::build(pass.agent, &endpoint, &knowledge_bases),
        chart: pass
            .agent
            .spec
            .gitops
            .clone()
            .unwrap_or_else(|| pass.ctx.chart.clone()),
    };
    let artifact = match pass.ctx.providers.get(kind).ensure_deployed(&deployment).await {
        Ok(artifact) => artifact,
        Err(e) => {
            return pass
                .record(ReconciliationOutcome::from_error(&e, "DeploymentFailed", retry_count))
                .await;
        }
    };

    let outcome = ReconciliationOutcome::wait(
        Phase::Ready,
        format!("agent deployed via {kind} as {}", artifact.name),
        RESYNC_INTERVAL,
    );
    pass.write_status(|status| {
        status.deployment_ref = Some(artifact.clone());
        apply_outcome(status, &outcome);
    })
    .await?;
    pass.publish(
        EventType::Normal,
        reasons::AGENT_DEPLOYED,
        actions::DEPLOY,
        Some(artifact.name.clone()),
    )
    .await;
    Ok(outcome.action())
}

/// Ready with an unchanged spec: confirm the artifact still exists
async fn verify_ready(pass: &Pass<'_>) -> Result<Action, Error> {
    let Some(artifact) = &pass.status.deployment_ref else {
        return pass
            .record(ReconciliationOutcome::advance(
                Phase::Resolving,
                "no deployment recorded, resolving again",
            ))
            .await;
    };
    match pass.ctx.providers.get(artifact.provider).exists(artifact).await {
        Ok(true) => Ok(Action::requeue(RESYNC_INTERVAL)),
        Ok(false) => {
            warn!(artifact = %artifact.name, "deployment artifact missing, redeploying");
            pass.record(ReconciliationOutcome::advance(
                Phase::Resolving,
                format!("{} {} is missing", artifact.provider, artifact.name),
            ))
            .await
        }
        Err(e) => {
            pass.record(ReconciliationOutcome::from_error(
                &e,
                "VerificationFailed",
                pass.status.retry_count,
            ))
            .await
        }
    }
}

/// Deletion: remove every artifact this Agent may own, then the finalizer
async fn handle_deletion(pass: &Pass<'_>) -> Result<Action, Error> {
    let agent = pass.agent;
    if !has_finalizer(&agent.metadata, AGENT_FINALIZER) {
        return Ok(Action::await_change());
    }

    if pass.status.phase != Phase::Deleting {
        info!("agent deleted, cleaning up");
        pass.write_status(begin_deletion).await?;
        pass.publish(
            EventType::Normal,
            reasons::DELETION_STARTED,
            actions::DELETE,
            None,
        )
        .await;
    }

    if let Err(e) = remove_artifacts(pass).await {
        let attempts = if pass.status.phase == Phase::Deleting {
            pass.status.retry_count.saturating_add(1)
        } else {
            1
        };
        let message = format!("cleanup failed: {e}");
        warn!(attempts, error = %e, "agent cleanup failed");
        pass.write_status(|status| record_cleanup_failure(status, attempts, &message))
            .await?;
        if attempts == MAX_CLEANUP_ATTEMPTS + 1 {
            pass.publish(
                EventType::Warning,
                reasons::CLEANUP_FAILED,
                actions::DELETE,
                Some(message),
            )
            .await;
        }
        return Ok(Action::requeue(cleanup_delay(attempts)));
    }

    info!("cleanup complete, removing finalizer");
    release_finalizer(pass).await?;
    Ok(Action::await_change())
}

/// Drop the finalizer from the stored object, read fresh because status
/// writes in this pass moved its resourceVersion
async fn release_finalizer(pass: &Pass<'_>) -> Result<(), Error> {
    let kube = pass.ctx.kube.as_ref();
    let Some(current) = kube.get_agent(&pass.namespace, &pass.name).await? else {
        return Ok(());
    };
    if !has_finalizer(&current.metadata, AGENT_FINALIZER) {
        return Ok(());
    }
    kube.set_finalizers(
        &pass.namespace,
        &pass.name,
        finalizers_without(&current.metadata, AGENT_FINALIZER),
        current.resource_version(),
    )
    .await
}

async fn remove_artifacts(pass: &Pass<'_>) -> Result<(), Error> {
    for artifact in pass.cleanup_targets() {
        debug!(provider = %artifact.provider, artifact = %artifact.name, "removing artifact");
        pass.ctx
            .providers
            .get(artifact.provider)
            .ensure_removed(&artifact)
            .await?;
    }
    Ok(())
}
