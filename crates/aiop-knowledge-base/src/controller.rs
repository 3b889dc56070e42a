//! KnowledgeBase reconciliation controller
//!
//! Drives a KnowledgeBase through its lifecycle:
//! - `Pending` → spec hash recorded → `Resolving`
//! - `Resolving` → database and pipeline credentials checked → `Provisioning`
//! - `Provisioning` → pipeline run submitted once per spec hash, then polled
//!   with a backoff keyed on `pollCount` → `Ready` or `Failed`
//! - `Ready` → cheap re-verification on the resync interval, no writes
//! - `Failed` → waits for a spec change or a reconcile-request annotation
//!
//! Deletion terminates an in-flight run before the finalizer is released.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use aiop_common::crd::{
    Condition, ConditionStatus, KnowledgeBase, KnowledgeBaseStatus, ManagedStatus, Phase,
    KNOWLEDGE_BASE_FINALIZER,
};
use aiop_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use aiop_common::kube_utils::{
    artifact_name, finalizer_patch, finalizers_with, finalizers_without, has_finalizer,
    spec_hash, status_patch,
};
use aiop_common::metrics::{record_run_submitted, ReconcileTimer};
use aiop_common::outcome::{PHASE_STEP_DELAY, RESYNC_INTERVAL, RETRY_MAX_DELAY_SECS};
use aiop_common::retry::{retry_with_backoff, RetryConfig};
use aiop_common::status::{
    apply_outcome, begin_deletion, cleanup_delay, record_cleanup_failure, set_condition,
    update_status, StatusWrite, CONDITION_READY, MAX_CLEANUP_ATTEMPTS,
};
use aiop_common::{Error, ReconciliationOutcome};

use crate::credentials::{check_database_secret, pipeline_auth, required_secret_ref, PipelineAuth};
use crate::pipeline::{PipelineClient, PipelineVersionRef, RunRequest, RunState};
use crate::sync::{version_name, CacheValidators, FetchResult, PackageFetcher};

/// Base delay between run status polls (10s * 2^pollCount, capped at 5 min)
pub const POLL_BASE_DELAY_SECS: u64 = 10;

/// Ready condition reason for a run that failed or was canceled
pub const REASON_PIPELINE_FAILED: &str = "PipelineFailed";

/// Delay before the next run status poll
pub fn poll_delay(poll_count: u32) -> Duration {
    let secs = std::cmp::min(
        POLL_BASE_DELAY_SECS.saturating_mul(2u64.saturating_pow(poll_count)),
        RETRY_MAX_DELAY_SECS,
    );
    Duration::from_secs(secs)
}

/// Trait abstracting Kubernetes client operations for KnowledgeBase
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a KnowledgeBase, `None` when it no longer exists
    async fn get_knowledge_base(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KnowledgeBase>, Error>;

    /// Replace the status, failing with 409 unless `resource_version` is current
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &KnowledgeBaseStatus,
    ) -> Result<(), Error>;

    /// Replace the finalizer list
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// Get a Secret by name and namespace
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
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

    fn api(&self, namespace: &str) -> Api<KnowledgeBase> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_knowledge_base(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KnowledgeBase>, Error> {
        let api = self.api(namespace);
        retry_with_backoff(&self.retry, "get_knowledge_base", || async {
            api.get_opt(name).await.map_err(Error::from)
        })
        .await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &KnowledgeBaseStatus,
    ) -> Result<(), Error> {
        let api = self.api(namespace);
        let patch = status_patch(resource_version, status);
        retry_with_backoff(&self.retry, "patch_knowledge_base_status", || async {
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
        retry_with_backoff(&self.retry, "set_knowledge_base_finalizers", || async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map(|_| ())
                .map_err(Error::from)
        })
        .await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        retry_with_backoff(&self.retry, "get_secret", || async {
            api.get_opt(name).await.map_err(Error::from)
        })
        .await
    }
}

/// Controller context for KnowledgeBase reconciliation
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Pipeline service client
    pub pipelines: Arc<dyn PipelineClient>,
    /// Package downloader for specs that carry a pipeline URL
    pub fetcher: Arc<dyn PackageFetcher>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// In-place retry policy for pipeline calls
    pub retry: RetryConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        pipelines: Arc<dyn PipelineClient>,
        fetcher: Arc<dyn PackageFetcher>,
    ) -> ContextBuilder {
        ContextBuilder::new(client, pipelines, fetcher)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        pipelines: Arc<dyn PipelineClient>,
        fetcher: Arc<dyn PackageFetcher>,
    ) -> Self {
        Self {
            kube,
            pipelines,
            fetcher,
            events: Arc::new(aiop_common::events::NoopEventPublisher),
            retry: RetryConfig::with_max_attempts(1),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    pipelines: Arc<dyn PipelineClient>,
    fetcher: Arc<dyn PackageFetcher>,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    retry: RetryConfig,
}

impl ContextBuilder {
    fn new(
        client: Client,
        pipelines: Arc<dyn PipelineClient>,
        fetcher: Arc<dyn PackageFetcher>,
    ) -> Self {
        Self {
            client,
            pipelines,
            fetcher,
            kube: None,
            events: None,
            retry: RetryConfig::default(),
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the retry policy for pipeline calls
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            pipelines: self.pipelines,
            fetcher: self.fetcher,
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(
                    self.client.clone(),
                    "knowledge-base-controller",
                ))
            }),
            retry: self.retry,
        }
    }
}

/// Error policy for the KnowledgeBase controller
///
/// Reached only when a pass itself errors (e.g. a status write exhausted its
/// conflict retries). Logs and requeues; other objects are unaffected.
pub fn error_policy(kb: Arc<KnowledgeBase>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        knowledge_base = %kb.name_any(),
        namespace = %kb.namespace().unwrap_or_default(),
        error = %error,
        "reconcile failed, will retry"
    );
    Action::requeue(Duration::from_secs(30))
}

/// One reconcile pass over a namespaced KnowledgeBase
struct Pass<'a> {
    kb: &'a KnowledgeBase,
    ctx: &'a Context,
    name: String,
    namespace: String,
    status: KnowledgeBaseStatus,
}

impl Pass<'_> {
    /// Read-modify-write the status, stamping the observed generation
    async fn write_status<M>(&self, mutate: M) -> Result<StatusWrite, Error>
    where
        M: Fn(&mut KnowledgeBaseStatus) + Send + Sync,
    {
        let kube = self.ctx.kube.as_ref();
        let (namespace, name) = (self.namespace.as_str(), self.name.as_str());
        let generation = self.kb.metadata.generation;
        update_status(
            || kube.get_knowledge_base(namespace, name),
            |rv: String, status: KnowledgeBaseStatus| async move {
                kube.patch_status(namespace, name, &rv, &status).await
            },
            |status: &mut KnowledgeBaseStatus| {
                status.set_observed_generation(generation);
                mutate(status);
            },
        )
        .await
    }

    /// Write `outcome` and return its action
    async fn record(&self, outcome: ReconciliationOutcome) -> Result<Action, Error> {
        self.write_status(|status| apply_outcome(status, &outcome))
            .await?;
        if let ReconciliationOutcome::Fatal { kind, message } = &outcome {
            warn!(%kind, %message, "knowledge base failed");
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

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let object_ref = self.kb.object_ref(&());
        self.ctx
            .events
            .publish(&object_ref, type_, reason, action, note)
            .await;
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, Error> {
        self.ctx.kube.get_secret(&self.namespace, name).await
    }

    /// Check the database secret
    async fn verify_database(&self) -> Result<(), Error> {
        let secret_name = &self.kb.spec.database.secret_ref;
        let secret = self.get_secret(secret_name).await?;
        check_database_secret(secret.as_ref(), secret_name, &self.namespace, &self.name)
    }

    /// Resolve pipeline-source credentials
    async fn pipeline_auth(&self) -> Result<PipelineAuth, Error> {
        let pipeline = &self.kb.spec.pipeline;
        let Some(secret_ref) = required_secret_ref(
            pipeline.auth_type,
            pipeline.auth_secret_ref.as_ref(),
            &self.name,
            "spec.pipeline.authSecretRef",
        )?
        else {
            return Ok(PipelineAuth::None);
        };
        let secret = self.get_secret(&secret_ref.name).await?;
        pipeline_auth(
            pipeline.auth_type,
            secret_ref,
            secret.as_ref(),
            &self.namespace,
            &self.name,
        )
    }
}

/// Reconcile a KnowledgeBase
#[instrument(skip(kb, ctx), fields(knowledge_base = %kb.name_any()))]
pub async fn reconcile(kb: Arc<KnowledgeBase>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start("KnowledgeBase");
    let result = reconcile_pass(kb, ctx).await;
    timer.finish(&result);
    result
}

async fn reconcile_pass(kb: Arc<KnowledgeBase>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = kb.namespace().ok_or_else(|| {
        Error::validation_for_field(kb.name_any(), "metadata.namespace", "KnowledgeBase must be namespaced")
    })?;
    let pass = Pass {
        kb: kb.as_ref(),
        ctx: ctx.as_ref(),
        name: kb.name_any(),
        namespace,
        status: kb.status.clone().unwrap_or_default(),
    };
    debug!(phase = %pass.status.phase, "reconciling knowledge base");

    if kb.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&pass).await;
    }

    if !has_finalizer(&kb.metadata, KNOWLEDGE_BASE_FINALIZER) {
        info!("adding finalizer");
        ctx.kube
            .set_finalizers(
                &pass.namespace,
                &pass.name,
                finalizers_with(&kb.metadata, KNOWLEDGE_BASE_FINALIZER),
                kb.resource_version(),
            )
            .await?;
        return Ok(Action::requeue(PHASE_STEP_DELAY));
    }

    let hash = spec_hash(&kb.spec, &kb.metadata)?;
    if pass.status.spec_hash.as_deref() != Some(hash.as_str()) {
        return start_resolving(&pass, &hash).await;
    }

    match pass.status.phase {
        Phase::Pending | Phase::Resolving => resolve(&pass).await,
        Phase::Provisioning => match pass.status.last_run_id.clone() {
            None => submit_run(&pass, &hash).await,
            Some(run_id) => poll_run(&pass, &run_id).await,
        },
        Phase::Ready => verify_ready(&pass).await,
        Phase::Failed => Ok(Action::await_change()),
        // Deletion was cancelled by the API server (finalizer removed elsewhere)
        Phase::Deleting => start_resolving(&pass, &hash).await,
    }
}

/// New spec (or explicit re-trigger): reset run tracking and start over
async fn start_resolving(pass: &Pass<'_>, hash: &str) -> Result<Action, Error> {
    info!(spec_hash = %hash, "spec changed, resolving");
    pass.write_status(|status| {
        status.reset_for_spec(hash);
        apply_outcome(
            status,
            &ReconciliationOutcome::advance(Phase::Resolving, "resolving dependencies"),
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

/// Resolving: validate the spec and check every secret it references
async fn resolve(pass: &Pass<'_>) -> Result<Action, Error> {
    let retry_count = pass.status.retry_count;

    if let Err(e) = pass.kb.spec.validate(&pass.name) {
        return pass.record(ReconciliationOutcome::from_error(&e, "InvalidSpec", retry_count)).await;
    }
    if let Err(e) = pass.verify_database().await {
        return pass
            .record(ReconciliationOutcome::from_error(&e, "DatabaseSecretUnavailable", retry_count))
            .await;
    }
    if let Err(e) = pass.pipeline_auth().await {
        return pass
            .record(ReconciliationOutcome::from_error(
                &e,
                "PipelineCredentialsUnavailable",
                retry_count,
            ))
            .await;
    }

    pass.record(ReconciliationOutcome::advance(
        Phase::Provisioning,
        "dependencies resolved, submitting pipeline run",
    ))
    .await
}

/// Parameters passed to every indexing run
///
/// Extra parameters from the spec are merged first so the operator-derived
/// values cannot be overridden.
pub fn run_parameters(kb: &KnowledgeBase, name: &str, namespace: &str) -> BTreeMap<String, Value> {
    let spec = &kb.spec;
    let mut params: BTreeMap<String, Value> = spec
        .parameters
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect();

    let db = &spec.database;
    let read_host = db.read_host.as_deref().unwrap_or(&db.host);
    let derived = [
        ("url", Value::from(spec.data.url.as_str())),
        ("table_name", Value::from(name)),
        ("embedding_model", Value::from(spec.embedding.model_name.as_str())),
        ("embedding_api_base", Value::from(spec.embedding.model_endpoint.as_str())),
        ("embed_dim", Value::from(spec.embedding.dimension)),
        ("embed_batch_size", Value::from(spec.embed_batch_size())),
        ("secret_name", Value::from(db.secret_ref.as_str())),
        ("secret_namespace", Value::from(namespace)),
        ("db_host_read_write", Value::from(db.host.as_str())),
        ("db_host_read", Value::from(read_host)),
        ("db_port", Value::from(db.port)),
        ("db_name", Value::from(db.name.as_str())),
    ];
    params.extend(derived.into_iter().map(|(k, v)| (k.to_string(), v)));
    params
}

/// Experiment holding every run of one KnowledgeBase
pub fn experiment_name(name: &str, namespace: &str) -> String {
    format!("{namespace}-{name}")
}

/// Run name for a spec; the same spec never produces two runs
pub fn job_name(name: &str, namespace: &str, spec_hash: &str) -> String {
    artifact_name(&[name, namespace, spec_hash])
}

/// Provisioning without a run: resolve the pipeline version and submit once
async fn submit_run(pass: &Pass<'_>, hash: &str) -> Result<Action, Error> {
    let retry_count = pass.status.retry_count;
    let version = match resolve_version(pass).await {
        Ok(Some(version)) => version,
        Ok(None) => {
            return pass
                .record(ReconciliationOutcome::not_yet_ready(
                    "PipelineNotFound",
                    format!(
                        "pipeline '{}' has no uploaded version",
                        pass.kb.spec.pipeline.name
                    ),
                    retry_count,
                ))
                .await;
        }
        Err(e) => {
            return pass
                .record(ReconciliationOutcome::from_error(&e, "PipelineUnavailable", retry_count))
                .await;
        }
    };

    let run_id = match create_run(pass, hash, version).await {
        Ok(run_id) => run_id,
        Err(e) => {
            return pass
                .record(ReconciliationOutcome::from_error(&e, "RunSubmissionFailed", retry_count))
                .await;
        }
    };

    info!(%run_id, "pipeline run submitted");
    let outcome = ReconciliationOutcome::wait(
        Phase::Provisioning,
        format!("pipeline run {run_id} submitted"),
        poll_delay(0),
    );
    pass.write_status(|status| {
        status.last_run_id = Some(run_id.clone());
        status.run_state = Some(RunState::Pending.as_status().to_string());
        status.poll_count = 0;
        apply_outcome(status, &outcome);
    })
    .await?;
    pass.publish(
        EventType::Normal,
        reasons::PIPELINE_SUBMITTED,
        actions::RUN_PIPELINE,
        Some(format!("run {run_id}")),
    )
    .await;
    Ok(outcome.action())
}

/// Pipeline version to run: an uploaded package when the spec has a URL,
/// otherwise the latest version already in the pipeline service
async fn resolve_version(pass: &Pass<'_>) -> Result<Option<PipelineVersionRef>, Error> {
    let ctx = pass.ctx;
    let pipeline = &pass.kb.spec.pipeline;

    if let Some(url) = &pipeline.url {
        let auth = pass.pipeline_auth().await?;
        let package = match ctx
            .fetcher
            .fetch(url, &auth, &CacheValidators::default())
            .await?
        {
            FetchResult::Fetched { package, .. } => package,
            FetchResult::NotModified => {
                return Err(Error::internal_with_context(
                    "pipeline-source",
                    format!("unconditional download of {url} answered 304"),
                ));
            }
        };
        let version = version_name(&pipeline.name, pipeline.version_label());
        let uploaded = retry_with_backoff(&ctx.retry, "upload_package", || {
            ctx.pipelines
                .upload_package(&pipeline.name, &version, package.clone())
        })
        .await?;
        return Ok(Some(uploaded));
    }

    let Some(pipeline_id) = retry_with_backoff(&ctx.retry, "find_pipeline", || {
        ctx.pipelines.find_pipeline(&pipeline.name)
    })
    .await?
    else {
        return Ok(None);
    };
    let version_id = retry_with_backoff(&ctx.retry, "latest_version", || {
        ctx.pipelines.latest_version(&pipeline_id)
    })
    .await?;
    Ok(version_id.map(|version_id| PipelineVersionRef {
        pipeline_id,
        version_id,
    }))
}

/// Find the run for this spec hash or submit it
async fn create_run(
    pass: &Pass<'_>,
    hash: &str,
    version: PipelineVersionRef,
) -> Result<String, Error> {
    let ctx = pass.ctx;
    let experiment = experiment_name(&pass.name, &pass.namespace);
    let experiment_id = retry_with_backoff(&ctx.retry, "ensure_experiment", || {
        ctx.pipelines.ensure_experiment(&experiment)
    })
    .await?;

    let display_name = job_name(&pass.name, &pass.namespace, hash);
    // A previous pass may have submitted the run without recording it
    if let Some(existing) = retry_with_backoff(&ctx.retry, "find_run", || {
        ctx.pipelines.find_run(&experiment_id, &display_name)
    })
    .await?
    {
        debug!(run_id = %existing, "adopting existing pipeline run");
        return Ok(existing);
    }

    let request = RunRequest {
        display_name,
        experiment_id,
        version,
        parameters: run_parameters(pass.kb, &pass.name, &pass.namespace),
    };
    let run_id = retry_with_backoff(&ctx.retry, "submit_run", || {
        ctx.pipelines.submit_run(&request)
    })
    .await?;
    record_run_submitted(&pass.kb.spec.pipeline.name);
    Ok(run_id)
}

/// Provisioning with a run: poll until it finishes
async fn poll_run(pass: &Pass<'_>, run_id: &str) -> Result<Action, Error> {
    let ctx = pass.ctx;
    let state = match retry_with_backoff(&ctx.retry, "get_run_status", || {
        ctx.pipelines.get_run_status(run_id)
    })
    .await
    {
        Ok(state) => state,
        Err(e) if e.is_not_found() => return forget_run(pass, run_id).await,
        Err(e) => {
            return pass
                .record(ReconciliationOutcome::from_error(
                    &e,
                    "RunStatusUnavailable",
                    pass.status.retry_count,
                ))
                .await;
        }
    };

    match state {
        RunState::Succeeded => {
            info!(%run_id, "pipeline run succeeded");
            let outcome = ReconciliationOutcome::wait(
                Phase::Ready,
                format!("pipeline run {run_id} succeeded"),
                RESYNC_INTERVAL,
            );
            pass.write_status(|status| {
                status.run_state = Some(state.as_status().to_string());
                apply_outcome(status, &outcome);
            })
            .await?;
            pass.publish(
                EventType::Normal,
                reasons::KNOWLEDGE_BASE_READY,
                actions::RUN_PIPELINE,
                None,
            )
            .await;
            Ok(outcome.action())
        }
        RunState::Failed | RunState::Canceled => {
            let message = format!("pipeline run {run_id} ended in state {}", state.as_status());
            warn!(%run_id, state = state.as_status(), "pipeline run did not succeed");
            let outcome = ReconciliationOutcome::configuration(message.clone());
            pass.write_status(|status| {
                status.run_state = Some(state.as_status().to_string());
                apply_outcome(status, &outcome);
                set_condition(
                    status.conditions_mut(),
                    Condition::new(
                        CONDITION_READY,
                        ConditionStatus::False,
                        REASON_PIPELINE_FAILED,
                        &message,
                    ),
                );
            })
            .await?;
            pass.publish(
                EventType::Warning,
                reasons::PIPELINE_FAILED,
                actions::RUN_PIPELINE,
                Some(message.clone()),
            )
            .await;
            Ok(outcome.action())
        }
        RunState::Pending | RunState::Running | RunState::Unknown(_) => {
            let poll_count = pass.status.poll_count.saturating_add(1);
            let delay = poll_delay(poll_count);
            debug!(%run_id, state = state.as_status(), poll_count, "pipeline run in progress");
            let outcome = ReconciliationOutcome::wait(
                Phase::Provisioning,
                format!("pipeline run {run_id} is {}", state.as_status()),
                delay,
            );
            pass.write_status(|status| {
                status.run_state = Some(state.as_status().to_string());
                status.poll_count = poll_count;
                apply_outcome(status, &outcome);
            })
            .await?;
            Ok(outcome.action())
        }
    }
}

/// The recorded run is gone from the pipeline service: drop it so the next
/// pass adopts or submits a run again
async fn forget_run(pass: &Pass<'_>, run_id: &str) -> Result<Action, Error> {
    warn!(%run_id, "recorded pipeline run no longer exists, resubmitting");
    let outcome = ReconciliationOutcome::advance(
        Phase::Provisioning,
        format!("pipeline run {run_id} no longer exists, resubmitting"),
    );
    pass.write_status(|status| {
        status.last_run_id = None;
        status.run_state = None;
        status.poll_count = 0;
        apply_outcome(status, &outcome);
    })
    .await?;
    Ok(outcome.action())
}

/// Ready with an unchanged spec: re-check the database secret, write nothing
async fn verify_ready(pass: &Pass<'_>) -> Result<Action, Error> {
    match pass.verify_database().await {
        Ok(()) => Ok(Action::requeue(RESYNC_INTERVAL)),
        Err(e) => {
            warn!(error = %e, "ready knowledge base failed verification, resolving again");
            pass.record(ReconciliationOutcome::advance(
                Phase::Resolving,
                format!("re-verifying: {e}"),
            ))
            .await
        }
    }
}

/// Deletion: terminate an in-flight run, then release the finalizer
async fn handle_deletion(pass: &Pass<'_>) -> Result<Action, Error> {
    let kb = pass.kb;
    if !has_finalizer(&kb.metadata, KNOWLEDGE_BASE_FINALIZER) {
        return Ok(Action::await_change());
    }

    if pass.status.phase != Phase::Deleting {
        info!("knowledge base deleted, cleaning up");
        pass.write_status(begin_deletion).await?;
        pass.publish(
            EventType::Normal,
            reasons::DELETION_STARTED,
            actions::DELETE,
            None,
        )
        .await;
    }

    if let Err(e) = terminate_in_flight_run(pass).await {
        let attempts = if pass.status.phase == Phase::Deleting {
            pass.status.retry_count.saturating_add(1)
        } else {
            1
        };
        let message = format!("cleanup failed: {e}");
        warn!(attempts, error = %e, "knowledge base cleanup failed");
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

/// Drop the finalizer from the stored object
///
/// Status writes earlier in the pass move the resourceVersion, so the
/// patch is built from a fresh read rather than the pass snapshot.
async fn release_finalizer(pass: &Pass<'_>) -> Result<(), Error> {
    let kube = pass.ctx.kube.as_ref();
    let Some(current) = kube.get_knowledge_base(&pass.namespace, &pass.name).await? else {
        return Ok(());
    };
    if !has_finalizer(&current.metadata, KNOWLEDGE_BASE_FINALIZER) {
        return Ok(());
    }
    kube.set_finalizers(
        &pass.namespace,
        &pass.name,
        finalizers_without(&current.metadata, KNOWLEDGE_BASE_FINALIZER),
        current.resource_version(),
    )
    .await
}

async fn terminate_in_flight_run(pass: &Pass<'_>) -> Result<(), Error> {
    let Some(run_id) = &pass.status.last_run_id else {
        return Ok(());
    };
    let finished = pass
        .status
        .run_state
        .as_deref()
        .map(RunState::from_api)
        .is_some_and(|state| state.is_finished());
    if finished {
        return Ok(());
    }
    info!(%run_id, "terminating in-flight pipeline run");
    let ctx = pass.ctx;
    retry_with_backoff(&ctx.retry, "terminate_run", || {
        ctx.pipelines.terminate_run(run_id)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MockPipelineClient;
    use crate::sync::MockPackageFetcher;
    use aiop_common::status::{find_condition, CONDITION_DEGRADED, REASON_CLEANUP_FAILED};
    use aiop_common::FailureKind;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::ByteString;
    use mockall::predicate::eq;
    use std::sync::Mutex;

    /// In-memory API server holding one KnowledgeBase and its secrets
    ///
    /// Status and finalizer writes bump the resourceVersion and are checked
    /// against it, so optimistic concurrency is exercised for real.
    #[derive(Default)]
    struct FakeKube {
        kb: Mutex<Option<KnowledgeBase>>,
        secrets: Mutex<BTreeMap<String, Secret>>,
        status_writes: Mutex<u32>,
    }

    fn conflict() -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            }),
        }
    }

    impl FakeKube {
        fn with(kb: KnowledgeBase) -> Arc<Self> {
            let fake = Self::default();
            *fake.kb.lock().unwrap() = Some(kb);
            Arc::new(fake)
        }

        fn add_secret(&self, name: &str, entries: &[(&str, &str)]) {
            let secret = Secret {
                data: Some(
                    entries
                        .iter()
                        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                        .collect(),
                ),
                ..Default::default()
            };
            self.secrets.lock().unwrap().insert(name.to_string(), secret);
        }

        fn current(&self) -> Option<KnowledgeBase> {
            self.kb.lock().unwrap().clone()
        }

        fn status(&self) -> KnowledgeBaseStatus {
            self.current()
                .and_then(|kb| kb.status)
                .unwrap_or_default()
        }

        fn writes(&self) -> u32 {
            *self.status_writes.lock().unwrap()
        }

        fn request_deletion(&self) {
            if let Some(kb) = self.kb.lock().unwrap().as_mut() {
                kb.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
        }

        fn edit_spec(&self, edit: impl FnOnce(&mut KnowledgeBase)) {
            if let Some(kb) = self.kb.lock().unwrap().as_mut() {
                edit(kb);
                kb.metadata.generation = Some(kb.metadata.generation.unwrap_or(1) + 1);
                bump(kb);
            }
        }
    }

    fn bump(kb: &mut KnowledgeBase) {
        let rv: u64 = kb
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        kb.metadata.resource_version = Some((rv + 1).to_string());
    }

    #[async_trait]
    impl KubeClient for FakeKube {
        async fn get_knowledge_base(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<Option<KnowledgeBase>, Error> {
            Ok(self.current())
        }

        async fn patch_status(
            &self,
            _namespace: &str,
            _name: &str,
            resource_version: &str,
            status: &KnowledgeBaseStatus,
        ) -> Result<(), Error> {
            let mut guard = self.kb.lock().unwrap();
            let kb = guard.as_mut().ok_or_else(|| Error::not_found("KnowledgeBase", "team-a", "docs"))?;
            if kb.metadata.resource_version.as_deref() != Some(resource_version) {
                return Err(conflict());
            }
            kb.status = Some(status.clone());
            bump(kb);
            *self.status_writes.lock().unwrap() += 1;
            Ok(())
        }

        async fn set_finalizers(
            &self,
            _namespace: &str,
            _name: &str,
            finalizers: Vec<String>,
            resource_version: Option<String>,
        ) -> Result<(), Error> {
            let mut guard = self.kb.lock().unwrap();
            let Some(kb) = guard.as_mut() else {
                return Ok(());
            };
            if resource_version.is_some() && kb.metadata.resource_version != resource_version {
                return Err(conflict());
            }
            let deleting = kb.metadata.deletion_timestamp.is_some();
            if deleting && finalizers.is_empty() {
                *guard = None;
                return Ok(());
            }
            kb.metadata.finalizers = Some(finalizers);
            bump(kb);
            Ok(())
        }

        async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
            Ok(self.secrets.lock().unwrap().get(name).cloned())
        }
    }

    fn sample_kb() -> KnowledgeBase {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "akamai.io/v1alpha1",
            "kind": "KnowledgeBase",
            "metadata": {
                "name": "docs",
                "namespace": "team-a",
                "generation": 1,
                "resourceVersion": "1",
                "uid": "0b6f6e4c"
            },
            "spec": {
                "pipeline": {"name": "docs-indexing"},
                "database": {"host": "pgvector-rw", "name": "app", "secretRef": "pg"},
                "data": {"url": "https://example.com/docs"},
                "embedding": {
                    "modelName": "e5-mistral",
                    "modelEndpoint": "http://e5.models.svc/v1",
                    "dimension": 4096
                },
                "parameters": {"chunk_size": "512", "table_name": "ignored"}
            }
        }))
        .unwrap()
    }

    fn ready_kube() -> Arc<FakeKube> {
        let kube = FakeKube::with(sample_kb());
        kube.add_secret("pg", &[("username", "app"), ("password", "hunter2")]);
        kube
    }

    fn context(kube: Arc<FakeKube>, pipelines: MockPipelineClient) -> Arc<Context> {
        Arc::new(Context::for_testing(
            kube,
            Arc::new(pipelines),
            Arc::new(MockPackageFetcher::new()),
        ))
    }

    /// Run one pass against the fake's current object
    async fn pass(kube: &FakeKube, ctx: &Arc<Context>) -> Action {
        let kb = kube.current().expect("knowledge base exists");
        reconcile(Arc::new(kb), ctx.clone()).await.unwrap()
    }

    /// Drive the object from creation to a submitted run
    async fn drive_to_submitted(kube: &FakeKube, ctx: &Arc<Context>) {
        pass(kube, ctx).await; // finalizer
        pass(kube, ctx).await; // spec hash → Resolving
        pass(kube, ctx).await; // Resolving → Provisioning
        pass(kube, ctx).await; // submit
    }

    fn pipelines_that_submit_once() -> MockPipelineClient {
        let mut pipelines = MockPipelineClient::new();
        pipelines
            .expect_find_pipeline()
            .with(eq("docs-indexing"))
            .returning(|_| Ok(Some("p-1".to_string())));
        pipelines
            .expect_latest_version()
            .with(eq("p-1"))
            .returning(|_| Ok(Some("v-3".to_string())));
        pipelines
            .expect_ensure_experiment()
            .with(eq("team-a-docs"))
            .returning(|_| Ok("e-1".to_string()));
        pipelines.expect_find_run().returning(|_, _| Ok(None));
        pipelines
            .expect_submit_run()
            .times(1)
            .returning(|_| Ok("r-1".to_string()));
        pipelines
    }

    // ==========================================================================
    // Story Tests: KnowledgeBase lifecycle
    // ==========================================================================

    mod lifecycle {
        use super::*;

        /// Story: a new KnowledgeBase is indexed and becomes Ready
        ///
        /// The run is submitted exactly once, polled with growing delays,
        /// and a Ready resource with an unchanged spec is left alone.
        #[tokio::test]
        async fn story_happy_path_reaches_ready() {
            let kube = ready_kube();
            let mut pipelines = pipelines_that_submit_once();
            let mut polls = 0;
            pipelines
                .expect_get_run_status()
                .with(eq("r-1"))
                .returning(move |_| {
                    polls += 1;
                    Ok(if polls < 3 {
                        RunState::Running
                    } else {
                        RunState::Succeeded
                    })
                });
            let ctx = context(kube.clone(), pipelines);

            assert_eq!(pass(&kube, &ctx).await, Action::requeue(PHASE_STEP_DELAY));
            assert!(has_finalizer(
                &kube.current().unwrap().metadata,
                KNOWLEDGE_BASE_FINALIZER
            ));

            pass(&kube, &ctx).await;
            assert_eq!(kube.status().phase, Phase::Resolving);
            assert!(kube.status().spec_hash.is_some());

            pass(&kube, &ctx).await;
            assert_eq!(kube.status().phase, Phase::Provisioning);

            let action = pass(&kube, &ctx).await;
            assert_eq!(action, Action::requeue(Duration::from_secs(10)));
            let status = kube.status();
            assert_eq!(status.last_run_id.as_deref(), Some("r-1"));
            assert_eq!(status.run_state.as_deref(), Some("PENDING"));

            assert_eq!(pass(&kube, &ctx).await, Action::requeue(Duration::from_secs(20)));
            assert_eq!(pass(&kube, &ctx).await, Action::requeue(Duration::from_secs(40)));
            assert_eq!(kube.status().poll_count, 2);

            assert_eq!(pass(&kube, &ctx).await, Action::requeue(RESYNC_INTERVAL));
            let status = kube.status();
            assert_eq!(status.phase, Phase::Ready);
            assert_eq!(status.run_state.as_deref(), Some("SUCCEEDED"));
            let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
            assert_eq!(ready.status, ConditionStatus::True);
            assert_eq!(status.observed_generation, Some(1));

            // Idempotence: nothing changed, nothing written, nothing submitted
            let writes = kube.writes();
            assert_eq!(pass(&kube, &ctx).await, Action::requeue(RESYNC_INTERVAL));
            assert_eq!(pass(&kube, &ctx).await, Action::requeue(RESYNC_INTERVAL));
            assert_eq!(kube.writes(), writes);
        }

        /// Story: the spec is edited after the knowledge base was indexed
        #[tokio::test]
        async fn story_spec_change_submits_a_new_run() {
            let kube = ready_kube();
            let mut pipelines = MockPipelineClient::new();
            pipelines
                .expect_find_pipeline()
                .returning(|_| Ok(Some("p-1".to_string())));
            pipelines
                .expect_latest_version()
                .returning(|_| Ok(Some("v-3".to_string())));
            pipelines
                .expect_ensure_experiment()
                .returning(|_| Ok("e-1".to_string()));
            pipelines.expect_find_run().returning(|_, _| Ok(None));
            let mut submitted = 0;
            pipelines.expect_submit_run().times(2).returning(move |_| {
                submitted += 1;
                Ok(format!("r-{submitted}"))
            });
            pipelines
                .expect_get_run_status()
                .returning(|_| Ok(RunState::Succeeded));
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;
            pass(&kube, &ctx).await;
            assert_eq!(kube.status().phase, Phase::Ready);
            let first_hash = kube.status().spec_hash;

            kube.edit_spec(|kb| kb.spec.data.url = "https://example.com/handbook".to_string());
            pass(&kube, &ctx).await;
            let status = kube.status();
            assert_eq!(status.phase, Phase::Resolving);
            assert_ne!(status.spec_hash, first_hash);
            assert!(status.last_run_id.is_none());

            pass(&kube, &ctx).await;
            pass(&kube, &ctx).await;
            assert_eq!(kube.status().last_run_id.as_deref(), Some("r-2"));
        }

        /// Story: a run that was submitted but never recorded is adopted
        #[tokio::test]
        async fn story_existing_run_is_adopted_not_resubmitted() {
            let kube = ready_kube();
            let mut pipelines = MockPipelineClient::new();
            pipelines
                .expect_find_pipeline()
                .returning(|_| Ok(Some("p-1".to_string())));
            pipelines
                .expect_latest_version()
                .returning(|_| Ok(Some("v-3".to_string())));
            pipelines
                .expect_ensure_experiment()
                .returning(|_| Ok("e-1".to_string()));
            pipelines
                .expect_find_run()
                .withf(|experiment, name| experiment == "e-1" && name.starts_with("docs-team-a-"))
                .returning(|_, _| Ok(Some("r-orphan".to_string())));
            pipelines.expect_submit_run().never();
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;
            assert_eq!(kube.status().last_run_id.as_deref(), Some("r-orphan"));
        }

        /// Story: the indexing run fails
        #[tokio::test]
        async fn story_failed_run_marks_failed_until_spec_changes() {
            let kube = ready_kube();
            let mut pipelines = pipelines_that_submit_once();
            pipelines
                .expect_get_run_status()
                .returning(|_| Ok(RunState::Failed));
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;
            assert_eq!(pass(&kube, &ctx).await, Action::await_change());

            let status = kube.status();
            assert_eq!(status.phase, Phase::Failed);
            let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
            assert_eq!(ready.reason, REASON_PIPELINE_FAILED);

            let writes = kube.writes();
            assert_eq!(pass(&kube, &ctx).await, Action::await_change());
            assert_eq!(kube.writes(), writes);
        }
    }

    mod failures {
        use super::*;

        /// Story: the pipeline service is down while a run is tracked
        ///
        /// Backoff grows 5s, 10s, 20s; Degraded appears on the third failure
        /// and the phase stays Provisioning throughout.
        #[tokio::test]
        async fn story_transient_outage_backs_off_and_degrades() {
            let kube = ready_kube();
            let mut pipelines = pipelines_that_submit_once();
            pipelines
                .expect_get_run_status()
                .returning(|_| Err(Error::api("kubeflow", 503, "upstream unavailable")));
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;

            assert_eq!(pass(&kube, &ctx).await, Action::requeue(Duration::from_secs(5)));
            assert!(find_condition(&kube.status().conditions, CONDITION_DEGRADED).is_none());
            assert_eq!(pass(&kube, &ctx).await, Action::requeue(Duration::from_secs(10)));
            assert!(find_condition(&kube.status().conditions, CONDITION_DEGRADED).is_none());
            assert_eq!(pass(&kube, &ctx).await, Action::requeue(Duration::from_secs(20)));

            let status = kube.status();
            assert_eq!(status.phase, Phase::Provisioning);
            assert_eq!(status.retry_count, 3);
            let degraded = find_condition(&status.conditions, CONDITION_DEGRADED).unwrap();
            assert_eq!(degraded.reason, "RunStatusUnavailable");
        }

        /// Story: run submission times out three times, then goes through
        ///
        /// The phase never leaves Provisioning while submission is retried,
        /// and the run is created exactly once.
        #[tokio::test]
        async fn story_submit_timeouts_then_ready() {
            let kube = ready_kube();
            let mut pipelines = MockPipelineClient::new();
            pipelines
                .expect_find_pipeline()
                .returning(|_| Ok(Some("p-1".to_string())));
            pipelines
                .expect_latest_version()
                .returning(|_| Ok(Some("v-3".to_string())));
            pipelines
                .expect_ensure_experiment()
                .returning(|_| Ok("e-1".to_string()));
            pipelines.expect_find_run().returning(|_, _| Ok(None));
            let mut calls = 0;
            pipelines.expect_submit_run().times(4).returning(move |_| {
                calls += 1;
                if calls <= 3 {
                    Err(Error::api("kubeflow", 504, "gateway timeout"))
                } else {
                    Ok("r-1".to_string())
                }
            });
            pipelines
                .expect_get_run_status()
                .with(eq("r-1"))
                .returning(|_| Ok(RunState::Succeeded));
            let ctx = context(kube.clone(), pipelines);

            pass(&kube, &ctx).await; // finalizer
            pass(&kube, &ctx).await; // spec hash
            pass(&kube, &ctx).await; // Resolving → Provisioning
            assert_eq!(kube.status().phase, Phase::Provisioning);

            for secs in [5, 10, 20] {
                assert_eq!(pass(&kube, &ctx).await, Action::requeue(Duration::from_secs(secs)));
                let status = kube.status();
                assert_eq!(status.phase, Phase::Provisioning);
                assert!(status.last_run_id.is_none());
            }
            assert_eq!(kube.status().retry_count, 3);

            assert_eq!(pass(&kube, &ctx).await, Action::requeue(poll_delay(0)));
            let status = kube.status();
            assert_eq!(status.phase, Phase::Provisioning);
            assert_eq!(status.last_run_id.as_deref(), Some("r-1"));
            assert_eq!(status.retry_count, 0);

            assert_eq!(pass(&kube, &ctx).await, Action::requeue(RESYNC_INTERVAL));
            assert_eq!(kube.status().phase, Phase::Ready);
        }

        /// Story: the pipeline service lost the recorded run
        ///
        /// A 404 while polling clears the run id, and the next pass submits
        /// a fresh run instead of waiting on the missing one forever.
        #[tokio::test]
        async fn story_lost_run_is_resubmitted() {
            let kube = ready_kube();
            let mut pipelines = MockPipelineClient::new();
            pipelines
                .expect_find_pipeline()
                .returning(|_| Ok(Some("p-1".to_string())));
            pipelines
                .expect_latest_version()
                .returning(|_| Ok(Some("v-3".to_string())));
            pipelines
                .expect_ensure_experiment()
                .returning(|_| Ok("e-1".to_string()));
            pipelines.expect_find_run().returning(|_, _| Ok(None));
            let mut submitted = 0;
            pipelines.expect_submit_run().times(2).returning(move |_| {
                submitted += 1;
                Ok(format!("r-{submitted}"))
            });
            pipelines
                .expect_get_run_status()
                .with(eq("r-1"))
                .returning(|_| Err(Error::api("kubeflow", 404, "run r-1 not found")));
            pipelines
                .expect_get_run_status()
                .with(eq("r-2"))
                .returning(|_| Ok(RunState::Running));
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;
            assert_eq!(kube.status().last_run_id.as_deref(), Some("r-1"));

            assert_eq!(pass(&kube, &ctx).await, Action::requeue(PHASE_STEP_DELAY));
            let status = kube.status();
            assert_eq!(status.phase, Phase::Provisioning);
            assert!(status.last_run_id.is_none());
            assert!(status.run_state.is_none());
            assert_eq!(status.retry_count, 0);

            pass(&kube, &ctx).await;
            assert_eq!(kube.status().last_run_id.as_deref(), Some("r-2"));
            assert_eq!(pass(&kube, &ctx).await, Action::requeue(poll_delay(1)));
        }

        /// Story: the database secret has not been created yet
        #[tokio::test]
        async fn story_missing_secret_waits() {
            let kube = FakeKube::with(sample_kb());
            let ctx = context(kube.clone(), MockPipelineClient::new());

            pass(&kube, &ctx).await;
            pass(&kube, &ctx).await;
            assert_eq!(pass(&kube, &ctx).await, Action::requeue(Duration::from_secs(5)));

            let status = kube.status();
            assert_eq!(status.phase, Phase::Resolving);
            let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
            assert_eq!(ready.reason, "DatabaseSecretUnavailable");

            kube.add_secret("pg", &[("username", "app"), ("password", "hunter2")]);
            pass(&kube, &ctx).await;
            assert_eq!(kube.status().phase, Phase::Provisioning);
            assert_eq!(kube.status().retry_count, 0);
        }

        #[tokio::test]
        async fn secret_without_password_is_fatal() {
            let kube = FakeKube::with(sample_kb());
            kube.add_secret("pg", &[("username", "app")]);
            let ctx = context(kube.clone(), MockPipelineClient::new());

            pass(&kube, &ctx).await;
            pass(&kube, &ctx).await;
            assert_eq!(pass(&kube, &ctx).await, Action::await_change());

            let status = kube.status();
            assert_eq!(status.phase, Phase::Failed);
            let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
            assert_eq!(ready.reason, FailureKind::Configuration.to_string());
        }

        #[tokio::test]
        async fn unuploaded_pipeline_is_not_yet_ready() {
            let kube = ready_kube();
            let mut pipelines = MockPipelineClient::new();
            pipelines.expect_find_pipeline().returning(|_| Ok(None));
            pipelines.expect_submit_run().never();
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;
            let status = kube.status();
            assert_eq!(status.phase, Phase::Provisioning);
            let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
            assert_eq!(ready.reason, "PipelineNotFound");
        }

        /// Story: a Failed resource is retried by bumping the annotation
        #[tokio::test]
        async fn story_reconcile_request_retries_failed() {
            let kube = FakeKube::with(sample_kb());
            kube.add_secret("pg", &[("username", "app")]);
            let ctx = context(kube.clone(), MockPipelineClient::new());
            for _ in 0..3 {
                pass(&kube, &ctx).await;
            }
            assert_eq!(kube.status().phase, Phase::Failed);

            kube.edit_spec(|kb| {
                kb.metadata.annotations = Some(BTreeMap::from([(
                    aiop_common::kube_utils::RECONCILE_REQUEST_ANNOTATION.to_string(),
                    "retry-1".to_string(),
                )]));
            });
            pass(&kube, &ctx).await;
            assert_eq!(kube.status().phase, Phase::Resolving);
        }
    }

    mod deletion {
        use super::*;

        /// Story: deleting a KnowledgeBase with a run in flight
        ///
        /// The finalizer is only released after the run was terminated.
        #[tokio::test]
        async fn story_finalizer_held_until_run_terminated() {
            let kube = ready_kube();
            let mut pipelines = pipelines_that_submit_once();
            let mut attempts = 0;
            pipelines
                .expect_terminate_run()
                .with(eq("r-1"))
                .times(2)
                .returning(move |_| {
                    attempts += 1;
                    if attempts == 1 {
                        Err(Error::api("kubeflow", 503, "unavailable"))
                    } else {
                        Ok(())
                    }
                });
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;
            kube.request_deletion();

            assert_eq!(pass(&kube, &ctx).await, Action::requeue(Duration::from_secs(5)));
            let current = kube.current().expect("finalizer keeps the object");
            assert!(has_finalizer(&current.metadata, KNOWLEDGE_BASE_FINALIZER));
            assert_eq!(kube.status().phase, Phase::Deleting);
            assert_eq!(kube.status().retry_count, 1);

            assert_eq!(pass(&kube, &ctx).await, Action::await_change());
            assert!(kube.current().is_none());
        }

        #[tokio::test]
        async fn finished_run_is_not_terminated() {
            let kube = ready_kube();
            let mut pipelines = pipelines_that_submit_once();
            pipelines
                .expect_get_run_status()
                .returning(|_| Ok(RunState::Succeeded));
            pipelines.expect_terminate_run().never();
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;
            pass(&kube, &ctx).await;
            kube.request_deletion();

            assert_eq!(pass(&kube, &ctx).await, Action::await_change());
            assert!(kube.current().is_none());
        }

        /// The Deleting status write moves the resourceVersion, the finalizer
        /// release in the same pass must still land
        #[tokio::test]
        async fn ready_object_released_in_first_deletion_pass() {
            let kube = ready_kube();
            let mut pipelines = pipelines_that_submit_once();
            pipelines
                .expect_get_run_status()
                .returning(|_| Ok(RunState::Succeeded));
            pipelines.expect_terminate_run().never();
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;
            pass(&kube, &ctx).await;
            assert_eq!(kube.status().phase, Phase::Ready);
            kube.request_deletion();
            let writes = kube.writes();

            let kb = kube.current().unwrap();
            let action = reconcile(Arc::new(kb), ctx.clone()).await;
            assert_eq!(action.unwrap(), Action::await_change());
            assert_eq!(kube.writes(), writes + 1);
            assert!(kube.current().is_none());
        }

        #[tokio::test]
        async fn cleanup_gives_up_after_max_attempts() {
            let kube = ready_kube();
            let mut pipelines = pipelines_that_submit_once();
            pipelines
                .expect_terminate_run()
                .returning(|_| Err(Error::api("kubeflow", 503, "unavailable")));
            let ctx = context(kube.clone(), pipelines);

            drive_to_submitted(&kube, &ctx).await;
            kube.request_deletion();

            for _ in 0..MAX_CLEANUP_ATTEMPTS {
                pass(&kube, &ctx).await;
            }
            assert!(find_condition(&kube.status().conditions, CONDITION_READY)
                .is_some_and(|c| c.reason != REASON_CLEANUP_FAILED));

            let action = pass(&kube, &ctx).await;
            assert_eq!(action, Action::requeue(Duration::from_secs(RETRY_MAX_DELAY_SECS)));
            let status = kube.status();
            assert_eq!(status.phase, Phase::Deleting);
            let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
            assert_eq!(ready.reason, REASON_CLEANUP_FAILED);
            assert!(kube.current().is_some());
        }
    }

    mod mocked_kube {
        use super::*;

        /// A missing finalizer is added before anything else happens
        #[tokio::test]
        async fn finalizer_added_first() {
            let mut kube = MockKubeClient::new();
            kube.expect_set_finalizers()
                .withf(|ns, name, finalizers, rv| {
                    ns == "team-a"
                        && name == "docs"
                        && finalizers == &vec![KNOWLEDGE_BASE_FINALIZER.to_string()]
                        && rv.as_deref() == Some("1")
                })
                .times(1)
                .returning(|_, _, _, _| Ok(()));
            kube.expect_patch_status().never();
            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockPipelineClient::new()),
                Arc::new(MockPackageFetcher::new()),
            ));

            let action = reconcile(Arc::new(sample_kb()), ctx).await.unwrap();
            assert_eq!(action, Action::requeue(PHASE_STEP_DELAY));
        }

        /// The finalizer patch carries the resourceVersion read after the
        /// Deleting status write, not the one the pass started from
        #[tokio::test]
        async fn finalizer_release_uses_fresh_resource_version() {
            let mut kb = sample_kb();
            kb.metadata.finalizers = Some(vec![KNOWLEDGE_BASE_FINALIZER.to_string()]);
            kb.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            kb.status = Some(KnowledgeBaseStatus {
                phase: Phase::Ready,
                ..Default::default()
            });
            let stored = Arc::new(std::sync::Mutex::new(kb.clone()));

            let mut kube = MockKubeClient::new();
            let reader = stored.clone();
            kube.expect_get_knowledge_base()
                .returning(move |_, _| Ok(Some(reader.lock().unwrap().clone())));
            let writer = stored.clone();
            kube.expect_patch_status()
                .times(1)
                .returning(move |_, _, rv, status| {
                    assert_eq!(rv, "1");
                    let mut kb = writer.lock().unwrap();
                    kb.status = Some(status.clone());
                    kb.metadata.resource_version = Some("2".to_string());
                    Ok(())
                });
            kube.expect_set_finalizers()
                .withf(|_, _, finalizers, rv| finalizers.is_empty() && rv.as_deref() == Some("2"))
                .times(1)
                .returning(|_, _, _, _| Ok(()));
            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockPipelineClient::new()),
                Arc::new(MockPackageFetcher::new()),
            ));

            let action = reconcile(Arc::new(kb), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
        }

        /// Status write conflicts that never resolve surface as an error
        #[tokio::test]
        async fn persistent_conflict_is_an_error() {
            let mut kb = sample_kb();
            kb.metadata.finalizers = Some(vec![KNOWLEDGE_BASE_FINALIZER.to_string()]);
            let stored = kb.clone();

            let mut kube = MockKubeClient::new();
            kube.expect_get_knowledge_base()
                .returning(move |_, _| Ok(Some(stored.clone())));
            kube.expect_patch_status()
                .returning(|_, _, _, _| Err(conflict()));
            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockPipelineClient::new()),
                Arc::new(MockPackageFetcher::new()),
            ));

            let err = reconcile(Arc::new(kb), ctx.clone()).await.unwrap_err();
            assert!(err.is_conflict());
            assert_eq!(
                error_policy(Arc::new(sample_kb()), &err, ctx),
                Action::requeue(Duration::from_secs(30))
            );
        }
    }

    mod parameters {
        use super::*;

        #[test]
        fn poll_delay_doubles_and_caps() {
            assert_eq!(poll_delay(0), Duration::from_secs(10));
            assert_eq!(poll_delay(1), Duration::from_secs(20));
            assert_eq!(poll_delay(5), Duration::from_secs(300));
            assert_eq!(poll_delay(50), Duration::from_secs(300));
        }

        #[test]
        fn run_parameters_cover_pipeline_inputs() {
            let params = run_parameters(&sample_kb(), "docs", "team-a");
            assert_eq!(params["url"], "https://example.com/docs");
            assert_eq!(params["embedding_model"], "e5-mistral");
            assert_eq!(params["embed_dim"], 4096);
            assert_eq!(params["embed_batch_size"], 10);
            assert_eq!(params["secret_name"], "pg");
            assert_eq!(params["secret_namespace"], "team-a");
            assert_eq!(params["db_host_read"], "pgvector-rw");
            assert_eq!(params["db_port"], 5432);
            assert_eq!(params["chunk_size"], "512");
            // operator-derived values win over spec parameters
            assert_eq!(params["table_name"], "docs");
        }

        #[test]
        fn job_name_is_deterministic_per_spec() {
            assert_eq!(job_name("docs", "team-a", "abc"), "docs-team-a-abc");
            assert_eq!(experiment_name("docs", "team-a"), "team-a-docs");
        }
    }

    mod package_upload {
        use super::*;
        use crate::pipeline::PipelinePackage;

        /// Specs with a pipeline URL upload the package before the run
        #[tokio::test]
        async fn url_spec_uploads_package_with_credentials() {
            let mut kb = sample_kb();
            kb.spec.pipeline.url = Some("https://git.example.com/rag.yaml".to_string());
            kb.spec.pipeline.version = Some("2.1.0".to_string());
            kb.spec.pipeline.auth_type = aiop_common::crd::PipelineAuthType::Bearer;
            kb.spec.pipeline.auth_secret_ref = Some(aiop_common::crd::SecretKeyRef {
                name: "git".to_string(),
                key: "token".to_string(),
            });
            let kube = FakeKube::with(kb);
            kube.add_secret("pg", &[("username", "app"), ("password", "hunter2")]);
            kube.add_secret("git", &[("token", "abc")]);

            let package = PipelinePackage {
                file_name: "rag.yaml".to_string(),
                content: b"pipelineSpec: {}".to_vec(),
            };
            let mut fetcher = MockPackageFetcher::new();
            let fetched = package.clone();
            fetcher
                .expect_fetch()
                .withf(|url, auth, _| {
                    url == "https://git.example.com/rag.yaml"
                        && *auth
                            == PipelineAuth::Bearer {
                                token: "abc".to_string(),
                            }
                })
                .times(1)
                .returning(move |_, _, _| {
                    Ok(FetchResult::Fetched {
                        package: fetched.clone(),
                        validators: CacheValidators::default(),
                    })
                });

            let mut pipelines = MockPipelineClient::new();
            pipelines
                .expect_upload_package()
                .with(eq("docs-indexing"), eq("docs-indexing 2.1.0"), eq(package))
                .times(1)
                .returning(|_, _, _| {
                    Ok(PipelineVersionRef {
                        pipeline_id: "p-1".to_string(),
                        version_id: "v-9".to_string(),
                    })
                });
            pipelines.expect_find_pipeline().never();
            pipelines
                .expect_ensure_experiment()
                .returning(|_| Ok("e-1".to_string()));
            pipelines.expect_find_run().returning(|_, _| Ok(None));
            pipelines
                .expect_submit_run()
                .withf(|request| request.version.version_id == "v-9")
                .times(1)
                .returning(|_| Ok("r-1".to_string()));

            let ctx = Arc::new(Context::for_testing(
                kube.clone(),
                Arc::new(pipelines),
                Arc::new(fetcher),
            ));
            drive_to_submitted(&kube, &ctx).await;
            assert_eq!(kube.status().last_run_id.as_deref(), Some("r-1"));
        }
    }
}
