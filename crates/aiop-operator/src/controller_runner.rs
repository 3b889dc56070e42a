//! Controller runner - builds controller futures for each kind
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. With watch namespaces configured there is one controller
//! per namespace per kind, otherwise one cluster-wide controller per kind.
//! Every controller comes with a sampler that reports its cached objects
//! per phase to the resources gauge.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use aiop_common::config::OperatorConfig;
use aiop_common::crd::{Agent, KnowledgeBase, Phase};
use aiop_common::kube_utils::reconcile_trigger;
use aiop_common::metrics::set_phase_counts;
use aiop_knowledge_base::sync::{HttpPackageFetcher, KubeSourceStore, PipelineSync, SyncSettings};
use aiop_knowledge_base::{KubeflowClient, PackageFetcher, PipelineClient};

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// How often the resources-by-phase gauge is sampled from the cache
const PHASE_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Where a controller watches
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchScope {
    /// All namespaces
    Cluster,
    /// A single namespace
    Namespace(String),
}

/// Scopes to run controllers for, one per configured namespace
pub fn watch_scopes(config: &OperatorConfig) -> Vec<WatchScope> {
    let namespaces = config.namespaces();
    if namespaces.is_empty() {
        vec![WatchScope::Cluster]
    } else {
        namespaces.into_iter().map(WatchScope::Namespace).collect()
    }
}

/// Label for the `scope` metric attribute
pub fn scope_label(scope: &WatchScope) -> String {
    match scope {
        WatchScope::Cluster => "cluster".to_string(),
        WatchScope::Namespace(ns) => ns.clone(),
    }
}

fn scoped_api<K>(client: Client, scope: &WatchScope) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match scope {
        WatchScope::Cluster => Api::all(client),
        WatchScope::Namespace(ns) => Api::namespaced(client, ns),
    }
}

/// Watch stream that only yields objects whose generation, deletion state,
/// finalizers or reconcile-request annotation changed
fn filtered_watch<K>(
    api: Api<K>,
) -> (
    Store<K>,
    impl Stream<Item = Result<K, watcher::Error>> + Send + 'static,
)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(
        writer,
        watcher::watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)),
    )
    .default_backoff()
    .applied_objects()
    .predicate_filter(|obj: &K| reconcile_trigger(obj.meta()));
    (reader, stream)
}

/// Build KnowledgeBase controller futures
///
/// Returns an empty list when no Kubeflow endpoint is configured.
pub fn build_knowledge_base_controllers(
    client: Client,
    config: &OperatorConfig,
) -> anyhow::Result<Vec<ControllerFuture>> {
    let Some(endpoint) = config.kubeflow_endpoint.as_deref() else {
        tracing::warn!("KUBEFLOW_ENDPOINT not set, KnowledgeBase controller disabled");
        return Ok(Vec::new());
    };
    let pipelines: Arc<dyn PipelineClient> = Arc::new(KubeflowClient::new(endpoint)?);
    let fetcher: Arc<dyn PackageFetcher> = Arc::new(HttpPackageFetcher::new()?);

    let mut futures: Vec<ControllerFuture> = Vec::new();
    for scope in watch_scopes(config) {
        let ctx = Arc::new(
            aiop_knowledge_base::Context::builder(
                client.clone(),
                pipelines.clone(),
                fetcher.clone(),
            )
            .build(),
        );
        let (reader, stream) = filtered_watch(scoped_api::<KnowledgeBase>(client.clone(), &scope));
        futures.push(Box::pin(sample_phases(
            "KnowledgeBase",
            scope_label(&scope),
            reader.clone(),
            knowledge_base_phase,
        )));

        tracing::info!(?scope, "- KnowledgeBase controller");
        futures.push(Box::pin(
            Controller::for_stream(stream, reader)
                .with_config(ControllerConfig::default().concurrency(config.workers))
                .shutdown_on_signal()
                .run(
                    aiop_knowledge_base::reconcile,
                    aiop_knowledge_base::error_policy,
                    ctx,
                )
                .for_each(log_reconcile_result("KnowledgeBase")),
        ));
    }

    let sync = PipelineSync::new(
        Arc::new(KubeSourceStore::new(client)),
        pipelines,
        fetcher,
        SyncSettings {
            namespace: config.operator_namespace.clone(),
            config_map: config.pipelines_configmap.clone(),
            config_interval: config.pipeline_config_interval,
            fetch_interval: config.pipeline_fetch_interval,
        },
    );
    tracing::info!("- pipeline source sync");
    futures.push(Box::pin(sync.run(shutdown_signal())));

    Ok(futures)
}

/// Build Agent controller futures
pub fn build_agent_controllers(client: Client, config: &OperatorConfig) -> Vec<ControllerFuture> {
    let mut futures: Vec<ControllerFuture> = Vec::new();
    for scope in watch_scopes(config) {
        let ctx = Arc::new(aiop_agent::Context::builder(client.clone(), config).build());
        let (reader, stream) = filtered_watch(scoped_api::<Agent>(client.clone(), &scope));
        futures.push(Box::pin(sample_phases(
            "Agent",
            scope_label(&scope),
            reader.clone(),
            agent_phase,
        )));

        tracing::info!(?scope, provider = %config.provider, "- Agent controller");
        futures.push(Box::pin(
            Controller::for_stream(stream, reader)
                .with_config(ControllerConfig::default().concurrency(config.workers))
                .shutdown_on_signal()
                .run(aiop_agent::reconcile, aiop_agent::error_policy, ctx)
                .for_each(log_reconcile_result("Agent")),
        ));
    }
    futures
}

fn knowledge_base_phase(kb: &KnowledgeBase) -> Phase {
    kb.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

fn agent_phase(agent: &Agent) -> Phase {
    agent.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

/// Record the phase distribution of the cache until shutdown
async fn sample_phases<K>(
    kind: &'static str,
    scope: String,
    reader: Store<K>,
    phase_of: fn(&K) -> Phase,
) where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let mut tick = tokio::time::interval(PHASE_SAMPLE_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = std::pin::pin!(shutdown_signal());
    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tick.tick() => {
                let objects = reader.state();
                set_phase_counts(kind, &scope, objects.iter().map(|obj| phase_of(obj)));
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    fn config(args: &[&str]) -> OperatorConfig {
        let mut argv = vec!["aiop-operator"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).config
    }

    #[test]
    fn no_namespaces_watches_cluster_wide() {
        assert_eq!(watch_scopes(&config(&[])), vec![WatchScope::Cluster]);
    }

    #[test]
    fn scopes_label_metrics() {
        assert_eq!(scope_label(&WatchScope::Cluster), "cluster");
        assert_eq!(scope_label(&WatchScope::Namespace("team-a".to_string())), "team-a");
    }

    #[test]
    fn unreconciled_objects_count_as_pending() {
        let kb: KnowledgeBase = serde_json::from_value(serde_json::json!({
            "apiVersion": "akamai.io/v1alpha1",
            "kind": "KnowledgeBase",
            "metadata": {"name": "docs", "namespace": "team-a"},
            "spec": {
                "pipeline": {"name": "docs-indexing"},
                "database": {"host": "pgvector-rw", "name": "app", "secretRef": "pg"},
                "data": {"url": "https://example.com/docs"},
                "embedding": {
                    "modelName": "e5-mistral",
                    "modelEndpoint": "http://e5.models.svc/v1",
                    "dimension": 4096
                }
            }
        }))
        .unwrap();
        assert_eq!(knowledge_base_phase(&kb), Phase::Pending);
    }

    #[test]
    fn one_scope_per_namespace() {
        let scopes = watch_scopes(&config(&["--watch-namespaces", "team-a, ,team-b"]));
        assert_eq!(
            scopes,
            vec![
                WatchScope::Namespace("team-a".to_string()),
                WatchScope::Namespace("team-b".to_string()),
            ]
        );
    }
}
