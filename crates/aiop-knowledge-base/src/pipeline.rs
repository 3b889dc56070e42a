//! Kubeflow Pipelines client
//!
//! Thin wrapper over the v2beta1 REST API covering what the controller and
//! the pipeline-source sync need: pipeline and version lookup, package
//! upload, experiments and runs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use aiop_common::Error;

/// Service name used in errors
const SERVICE: &str = "kubeflow";

/// Request timeout for all pipeline API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pipeline and version identifiers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineVersionRef {
    /// Pipeline identifier
    pub pipeline_id: String,
    /// Version identifier
    pub version_id: String,
}

/// A pipeline package ready for upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelinePackage {
    /// File name sent with the upload; the extension tells the pipeline
    /// service how to read it (`.yaml`, `.zip`, `.tar.gz`)
    pub file_name: String,
    /// Raw package bytes
    pub content: Vec<u8>,
}

/// A run to submit
#[derive(Clone, Debug, PartialEq)]
pub struct RunRequest {
    /// Display name, also the idempotency key for the run
    pub display_name: String,
    /// Experiment to file the run under
    pub experiment_id: String,
    /// Pipeline version to execute
    pub version: PipelineVersionRef,
    /// Runtime parameters
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Coarse state of a pipeline run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Accepted, not started
    Pending,
    /// Executing
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Terminated before finishing
    Canceled,
    /// A state this client does not know; treated as still running
    Unknown(String),
}

impl RunState {
    /// Map a v2beta1 `state` string
    pub fn from_api(state: &str) -> Self {
        match state {
            "PENDING" | "RUNTIME_STATE_UNSPECIFIED" => Self::Pending,
            "RUNNING" | "PAUSED" | "CANCELING" => Self::Running,
            "SUCCEEDED" | "SKIPPED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "CANCELED" => Self::Canceled,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether the run has stopped
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Value recorded in `status.runState`
    pub fn as_status(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Unknown(s) => s,
        }
    }
}

/// Operations against the pipeline service
///
/// Implementations return `Ok(None)` for lookups that find nothing; HTTP
/// failures map onto [`Error`] so the failure taxonomy applies.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PipelineClient: Send + Sync {
    /// Find a pipeline by display name
    async fn find_pipeline(&self, display_name: &str) -> Result<Option<String>, Error>;

    /// Most recently created version of a pipeline
    async fn latest_version(&self, pipeline_id: &str) -> Result<Option<String>, Error>;

    /// Upload a package as `version_name` of `display_name`, creating the
    /// pipeline when it does not exist yet
    ///
    /// Uploading a version name that already exists returns the existing
    /// version.
    async fn upload_package(
        &self,
        display_name: &str,
        version_name: &str,
        package: PipelinePackage,
    ) -> Result<PipelineVersionRef, Error>;

    /// Find or create an experiment, returning its id
    async fn ensure_experiment(&self, name: &str) -> Result<String, Error>;

    /// Find a run by display name inside an experiment
    async fn find_run(&self, experiment_id: &str, display_name: &str)
        -> Result<Option<String>, Error>;

    /// Submit a run, returning its id
    async fn submit_run(&self, request: &RunRequest) -> Result<String, Error>;

    /// Current state of a run
    async fn get_run_status(&self, run_id: &str) -> Result<RunState, Error>;

    /// Terminate a run; finished or missing runs are not an error
    async fn terminate_run(&self, run_id: &str) -> Result<(), Error>;
}

// =============================================================================
// Wire types (v2beta1)
// =============================================================================

#[derive(Deserialize)]
struct Pipeline {
    pipeline_id: String,
}

#[derive(Deserialize, Default)]
struct ListPipelines {
    #[serde(default)]
    pipelines: Vec<Pipeline>,
}

#[derive(Deserialize)]
struct PipelineVersion {
    pipeline_id: Option<String>,
    pipeline_version_id: String,
}

#[derive(Deserialize, Default)]
struct ListPipelineVersions {
    #[serde(default)]
    pipeline_versions: Vec<PipelineVersion>,
}

#[derive(Deserialize)]
struct Experiment {
    experiment_id: String,
}

#[derive(Deserialize, Default)]
struct ListExperiments {
    #[serde(default)]
    experiments: Vec<Experiment>,
}

#[derive(Serialize)]
struct CreateExperiment<'a> {
    display_name: &'a str,
    description: String,
}

#[derive(Deserialize)]
struct Run {
    run_id: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize, Default)]
struct ListRuns {
    #[serde(default)]
    runs: Vec<Run>,
}

#[derive(Serialize)]
struct PipelineVersionReference<'a> {
    pipeline_id: &'a str,
    pipeline_version_id: &'a str,
}

#[derive(Serialize)]
struct RuntimeConfig<'a> {
    parameters: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct CreateRun<'a> {
    display_name: &'a str,
    experiment_id: &'a str,
    pipeline_version_reference: PipelineVersionReference<'a>,
    runtime_config: RuntimeConfig<'a>,
}

/// Filter matching `display_name` exactly
fn display_name_filter(name: &str) -> String {
    serde_json::json!({
        "predicates": [{
            "operation": "EQUALS",
            "key": "display_name",
            "string_value": name,
        }]
    })
    .to_string()
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// Kubeflow Pipelines REST client
#[derive(Debug, Clone)]
pub struct KubeflowClient {
    base_url: String,
    http: HttpClient,
    token: Option<String>,
}

impl KubeflowClient {
    /// Create a client for the API at `base_url` (e.g. `http://ml-pipeline.kubeflow:8888`)
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::validation_for_field(
                "operator",
                "KUBEFLOW_ENDPOINT",
                format!("URL must start with http:// or https://, got: {base_url}"),
            ));
        }
        let http = HttpClient::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url,
            http,
            token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` on every request
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        format!(
            "{}/apis/v2beta1/{}",
            self.base_url.trim_end_matches('/'),
            path
        )
    }

    fn with_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, Error> {
        let response = self.with_auth(builder).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::api(SERVICE, status.as_u16(), body))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, Error> {
        let response = self.send(self.http.get(self.url(path)).query(query)).await?;
        Ok(response.json().await?)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let response = self.send(self.http.post(self.url(path)).json(body)).await?;
        Ok(response.json().await?)
    }

    async fn upload(
        &self,
        path: &str,
        query: &[(&str, &str)],
        package: PipelinePackage,
    ) -> Result<Response, Error> {
        let part = reqwest::multipart::Part::bytes(package.content).file_name(package.file_name);
        let form = reqwest::multipart::Form::new().part("uploadfile", part);
        self.send(self.http.post(self.url(path)).query(query).multipart(form))
            .await
    }

    async fn find_version(
        &self,
        pipeline_id: &str,
        display_name: &str,
    ) -> Result<Option<String>, Error> {
        let filter = display_name_filter(display_name);
        let list: ListPipelineVersions = self
            .get_json(
                &format!("pipelines/{pipeline_id}/versions"),
                &[("filter", filter.as_str())],
            )
            .await?;
        Ok(list
            .pipeline_versions
            .into_iter()
            .next()
            .map(|v| v.pipeline_version_id))
    }
}

#[async_trait]
impl PipelineClient for KubeflowClient {
    async fn find_pipeline(&self, display_name: &str) -> Result<Option<String>, Error> {
        let filter = display_name_filter(display_name);
        let list: ListPipelines = self
            .get_json("pipelines", &[("filter", filter.as_str())])
            .await?;
        Ok(list.pipelines.into_iter().next().map(|p| p.pipeline_id))
    }

    async fn latest_version(&self, pipeline_id: &str) -> Result<Option<String>, Error> {
        let list: ListPipelineVersions = self
            .get_json(
                &format!("pipelines/{pipeline_id}/versions"),
                &[("page_size", "1"), ("sort_by", "created_at desc")],
            )
            .await?;
        Ok(list
            .pipeline_versions
            .into_iter()
            .next()
            .map(|v| v.pipeline_version_id))
    }

    async fn upload_package(
        &self,
        display_name: &str,
        version_name: &str,
        package: PipelinePackage,
    ) -> Result<PipelineVersionRef, Error> {
        match self.find_pipeline(display_name).await? {
            Some(pipeline_id) => {
                if let Some(version_id) = self.find_version(&pipeline_id, version_name).await? {
                    debug!(pipeline = %display_name, version = %version_name, "pipeline version already uploaded");
                    return Ok(PipelineVersionRef {
                        pipeline_id,
                        version_id,
                    });
                }
                debug!(pipeline = %display_name, version = %version_name, "uploading pipeline version");
                let response = self
                    .upload(
                        "pipelines/upload_version",
                        &[
                            ("name", version_name),
                            ("display_name", version_name),
                            ("pipeline_id", pipeline_id.as_str()),
                        ],
                        package,
                    )
                    .await?;
                let version: PipelineVersion = response.json().await?;
                Ok(PipelineVersionRef {
                    pipeline_id: version.pipeline_id.unwrap_or(pipeline_id),
                    version_id: version.pipeline_version_id,
                })
            }
            None => {
                debug!(pipeline = %display_name, "uploading new pipeline");
                let response = self
                    .upload(
                        "pipelines/upload",
                        &[("name", display_name), ("display_name", display_name)],
                        package,
                    )
                    .await?;
                let pipeline: Pipeline = response.json().await?;
                let version_id = self
                    .latest_version(&pipeline.pipeline_id)
                    .await?
                    .ok_or_else(|| {
                        Error::api(
                            SERVICE,
                            404,
                            format!("pipeline '{display_name}' has no versions after upload"),
                        )
                    })?;
                Ok(PipelineVersionRef {
                    pipeline_id: pipeline.pipeline_id,
                    version_id,
                })
            }
        }
    }

    async fn ensure_experiment(&self, name: &str) -> Result<String, Error> {
        let filter = display_name_filter(name);
        let list: ListExperiments = self
            .get_json("experiments", &[("filter", filter.as_str())])
            .await?;
        if let Some(existing) = list.experiments.into_iter().next() {
            return Ok(existing.experiment_id);
        }
        let created: Experiment = self
            .post_json(
                "experiments",
                &CreateExperiment {
                    display_name: name,
                    description: format!("Indexing runs for knowledge base {name}"),
                },
            )
            .await?;
        Ok(created.experiment_id)
    }

    async fn find_run(
        &self,
        experiment_id: &str,
        display_name: &str,
    ) -> Result<Option<String>, Error> {
        let filter = display_name_filter(display_name);
        let list: ListRuns = self
            .get_json(
                "runs",
                &[
                    ("experiment_id", experiment_id),
                    ("filter", filter.as_str()),
                ],
            )
            .await?;
        Ok(list.runs.into_iter().next().map(|r| r.run_id))
    }

    async fn submit_run(&self, request: &RunRequest) -> Result<String, Error> {
        let body = CreateRun {
            display_name: &request.display_name,
            experiment_id: &request.experiment_id,
            pipeline_version_reference: PipelineVersionReference {
                pipeline_id: &request.version.pipeline_id,
                pipeline_version_id: &request.version.version_id,
            },
            runtime_config: RuntimeConfig {
                parameters: &request.parameters,
            },
        };
        let run: Run = self.post_json("runs", &body).await?;
        Ok(run.run_id)
    }

    async fn get_run_status(&self, run_id: &str) -> Result<RunState, Error> {
        let run: Run = self.get_json(&format!("runs/{run_id}"), &[]).await?;
        Ok(run
            .state
            .as_deref()
            .map(RunState::from_api)
            .unwrap_or(RunState::Pending))
    }

    async fn terminate_run(&self, run_id: &str) -> Result<(), Error> {
        let result = self
            .send(self.http.post(self.url(&format!("runs/{run_id}:terminate"))))
            .await;
        match result {
            Ok(_) => Ok(()),
            // 404: already gone; 400/412: already finished
            Err(Error::Api { status, .. }) if matches!(status, 400 | 404 | 412) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiop_common::FailureKind;
    use rstest::rstest;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> KubeflowClient {
        KubeflowClient::new(server.uri()).unwrap()
    }

    fn package() -> PipelinePackage {
        PipelinePackage {
            file_name: "pipeline.yaml".to_string(),
            content: b"pipelineSpec: {}".to_vec(),
        }
    }

    #[rstest]
    #[case::pending("PENDING", RunState::Pending)]
    #[case::running("RUNNING", RunState::Running)]
    #[case::succeeded("SUCCEEDED", RunState::Succeeded)]
    #[case::failed("FAILED", RunState::Failed)]
    #[case::canceled("CANCELED", RunState::Canceled)]
    #[case::unknown("EXPLODED", RunState::Unknown("EXPLODED".to_string()))]
    fn run_states_map_from_api(#[case] raw: &str, #[case] expected: RunState) {
        assert_eq!(RunState::from_api(raw), expected);
    }

    #[test]
    fn unknown_state_is_not_finished() {
        assert!(!RunState::Unknown("X".into()).is_finished());
        assert!(RunState::Canceled.is_finished());
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = KubeflowClient::new("ml-pipeline:8888").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
    }

    #[tokio::test]
    async fn find_pipeline_by_display_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/pipelines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pipelines": [{"pipeline_id": "p-1", "display_name": "docs-indexing"}],
                "total_size": 1
            })))
            .mount(&server)
            .await;

        let found = client(&server).await.find_pipeline("docs-indexing").await.unwrap();
        assert_eq!(found.as_deref(), Some("p-1"));
    }

    #[tokio::test]
    async fn missing_pipeline_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/pipelines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let found = client(&server).await.find_pipeline("nope").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn latest_version_asks_for_newest_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/pipelines/p-1/versions"))
            .and(query_param("page_size", "1"))
            .and(query_param("sort_by", "created_at desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pipeline_versions": [{"pipeline_id": "p-1", "pipeline_version_id": "v-9"}]
            })))
            .mount(&server)
            .await;

        let version = client(&server).await.latest_version("p-1").await.unwrap();
        assert_eq!(version.as_deref(), Some("v-9"));
    }

    #[tokio::test]
    async fn ensure_experiment_creates_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/experiments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"experiments": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apis/v2beta1/experiments"))
            .and(body_partial_json(json!({"display_name": "team-a-docs"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"experiment_id": "e-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server).await.ensure_experiment("team-a-docs").await.unwrap();
        assert_eq!(id, "e-1");
    }

    #[tokio::test]
    async fn submit_run_sends_version_reference_and_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apis/v2beta1/runs"))
            .and(body_partial_json(json!({
                "display_name": "docs-team-a-abc",
                "experiment_id": "e-1",
                "pipeline_version_reference": {"pipeline_id": "p-1", "pipeline_version_id": "v-1"},
                "runtime_config": {"parameters": {"table_name": "docs"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "run_id": "r-1", "state": "PENDING"
            })))
            .mount(&server)
            .await;

        let request = RunRequest {
            display_name: "docs-team-a-abc".to_string(),
            experiment_id: "e-1".to_string(),
            version: PipelineVersionRef {
                pipeline_id: "p-1".to_string(),
                version_id: "v-1".to_string(),
            },
            parameters: BTreeMap::from([("table_name".to_string(), json!("docs"))]),
        };
        let run_id = client(&server).await.submit_run(&request).await.unwrap();
        assert_eq!(run_id, "r-1");
    }

    #[tokio::test]
    async fn run_status_is_read() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/runs/r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "run_id": "r-1", "state": "SUCCEEDED"
            })))
            .mount(&server)
            .await;

        let state = client(&server).await.get_run_status("r-1").await.unwrap();
        assert_eq!(state, RunState::Succeeded);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/runs/r-1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let err = client(&server).await.get_run_status("r-1").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transient);
        assert!(err.to_string().contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn missing_run_is_reported_as_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/runs/r-1"))
            .respond_with(ResponseTemplate::new(404).set_body_string("run not found"))
            .mount(&server)
            .await;

        let err = client(&server).await.get_run_status("r-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn forbidden_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/pipelines"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = client(&server).await.find_pipeline("docs").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Unauthorized);
    }

    #[tokio::test]
    async fn terminating_a_missing_run_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apis/v2beta1/runs/r-1:terminate"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(client(&server).await.terminate_run("r-1").await.is_ok());
    }

    #[tokio::test]
    async fn upload_adds_version_to_existing_pipeline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/pipelines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pipelines": [{"pipeline_id": "p-1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/pipelines/p-1/versions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apis/v2beta1/pipelines/upload_version"))
            .and(query_param("pipeline_id", "p-1"))
            .and(query_param("name", "docs-indexing 1.0.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pipeline_id": "p-1", "pipeline_version_id": "v-2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let version = client(&server)
            .await
            .upload_package("docs-indexing", "docs-indexing 1.0.0", package())
            .await
            .unwrap();
        assert_eq!(
            version,
            PipelineVersionRef {
                pipeline_id: "p-1".to_string(),
                version_id: "v-2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn existing_version_is_not_uploaded_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/pipelines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pipelines": [{"pipeline_id": "p-1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/apis/v2beta1/pipelines/p-1/versions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pipeline_versions": [{"pipeline_version_id": "v-1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apis/v2beta1/pipelines/upload_version"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let version = client(&server)
            .await
            .upload_package("docs-indexing", "docs-indexing 1.0.0", package())
            .await
            .unwrap();
        assert_eq!(version.version_id, "v-1");
    }
}
