//! Pipeline-source sync
//!
//! Keeps the pipeline service stocked with the packages listed in the
//! `pipelines` ConfigMap of the operator namespace. Each entry is a JSON
//! document keyed by pipeline name:
//!
//! ```json
//! {"url": "https://example.com/rag.zip", "version": "1.2.0",
//!  "auth_type": "bearer", "auth_secret_name": "git", "auth_secret_key": "token"}
//! ```
//!
//! The ConfigMap is re-read on one interval; each source is fetched with
//! conditional request headers on another. A changed package is unpacked
//! when it is a zip, and every pipeline file in it is uploaded under its
//! `pipelineInfo.name` as version `<pipeline> <version>`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use aiop_common::crd::{PipelineAuthType, SecretKeyRef, DEFAULT_PIPELINE_VERSION};
use aiop_common::retry::{retry_with_backoff, RetryConfig};
use aiop_common::Error;

use crate::credentials::{pipeline_auth, required_secret_ref, PipelineAuth};
use crate::error::SourceError;
use crate::package::{pipeline_files, pipeline_name};
use crate::pipeline::{PipelineClient, PipelinePackage};

/// Largest package accepted from a pipeline source (32 MiB)
pub const MAX_PACKAGE_SIZE: u64 = 32 * 1024 * 1024;

/// Timeout for a single package download
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Service name used in errors
const SERVICE: &str = "pipeline-source";

/// One entry of the pipelines ConfigMap
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SourceEntry {
    /// Package download URL
    pub url: String,
    /// Version label, `1.0.0` when absent
    #[serde(default)]
    pub version: Option<String>,
    /// Download authentication
    #[serde(default)]
    pub auth_type: PipelineAuthType,
    /// Secret holding the credential
    #[serde(default)]
    pub auth_secret_name: Option<String>,
    /// Key inside the secret
    #[serde(default)]
    pub auth_secret_key: Option<String>,
}

impl SourceEntry {
    fn parse(name: &str, raw: &str) -> Result<Self, SourceError> {
        let entry: SourceEntry =
            serde_json::from_str(raw).map_err(|e| SourceError::InvalidEntry {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        if !entry.url.starts_with("http://") && !entry.url.starts_with("https://") {
            return Err(SourceError::InvalidEntry {
                name: name.to_string(),
                message: format!("url must be http(s), got '{}'", entry.url),
            });
        }
        Ok(entry)
    }

    /// Version label with default fallback
    pub fn version_label(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_PIPELINE_VERSION)
    }

    fn secret_ref(&self) -> Option<SecretKeyRef> {
        match (&self.auth_secret_name, &self.auth_secret_key) {
            (Some(name), Some(key)) => Some(SecretKeyRef {
                name: name.clone(),
                key: key.clone(),
            }),
            _ => None,
        }
    }
}

/// Parse every entry of the ConfigMap, logging and skipping invalid ones
pub fn parse_sources(data: &BTreeMap<String, String>) -> BTreeMap<String, SourceEntry> {
    data.iter()
        .filter_map(|(name, raw)| match SourceEntry::parse(name, raw) {
            Ok(entry) => Some((name.clone(), entry)),
            Err(e) => {
                warn!(source = %name, error = %e, "skipping invalid pipeline source");
                None
            }
        })
        .collect()
}

/// Version name under which a package is uploaded
pub fn version_name(pipeline: &str, version: &str) -> String {
    format!("{pipeline} {version}")
}

// =============================================================================
// Package download
// =============================================================================

/// Conditional-request validators from a previous download
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheValidators {
    /// `ETag` response header
    pub etag: Option<String>,
    /// `Last-Modified` response header
    pub last_modified: Option<String>,
}

/// Result of a package download
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchResult {
    /// The server answered 304
    NotModified,
    /// A new package body
    Fetched {
        /// The package
        package: PipelinePackage,
        /// Validators to send next time
        validators: CacheValidators,
    },
}

/// Downloads pipeline packages
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Fetch `url`, sending `validators` as conditional headers
    async fn fetch(
        &self,
        url: &str,
        auth: &PipelineAuth,
        validators: &CacheValidators,
    ) -> Result<FetchResult, SourceError>;
}

/// reqwest-backed [`PackageFetcher`] with a size limit
#[derive(Debug, Clone)]
pub struct HttpPackageFetcher {
    http: HttpClient,
    max_size: u64,
}

impl HttpPackageFetcher {
    /// Create a fetcher enforcing [`MAX_PACKAGE_SIZE`]
    pub fn new() -> Result<Self, Error> {
        Self::with_max_size(MAX_PACKAGE_SIZE)
    }

    /// Create a fetcher with a custom size limit
    pub fn with_max_size(max_size: u64) -> Result<Self, Error> {
        let http = HttpClient::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        Ok(Self { http, max_size })
    }
}

/// File name for an uploaded package, from the URL or the content type
fn package_file_name(url: &str, content_type: Option<&str>) -> String {
    let last = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .unwrap_or_default();
    let known = [".yaml", ".yml", ".zip", ".tar.gz", ".tgz"];
    if known.iter().any(|ext| last.ends_with(ext)) {
        return last.to_string();
    }
    match content_type {
        Some(ct) if ct.contains("zip") => "pipeline.zip".to_string(),
        Some(ct) if ct.contains("gzip") => "pipeline.tar.gz".to_string(),
        _ => "pipeline.yaml".to_string(),
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl PackageFetcher for HttpPackageFetcher {
    async fn fetch(
        &self,
        url: &str,
        auth: &PipelineAuth,
        validators: &CacheValidators,
    ) -> Result<FetchResult, SourceError> {
        let mut request = auth.apply(self.http.get(url));
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let mut response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!(%url, "pipeline package unchanged");
            return Ok(FetchResult::NotModified);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::api(SERVICE, status.as_u16(), body).into());
        }

        let too_large = || SourceError::TooLarge {
            url: url.to_string(),
            limit: self.max_size,
        };
        if response.content_length().is_some_and(|len| len > self.max_size) {
            return Err(too_large());
        }

        let headers = response.headers().clone();
        let mut content = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (content.len() + chunk.len()) as u64 > self.max_size {
                return Err(too_large());
            }
            content.extend_from_slice(&chunk);
        }

        let content_type = header_string(&headers, CONTENT_TYPE);
        Ok(FetchResult::Fetched {
            package: PipelinePackage {
                file_name: package_file_name(url, content_type.as_deref()),
                content,
            },
            validators: CacheValidators {
                etag: header_string(&headers, ETAG),
                last_modified: header_string(&headers, LAST_MODIFIED),
            },
        })
    }
}

// =============================================================================
// Sync loop
// =============================================================================

/// Cluster reads needed by the sync loop
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Read a ConfigMap, `None` when absent
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Read a Secret, `None` when absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
}

/// [`SourceStore`] backed by the cluster API
pub struct KubeSourceStore {
    client: Client,
}

impl KubeSourceStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceStore for KubeSourceStore {
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Settings for [`PipelineSync`]
#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// Namespace holding the ConfigMap and credential secrets
    pub namespace: String,
    /// ConfigMap name
    pub config_map: String,
    /// How often the ConfigMap is re-read
    pub config_interval: Duration,
    /// How often each source is fetched
    pub fetch_interval: Duration,
}

/// Keeps configured pipeline packages uploaded
pub struct PipelineSync {
    store: Arc<dyn SourceStore>,
    pipelines: Arc<dyn PipelineClient>,
    fetcher: Arc<dyn PackageFetcher>,
    settings: SyncSettings,
    retry: RetryConfig,
    sources: BTreeMap<String, SourceEntry>,
    validators: BTreeMap<String, CacheValidators>,
}

impl PipelineSync {
    /// Create a sync loop with no sources loaded yet
    pub fn new(
        store: Arc<dyn SourceStore>,
        pipelines: Arc<dyn PipelineClient>,
        fetcher: Arc<dyn PackageFetcher>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            pipelines,
            fetcher,
            settings,
            retry: RetryConfig::default(),
            sources: BTreeMap::new(),
            validators: BTreeMap::new(),
        }
    }

    /// Retry policy for cluster reads and uploads
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Currently configured sources
    pub fn sources(&self) -> &BTreeMap<String, SourceEntry> {
        &self.sources
    }

    /// Re-read the ConfigMap; a missing ConfigMap means no sources
    ///
    /// Sources whose entry changed or disappeared lose their cached
    /// validators so the next fetch downloads them in full.
    pub async fn refresh_config(&mut self) -> Result<(), Error> {
        let (namespace, name) = (&self.settings.namespace, &self.settings.config_map);
        let data = retry_with_backoff(&self.retry, "get_config_map", || {
            self.store.get_config_map(namespace, name)
        })
        .await?
        .and_then(|cm| cm.data)
        .unwrap_or_default();
        let sources = parse_sources(&data);

        self.validators
            .retain(|name, _| sources.get(name) == self.sources.get(name));
        if sources != self.sources {
            info!(count = sources.len(), "pipeline sources updated");
        }
        self.sources = sources;
        Ok(())
    }

    /// Fetch every source once and upload changed packages
    ///
    /// Failures are logged per source and do not stop the others.
    pub async fn sync_once(&mut self) {
        let names: Vec<String> = self.sources.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.sync_source(&name).await {
                warn!(source = %name, error = %e, "pipeline source sync failed");
            }
        }
    }

    async fn sync_source(&mut self, name: &str) -> Result<(), SourceError> {
        let Some(entry) = self.sources.get(name).cloned() else {
            return Ok(());
        };
        let auth = self.resolve_auth(name, &entry).await?;
        let cached = self.validators.get(name).cloned().unwrap_or_default();

        match self.fetcher.fetch(&entry.url, &auth, &cached).await? {
            FetchResult::NotModified => Ok(()),
            FetchResult::Fetched {
                package,
                validators,
            } => {
                let files = pipeline_files(package, MAX_PACKAGE_SIZE)?;
                if files.is_empty() {
                    warn!(source = %name, "package contains no pipeline files");
                }
                for file in files {
                    self.upload(name, entry.version_label(), file).await?;
                }
                self.validators.insert(name.to_string(), validators);
                Ok(())
            }
        }
    }

    async fn upload(&self, source: &str, label: &str, file: PipelinePackage) -> Result<(), Error> {
        let pipeline = pipeline_name(&file);
        let version = version_name(&pipeline, label);
        let uploaded = retry_with_backoff(&self.retry, "upload_package", || {
            self.pipelines
                .upload_package(&pipeline, &version, file.clone())
        })
        .await?;
        info!(
            %source,
            %pipeline,
            %version,
            pipeline_id = %uploaded.pipeline_id,
            "pipeline package uploaded"
        );
        Ok(())
    }

    async fn resolve_auth(&self, name: &str, entry: &SourceEntry) -> Result<PipelineAuth, SourceError> {
        let secret_ref = entry.secret_ref();
        let Some(secret_ref) =
            required_secret_ref(entry.auth_type, secret_ref.as_ref(), name, "auth_secret_name")?
        else {
            return Ok(PipelineAuth::None);
        };
        let namespace = &self.settings.namespace;
        let secret = retry_with_backoff(&self.retry, "get_secret", || {
            self.store.get_secret(namespace, &secret_ref.name)
        })
        .await?;
        Ok(pipeline_auth(
            entry.auth_type,
            secret_ref,
            secret.as_ref(),
            &self.settings.namespace,
            name,
        )?)
    }

    /// Run until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut config_tick = tokio::time::interval(self.settings.config_interval);
        config_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut fetch_tick = tokio::time::interval(self.settings.fetch_interval);
        fetch_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = std::pin::pin!(shutdown);

        info!(
            namespace = %self.settings.namespace,
            config_map = %self.settings.config_map,
            "pipeline source sync started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("pipeline source sync stopped");
                    return;
                }
                _ = config_tick.tick() => {
                    if let Err(e) = self.refresh_config().await {
                        warn!(error = %e, "failed to read pipeline sources");
                    }
                }
                _ = fetch_tick.tick() => {
                    self.sync_once().await;
                }
            }
        }
    }
}
