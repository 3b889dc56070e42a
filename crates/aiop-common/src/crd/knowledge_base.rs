//! KnowledgeBase CRD types
//!
//! A `KnowledgeBase` describes a document corpus that is indexed into a
//! vector database by a pipeline run. The knowledge-base controller resolves
//! the database and pipeline credentials, submits a run to the pipeline
//! service and tracks it until it finishes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, Phase, SecretKeyRef};
use super::ManagedStatus;
use crate::Error;

/// Default database port
pub const DEFAULT_DATABASE_PORT: u16 = 5432;

/// Default version label for uploaded pipeline packages
pub const DEFAULT_PIPELINE_VERSION: &str = "1.0.0";

/// Default embedding batch size passed to the pipeline
pub const DEFAULT_EMBED_BATCH_SIZE: u32 = 10;

/// Finalizer blocking removal until in-flight pipeline runs are terminated
pub const KNOWLEDGE_BASE_FINALIZER: &str = "akamai.io/knowledge-base-cleanup";

fn default_database_port() -> u16 {
    DEFAULT_DATABASE_PORT
}

/// Authentication used when downloading a pipeline package
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineAuthType {
    /// Anonymous download
    #[default]
    None,
    /// HTTP basic auth, secret value is `user:password`
    Basic,
    /// Bearer token
    Bearer,
}

impl std::fmt::Display for PipelineAuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Basic => write!(f, "basic"),
            Self::Bearer => write!(f, "bearer"),
        }
    }
}

/// Reference to the pipeline that indexes the knowledge base
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSource {
    /// Pipeline display name in the pipeline service
    pub name: String,

    /// Download URL of a pipeline package (zip or yaml)
    ///
    /// When set the package is fetched and uploaded as a new pipeline
    /// version before the run is submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Version label for uploaded packages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Authentication for the package download
    #[serde(default)]
    pub auth_type: PipelineAuthType,

    /// Secret holding the download credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret_ref: Option<SecretKeyRef>,
}

impl PipelineSource {
    /// Version label, with default fallback
    pub fn version_label(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_PIPELINE_VERSION)
    }
}

/// Target database connection
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Primary (read-write) host
    pub host: String,

    /// Read replica host, defaults to `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_host: Option<String>,

    /// Port
    #[serde(default = "default_database_port")]
    pub port: u16,

    /// Database name
    pub name: String,

    /// Secret holding `username` and `password`
    pub secret_ref: String,
}

/// Source documents to index
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    /// Location of the documents
    pub url: String,
}

/// Embedding model used by the indexing pipeline
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingSpec {
    /// Embedding model name
    pub model_name: String,

    /// OpenAI-compatible API base of the embedding model
    pub model_endpoint: String,

    /// Embedding vector dimension
    pub dimension: u32,

    /// Documents per embedding request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

/// Specification for a KnowledgeBase
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "akamai.io",
    version = "v1alpha1",
    kind = "KnowledgeBase",
    plural = "knowledgebases",
    shortname = "kb",
    namespaced,
    status = "KnowledgeBaseStatus",
    printcolumn = r#"{"name":"Pipeline","type":"string","jsonPath":".spec.pipeline.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Run","type":"string","jsonPath":".status.runState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseSpec {
    /// Indexing pipeline
    pub pipeline: PipelineSource,

    /// Vector database the pipeline writes to
    pub database: DatabaseSpec,

    /// Documents to index
    pub data: DataSource,

    /// Embedding model
    pub embedding: EmbeddingSpec,

    /// Extra pipeline parameters, passed through verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl KnowledgeBaseSpec {
    /// Validate fields the schema cannot express
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        if self.pipeline.name.trim().is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.pipeline.name",
                "pipeline name cannot be empty",
            ));
        }
        if self.pipeline.auth_type != PipelineAuthType::None
            && self.pipeline.auth_secret_ref.is_none()
        {
            return Err(Error::validation_for_field(
                resource,
                "spec.pipeline.authSecretRef",
                format!(
                    "authType '{}' requires authSecretRef",
                    self.pipeline.auth_type
                ),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(Error::validation_for_field(
                resource,
                "spec.embedding.dimension",
                "dimension must be greater than zero",
            ));
        }
        if self.embedding.batch_size == Some(0) {
            return Err(Error::validation_for_field(
                resource,
                "spec.embedding.batchSize",
                "batchSize must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Embedding batch size, with default fallback
    pub fn embed_batch_size(&self) -> u32 {
        self.embedding
            .batch_size
            .unwrap_or(DEFAULT_EMBED_BATCH_SIZE)
    }
}

/// Status of a KnowledgeBase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseStatus {
    /// Current phase
    #[serde(default)]
    pub phase: Phase,

    /// Generation last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Identifier of the pipeline run submitted for `specHash`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<String>,

    /// Last observed state of that run (e.g. RUNNING, SUCCEEDED)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_state: Option<String>,

    /// Hash of the spec the status describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,

    /// Consecutive failed attempts
    #[serde(default)]
    pub retry_count: u32,

    /// Polls of the current run
    #[serde(default)]
    pub poll_count: u32,

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

impl ManagedStatus for KnowledgeBaseStatus {
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

    fn reset_for_spec(&mut self, spec_hash: &str) {
        self.spec_hash = Some(spec_hash.to_string());
        self.retry_count = 0;
        self.poll_count = 0;
        self.last_run_id = None;
        self.run_state = None;
        self.message = None;
    }
}
