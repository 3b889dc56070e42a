//! Errors specific to agent resolution

use thiserror::Error;

use aiop_common::Error;

/// Failure while resolving what an Agent depends on
#[derive(Debug, Error)]
pub enum AgentError {
    /// No Service serves the requested model
    #[error("foundation model '{model}' not found: no Service labelled modelType,modelName={model}{}", scope_suffix(.namespace))]
    ModelNotFound {
        /// Requested model name
        model: String,
        /// Namespace searched, all namespaces when `None`
        namespace: Option<String>,
    },

    /// More than one Service serves the requested model
    #[error("foundation model '{model}' is served by {} Services ({}); set spec.modelNamespace", .candidates.len(), .candidates.join(", "))]
    AmbiguousModel {
        /// Requested model name
        model: String,
        /// `namespace/name` of every match
        candidates: Vec<String>,
    },

    /// A knowledge-base tool names a KnowledgeBase that does not exist
    #[error("knowledge base '{name}' not found in namespace '{namespace}'")]
    KnowledgeBaseNotFound {
        /// KnowledgeBase name
        name: String,
        /// Agent namespace
        namespace: String,
    },

    /// Cluster or serialization failure
    #[error(transparent)]
    Common(#[from] Error),
}

fn scope_suffix(namespace: &Option<String>) -> String {
    namespace
        .as_ref()
        .map(|ns| format!(" in namespace '{ns}'"))
        .unwrap_or_default()
}

impl AgentError {
    /// Machine-readable reason for the Ready condition
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ModelNotFound { .. } => "ModelNotFound",
            Self::AmbiguousModel { .. } => "AmbiguousModel",
            Self::KnowledgeBaseNotFound { .. } => "KnowledgeBaseNotFound",
            Self::Common(_) => "ResolutionFailed",
        }
    }
}

impl From<AgentError> for Error {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Common(inner) => inner,
            AgentError::ModelNotFound { ref model, ref namespace } => Error::not_found(
                "Service",
                namespace.clone().unwrap_or_else(|| "*".to_string()),
                format!("modelName={model}"),
            ),
            AgentError::AmbiguousModel { ref model, .. } => {
                Error::validation_for_field(model.clone(), "spec.modelNamespace", e.to_string())
            }
            AgentError::KnowledgeBaseNotFound { name, namespace } => {
                Error::not_found("KnowledgeBase", namespace, name)
            }
        }
    }
}
