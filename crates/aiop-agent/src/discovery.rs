//! Foundation model discovery
//!
//! Model servers advertise themselves with a `modelType` label and a
//! `modelName=<model>` label on their Service. An Agent's foundation model
//! must resolve to exactly one such Service.

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use crate::error::AgentError;

/// Label present on every model Service
pub const MODEL_TYPE_LABEL: &str = "modelType";

/// Label carrying the served model name
pub const MODEL_NAME_LABEL: &str = "modelName";

/// Label selector matching Services that serve `model`
pub fn model_selector(model: &str) -> String {
    format!("{MODEL_TYPE_LABEL},{MODEL_NAME_LABEL}={model}")
}

/// A Service serving a foundation model
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelService {
    /// Service name
    pub name: String,
    /// Service namespace
    pub namespace: String,
}

impl ModelService {
    /// In-cluster DNS name of the Service
    pub fn endpoint(&self) -> String {
        format!("{}.{}.svc.cluster.local", self.name, self.namespace)
    }
}

/// Pick the one Service serving `model` out of a selector listing
///
/// `namespace` is the scope the listing was made in (for error messages).
pub fn select_model_service(
    model: &str,
    namespace: Option<&str>,
    services: &[Service],
) -> Result<ModelService, AgentError> {
    let mut matches: Vec<ModelService> = services
        .iter()
        .map(|svc| ModelService {
            name: svc.name_any(),
            namespace: svc.namespace().unwrap_or_default(),
        })
        .collect();

    match matches.len() {
        0 => Err(AgentError::ModelNotFound {
            model: model.to_string(),
            namespace: namespace.map(str::to_string),
        }),
        1 => Ok(matches.remove(0)),
        _ => {
            let mut candidates: Vec<String> = matches
                .iter()
                .map(|m| format!("{}/{}", m.namespace, m.name))
                .collect();
            candidates.sort();
            Err(AgentError::AmbiguousModel {
                model: model.to_string(),
                candidates,
            })
        }
    }
}
