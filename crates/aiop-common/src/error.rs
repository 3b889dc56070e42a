//! Error types for the AI operators
//!
//! Errors are structured with fields to aid debugging in production. Every
//! variant maps onto a [`FailureKind`] so the reconcilers can decide between
//! retrying with backoff and surfacing a fatal condition.

use thiserror::Error;

use crate::outcome::FailureKind;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Transport-level HTTP error talking to an external service
    #[error("http error: {source}")]
    Http {
        /// The underlying reqwest error
        #[from]
        source: reqwest::Error,
    },

    /// An external service answered with a non-success status
    #[error("{service} returned {status}: {message}")]
    Api {
        /// Service that rejected the request (e.g. "kubeflow")
        service: String,
        /// HTTP status code
        status: u16,
        /// Response body or summary
        message: String,
    },

    /// A referenced object does not exist (yet)
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the missing object (e.g. "Secret")
        kind: String,
        /// Name of the missing object
        name: String,
        /// Namespace searched
        namespace: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.pipeline.authSecretRef")
        field: Option<String>,
    },

    /// Credentials were rejected by an external system
    #[error("unauthorized by {service}: {message}")]
    Unauthorized {
        /// Service that rejected the credentials
        service: String,
        /// Description of the rejection
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "status")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error for a namespaced object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Create an API error for a non-success response from an external service
    pub fn api(service: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        Self::Api {
            service: service.into(),
            status,
            message: msg.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify this error into the failure taxonomy used by the reconcilers
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => FailureKind::from_status(ae.code),
                _ => FailureKind::Transient,
            },
            Error::Http { source } => {
                if source.is_timeout() || source.is_connect() {
                    FailureKind::Transient
                } else if let Some(status) = source.status() {
                    FailureKind::from_status(status.as_u16())
                } else {
                    FailureKind::Transient
                }
            }
            Error::Api { status, .. } => FailureKind::from_status(*status),
            Error::NotFound { .. } => FailureKind::NotYetReady,
            Error::Validation { .. } => FailureKind::Configuration,
            Error::Unauthorized { .. } => FailureKind::Unauthorized,
            Error::Serialization { .. } => FailureKind::Configuration,
            Error::Internal { .. } => FailureKind::Transient,
        }
    }

    /// Check if this error is retryable
    ///
    /// Transient and not-yet-ready failures are retried; configuration and
    /// authorization failures require a spec edit or operator intervention.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// True when the API server rejected a write because of a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409
        )
    }

    /// True when the addressed object does not exist on the remote side
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Api { status, .. } => *status == 404,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Http { source } => source.status().is_some_and(|s| s.as_u16() == 404),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn kube_api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("status {code}"),
                reason: "Test".to_string(),
                code,
            }),
        }
    }

    // ==========================================================================
    // Story Tests: Failure classification drives retry behavior
    // ==========================================================================

    /// Story: a knowledge base points at a pipeline that was never uploaded
    ///
    /// The pipeline service answers 404 on lookup. The reconciler keeps
    /// waiting for it rather than marking the resource failed.
    #[test]
    fn story_missing_pipeline_is_not_yet_ready() {
        let err = Error::api("kubeflow", 404, "pipeline 'rag' not found");
        assert_eq!(err.kind(), FailureKind::NotYetReady);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("kubeflow returned 404"));
    }

    /// Story: pipeline credentials were revoked
    #[test]
    fn story_rejected_credentials_are_fatal() {
        let err = Error::api("kubeflow", 403, "forbidden");
        assert_eq!(err.kind(), FailureKind::Unauthorized);
        assert!(!err.is_retryable());

        let err = Error::unauthorized("pipeline-source", "bearer token rejected");
        assert_eq!(err.kind(), FailureKind::Unauthorized);
        assert!(err.to_string().contains("pipeline-source"));
    }

    /// Story: a spec references a database secret with the wrong keys
    #[test]
    fn story_validation_errors_name_the_field() {
        let err = Error::validation_for_field(
            "docs-kb",
            "spec.database.secretRef",
            "secret is missing key 'password'",
        );
        match &err {
            Error::Validation {
                resource, field, ..
            } => {
                assert_eq!(resource, "docs-kb");
                assert_eq!(field.as_deref(), Some("spec.database.secretRef"));
            }
            _ => panic!("Expected Validation variant"),
        }
        assert_eq!(err.kind(), FailureKind::Configuration);
    }

    #[test]
    fn not_found_is_not_yet_ready() {
        let err = Error::not_found("Secret", "team-a", "pg-credentials");
        assert_eq!(err.kind(), FailureKind::NotYetReady);
        assert_eq!(err.to_string(), "Secret team-a/pg-credentials not found");
    }

    #[rstest]
    #[case::bad_request(400, FailureKind::Configuration)]
    #[case::unauthorized(401, FailureKind::Unauthorized)]
    #[case::forbidden(403, FailureKind::Unauthorized)]
    #[case::not_found(404, FailureKind::NotYetReady)]
    #[case::conflict(409, FailureKind::Transient)]
    #[case::unprocessable(422, FailureKind::Configuration)]
    #[case::throttled(429, FailureKind::Transient)]
    #[case::server_error(500, FailureKind::Transient)]
    #[case::unavailable(503, FailureKind::Transient)]
    fn kube_api_errors_are_classified_by_status(
        #[case] code: u16,
        #[case] expected: FailureKind,
    ) {
        assert_eq!(kube_api_error(code).kind(), expected);
    }

    #[test]
    fn conflict_is_detected() {
        assert!(kube_api_error(409).is_conflict());
        assert!(!kube_api_error(404).is_conflict());
        assert!(!Error::internal("boom").is_conflict());
    }

    #[test]
    fn internal_errors_are_retryable_and_keep_context() {
        let err = Error::internal_with_context("status", "resourceVersion missing");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[status]"));

        let err = Error::internal("unexpected");
        assert!(err.to_string().contains(UNKNOWN_CONTEXT));
    }

    #[rstest]
    #[case::kube_404(kube_api_error(404), true)]
    #[case::service_404(Error::api("kubeflow", 404, "run not found"), true)]
    #[case::missing_object(Error::not_found("Secret", "team-a", "pg"), true)]
    #[case::kube_409(kube_api_error(409), false)]
    #[case::service_503(Error::api("kubeflow", 503, "unavailable"), false)]
    #[case::internal(Error::internal("boom"), false)]
    fn not_found_is_detected(#[case] err: Error, #[case] expected: bool) {
        assert_eq!(err.is_not_found(), expected);
    }

    #[test]
    fn serialization_errors_are_not_retryable() {
        let err = Error::serialization_for_kind("Application", "invalid helm values");
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("Application")),
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn json_errors_convert_to_serialization() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
