//! Common types for the AI operators: CRDs, errors, status reporting and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod outcome;
pub mod retry;
pub mod status;
pub mod telemetry;

pub use error::Error;
pub use outcome::{FailureKind, ReconciliationOutcome};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Standard Kubernetes label for the application name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard Kubernetes label for the component within the application
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard Kubernetes label for the managing tool
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on objects the operator creates
pub const LABEL_MANAGED_BY_OPERATOR: &str = "aiop-operator";
