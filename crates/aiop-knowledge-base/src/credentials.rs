//! Credential resolution for knowledge bases
//!
//! The database secret is only checked here; the pipeline reads it itself
//! by name. Pipeline-source credentials are decoded into a [`PipelineAuth`]
//! that is attached to the package download.

use k8s_openapi::api::core::v1::Secret;
use reqwest::RequestBuilder;

use aiop_common::crd::{PipelineAuthType, SecretKeyRef};
use aiop_common::kube_utils::secret_strings;
use aiop_common::Error;

/// Keys the database secret must carry
pub const DATABASE_SECRET_KEYS: [&str; 2] = ["username", "password"];

/// Authentication for a pipeline package download
#[derive(Clone, PartialEq, Eq)]
pub enum PipelineAuth {
    /// Anonymous download
    None,
    /// HTTP basic authentication
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
    /// `Authorization: Bearer` token
    Bearer {
        /// Token value
        token: String,
    },
}

// Credentials stay out of logs
impl std::fmt::Debug for PipelineAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            Self::Bearer { .. } => write!(f, "Bearer(***)"),
        }
    }
}

impl PipelineAuth {
    /// Attach the credentials to a request
    pub fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Self::None => builder,
            Self::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Self::Bearer { token } => builder.bearer_auth(token),
        }
    }
}

/// Check that the database secret exists and has the expected keys
///
/// A missing secret is NotYetReady (it may be created after the
/// KnowledgeBase); missing keys are a configuration error.
pub fn check_database_secret(
    secret: Option<&Secret>,
    secret_name: &str,
    namespace: &str,
    resource: &str,
) -> Result<(), Error> {
    let secret = secret.ok_or_else(|| Error::not_found("Secret", namespace, secret_name))?;
    let data = secret_strings(secret);
    let missing: Vec<&str> = DATABASE_SECRET_KEYS
        .iter()
        .copied()
        .filter(|key| data.get(*key).map_or(true, |v| v.is_empty()))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::validation_for_field(
        resource,
        "spec.database.secretRef",
        format!(
            "secret '{secret_name}' is missing key(s): {}",
            missing.join(", ")
        ),
    ))
}

/// The secret reference required by `auth_type`, if any
///
/// Authenticated downloads without a reference are a configuration error.
pub fn required_secret_ref<'a>(
    auth_type: PipelineAuthType,
    secret_ref: Option<&'a SecretKeyRef>,
    resource: &str,
    field: &str,
) -> Result<Option<&'a SecretKeyRef>, Error> {
    match (auth_type, secret_ref) {
        (PipelineAuthType::None, _) => Ok(None),
        (_, Some(secret_ref)) => Ok(Some(secret_ref)),
        (auth_type, None) => Err(Error::validation_for_field(
            resource,
            field,
            format!("authType '{auth_type}' requires a secret reference"),
        )),
    }
}

/// Decode pipeline-source credentials from a fetched secret
///
/// Basic credentials are stored as `user:password` under the referenced key;
/// bearer credentials are the raw token.
pub fn pipeline_auth(
    auth_type: PipelineAuthType,
    secret_ref: &SecretKeyRef,
    secret: Option<&Secret>,
    namespace: &str,
    resource: &str,
) -> Result<PipelineAuth, Error> {
    if auth_type == PipelineAuthType::None {
        return Ok(PipelineAuth::None);
    }
    let secret = secret.ok_or_else(|| Error::not_found("Secret", namespace, &secret_ref.name))?;
    let value = secret_strings(secret)
        .remove(&secret_ref.key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::validation_for_field(
                resource,
                "spec.pipeline.authSecretRef.key",
                format!(
                    "secret '{}' has no key '{}'",
                    secret_ref.name, secret_ref.key
                ),
            )
        })?;

    match auth_type {
        PipelineAuthType::Bearer => Ok(PipelineAuth::Bearer {
            token: value.trim().to_string(),
        }),
        PipelineAuthType::Basic => {
            let (username, password) = value.trim().split_once(':').ok_or_else(|| {
                Error::validation_for_field(
                    resource,
                    "spec.pipeline.authSecretRef.key",
                    format!(
                        "basic credentials in secret '{}' must be 'user:password'",
                        secret_ref.name
                    ),
                )
            })?;
            Ok(PipelineAuth::Basic {
                username: username.to_string(),
                password: password.to_string(),
            })
        }
        PipelineAuthType::None => Ok(PipelineAuth::None),
    }
}
