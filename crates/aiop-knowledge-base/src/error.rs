//! Errors specific to pipeline package handling

use thiserror::Error;

use aiop_common::Error;

/// Failure while reading or downloading a pipeline source
#[derive(Debug, Error)]
pub enum SourceError {
    /// An entry of the pipelines ConfigMap could not be understood
    #[error("invalid pipeline source '{name}': {message}")]
    InvalidEntry {
        /// Entry key in the ConfigMap
        name: String,
        /// What is wrong with it
        message: String,
    },

    /// The package is larger than the download limit
    #[error("package at {url} exceeds the {limit} byte limit")]
    TooLarge {
        /// Download URL
        url: String,
        /// Limit in bytes
        limit: u64,
    },

    /// A zip package could not be unpacked
    #[error("invalid package archive '{file}': {message}")]
    InvalidArchive {
        /// Package file name
        file: String,
        /// Reader error
        message: String,
    },

    /// Cluster, HTTP or pipeline service failure
    #[error(transparent)]
    Common(#[from] Error),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Common(e.into())
    }
}

impl From<SourceError> for Error {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Common(inner) => inner,
            SourceError::InvalidEntry { name, message } => {
                Error::validation_for_field(name, "pipelines", message)
            }
            SourceError::InvalidArchive { file, message } => Error::validation_for_field(
                "pipeline-source",
                "spec.pipeline.url",
                format!("invalid package archive '{file}': {message}"),
            ),
            SourceError::TooLarge { url, limit } => Error::validation_for_field(
                "pipeline-source",
                "spec.pipeline.url",
                format!("package at {url} exceeds the {limit} byte limit"),
            ),
        }
    }
}
