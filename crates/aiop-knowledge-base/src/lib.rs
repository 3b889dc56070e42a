//! KnowledgeBase controller
//!
//! Watches KnowledgeBase CRDs and drives their indexing lifecycle:
//! - Checks the database and pipeline-source credentials
//! - Uploads pipeline packages and submits one indexing run per spec
//! - Polls the run with backoff and reports the outcome in status
//!
//! A background [`PipelineSync`] keeps the pipeline service in step with
//! the operator's pipelines ConfigMap.

#![deny(missing_docs)]

mod controller;
pub mod credentials;
pub mod error;
pub mod package;
pub mod pipeline;
pub mod sync;

pub use controller::{
    error_policy, experiment_name, job_name, poll_delay, reconcile, run_parameters, Context,
    ContextBuilder, KubeClient, KubeClientImpl, POLL_BASE_DELAY_SECS, REASON_PIPELINE_FAILED,
};
pub use error::SourceError;
pub use pipeline::{KubeflowClient, PipelineClient, RunState};
pub use sync::{HttpPackageFetcher, KubeSourceStore, PackageFetcher, PipelineSync, SyncSettings};
