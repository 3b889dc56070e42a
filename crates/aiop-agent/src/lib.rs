//! Agent lifecycle management
//!
//! This crate provides the Kubernetes controller for Agent CRDs: it resolves
//! the foundation model Service and knowledge-base tools an Agent names,
//! renders the agent configuration and deploys it through a
//! [`DeploymentProvider`].

#![deny(missing_docs)]

pub mod config;
mod controller;
pub mod discovery;
pub mod error;
pub mod provider;

pub use config::AgentConfig;
pub use controller::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};
pub use error::AgentError;
pub use provider::{DeploymentProvider, Providers};
