//! Operator runtime: CRD installation and controller wiring for the
//! KnowledgeBase and Agent controllers

#![deny(missing_docs)]

/// Controller construction per kind and namespace
pub mod controller_runner;
/// Startup utilities (CRD install)
pub mod startup;
