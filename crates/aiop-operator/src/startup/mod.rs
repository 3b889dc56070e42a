//! Startup utilities for the operator
//!
//! This module contains initialization logic that runs before the
//! controllers start.

mod crds;

pub use crds::{crd_manifests, ensure_crds_installed};
