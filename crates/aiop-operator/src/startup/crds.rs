//! CRD installation utilities
//!
//! The operator installs its own CRDs on startup using server-side apply, so
//! the schema in the cluster always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use aiop_common::crd::{Agent, KnowledgeBase};
use aiop_common::kube_utils::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn operator_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: KnowledgeBase::crd_name(),
            crd: KnowledgeBase::crd(),
        },
        CrdDef {
            name: Agent::crd_name(),
            crd: Agent::crd(),
        },
    ]
}

/// All operator CRDs as one multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let mut out = String::new();
    for def in operator_crds() {
        let yaml = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))?;
        out.push_str("---\n");
        out.push_str(&yaml);
    }
    Ok(out)
}

/// Ensure the KnowledgeBase and Agent CRDs are installed
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in operator_crds() {
        tracing::info!("Installing {} CRD...", def.name);
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("Operator CRDs installed/updated");
    Ok(())
}
