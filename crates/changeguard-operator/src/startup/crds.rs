//! CRD installation utilities
//!
//! The operator installs its own CRDs on startup using server-side apply, so
//! the stored schema always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use changeguard_common::crd::{ChangeDefense, ChangeDefenseExecution};
use changeguard_common::FIELD_MANAGER;

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![ChangeDefense::crd(), ChangeDefenseExecution::crd()]
}

/// Both CRDs as a multi-document YAML stream
pub fn crd_yaml() -> anyhow::Result<String> {
    let docs = all_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}

/// Install or update both CRDs
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }
    tracing::info!("CRDs installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_contains_both_crds() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("name: changedefenses.changeguard.dev"));
        assert!(yaml.contains("name: changedefenseexecutions.changeguard.dev"));
        assert_eq!(yaml.matches("---\n").count(), 1);
    }
}
