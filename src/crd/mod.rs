//! Custom Resource Definitions for the Dex Operator

mod dex_server;

pub use dex_server::*;

use kube::CustomResourceExt;

use crate::Result;

/// Generate CRD YAML manifests for all custom resources
pub fn generate_crds() -> Result<Vec<String>> {
    Ok(vec![serde_yaml::to_string(&DexServer::crd())?])
}
