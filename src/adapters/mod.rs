//! Adapters for configuration transformation and Kubernetes resource building

pub mod deployment_builder;
pub mod dex_config;
pub mod ingress_builder;
pub mod rbac_builder;
pub mod secrets;
pub mod service_builder;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::DexServer;

/// Service account (and cluster role) used by Dex pods
pub const SERVICE_ACCOUNT_NAME: &str = "dex-operator-dexsso";
/// Name of the gRPC API service
pub const GRPC_SERVICE_NAME: &str = "grpc";
/// Suffix of the web TLS secret provisioned by the serving-cert annotation
pub const SECRET_WEB_TLS_SUFFIX: &str = "-tls-secret";
/// Key of the Dex configuration inside the config map
pub const CONFIG_FILE_KEY: &str = "config.yaml";
/// HTTPS port of the Dex web listener
pub const HTTPS_PORT: i32 = 5556;
/// Port of the Dex gRPC API
pub const GRPC_PORT: i32 = 5557;

/// Name of the config map holding `config.yaml`
pub fn config_map_name(dex_server: &DexServer) -> String {
    dex_server.name_any()
}

/// Name of the web TLS secret
pub fn web_tls_secret_name(dex_server: &DexServer) -> String {
    format!("{}{}", dex_server.name_any(), SECRET_WEB_TLS_SUFFIX)
}

/// Name of the per-namespace cluster role binding
pub fn cluster_role_binding_name(namespace: &str) -> String {
    format!("{}-{}", SERVICE_ACCOUNT_NAME, namespace)
}

/// Labels applied to every resource derived from a DexServer
pub fn build_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.to_string());
    labels.insert("app.kubernetes.io/name".to_string(), "dex".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), name.to_string());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "dex-operator".to_string(),
    );
    labels
}

/// Controller owner reference pointing back at the DexServer
pub fn build_owner_reference(dex_server: &DexServer) -> OwnerReference {
    OwnerReference {
        api_version: DexServer::api_version(&()).to_string(),
        kind: DexServer::kind(&()).to_string(),
        name: dex_server.name_any(),
        uid: dex_server.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::dex_server;
    use super::*;

    #[test]
    fn owner_reference_points_at_dex_server() {
        let owner = build_owner_reference(&dex_server("dex", "idp"));
        assert_eq!(owner.api_version, "auth.identitatem.io/v1alpha1");
        assert_eq!(owner.kind, "DexServer");
        assert_eq!(owner.name, "dex");
        assert_eq!(owner.uid, "dex-uid");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn derived_names() {
        let dex = dex_server("dex", "idp");
        assert_eq!(config_map_name(&dex), "dex");
        assert_eq!(web_tls_secret_name(&dex), "dex-tls-secret");
        assert_eq!(cluster_role_binding_name("idp"), "dex-operator-dexsso-idp");
    }
}
