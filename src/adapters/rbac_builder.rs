//! Service account and RBAC builders

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::adapters::{
    build_labels, build_owner_reference, cluster_role_binding_name, SERVICE_ACCOUNT_NAME,
};
use crate::crd::DexServer;

/// Build the service account Dex pods run as
pub fn build_service_account(dex_server: &DexServer) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            namespace: dex_server.namespace(),
            labels: Some(build_labels(&dex_server.name_any())),
            owner_references: Some(vec![build_owner_reference(dex_server)]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Build the binding of the process-wide cluster role to the namespace's service account
pub fn build_cluster_role_binding(dex_server: &DexServer) -> ClusterRoleBinding {
    let namespace = dex_server.namespace().unwrap_or_default();

    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(cluster_role_binding_name(&namespace)),
            labels: Some(build_labels(&dex_server.name_any())),
            owner_references: Some(vec![build_owner_reference(dex_server)]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
            namespace: Some(namespace),
            ..Default::default()
        }]),
    }
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| Some(items.iter().map(|s| s.to_string()).collect());
    PolicyRule {
        api_groups: owned(api_groups),
        resources: owned(resources),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Build the cluster role Dex needs for its kubernetes storage backend
///
/// Installed once at startup and shared by every DexServer, so it carries no owner.
pub fn build_cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_string(),
                    "dex-operator".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        rules: Some(vec![
            rule(&["dex.coreos.com"], &["*"], &["*"]),
            rule(
                &["apiextensions.k8s.io"],
                &["customresourcedefinitions"],
                &["create", "get", "list"],
            ),
        ]),
        ..Default::default()
    }
}
