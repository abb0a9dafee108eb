//! Cluster collaborators used by the reconcilers
//!
//! The reconcilers never talk to the API server directly. Reads and
//! version-checked writes go through [`ResourceStore`]; rendered manifests go
//! through [`ManifestApplier`], which performs create-or-update. Both are
//! traits so tests can substitute an in-memory cluster.

mod applier;
mod store;

pub use applier::KubeApplier;
pub use store::KubeStore;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::DynamicObject;

use crate::crd::DexServer;
use crate::Result;

/// Get/create/update primitives against the cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a secret; `Error::NotFound` when absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Create a secret
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;

    /// Replace a secret; fails with `Error::Conflict` on a stale resource version
    async fn update_secret(&self, secret: &Secret) -> Result<Secret>;

    /// Fetch a config map; `Error::NotFound` when absent
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    /// Persist the status sub-object of a DexServer
    async fn update_status(&self, dex_server: &DexServer) -> Result<()>;
}

/// Result of a create-or-update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// A rendered resource accepted by [`ManifestApplier::apply_direct`]
#[derive(Clone, Debug)]
pub enum Manifest {
    ConfigMap(ConfigMap),
    Service(Service),
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
}

impl Manifest {
    /// Kind of the wrapped resource
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::ConfigMap(_) => "ConfigMap",
            Manifest::Service(_) => "Service",
            Manifest::ServiceAccount(_) => "ServiceAccount",
            Manifest::ClusterRole(_) => "ClusterRole",
            Manifest::ClusterRoleBinding(_) => "ClusterRoleBinding",
        }
    }
}

/// Create-or-update of rendered manifests
///
/// Owner references are part of the rendered manifest; the applier writes
/// them as given.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Apply a core or RBAC resource
    async fn apply_direct(&self, manifest: &Manifest) -> Result<ApplyOutcome>;

    /// Apply a deployment
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<ApplyOutcome>;

    /// Apply a resource addressed only by its apiVersion/kind
    async fn apply_custom_resource(&self, resource: &DynamicObject) -> Result<ApplyOutcome>;
}
