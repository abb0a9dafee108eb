//! Server-side-apply backed [`ManifestApplier`]

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{ApplyOutcome, Manifest, ManifestApplier};
use crate::{Error, Result};

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "dex-operator";

/// Applier issuing server-side apply patches
#[derive(Clone)]
pub struct KubeApplier {
    client: Client,
}

impl KubeApplier {
    /// Create a new applier
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default())
    }
}

/// Apply `obj` and report whether the stored object changed
///
/// An apply that changes nothing leaves the resource version untouched.
async fn server_side_apply<K>(api: Api<K>, obj: &K) -> Result<ApplyOutcome>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::ValidationError(format!("{} manifest has no name", kind)))?;

    let before = api
        .get_opt(&name)
        .await
        .map_err(|e| Error::from_kube(format!("get {} {}", kind, name), e))?
        .and_then(|existing| existing.resource_version());

    let params = PatchParams::apply(FIELD_MANAGER).force();
    let after = api
        .patch(&name, &params, &Patch::Apply(obj))
        .await
        .map_err(|e| Error::from_kube(format!("apply {} {}", kind, name), e))?;

    let outcome = compare_versions(before, after.resource_version());
    debug!("Applied {} {}: {:?}", kind, name, outcome);
    Ok(outcome)
}

fn compare_versions(before: Option<String>, after: Option<String>) -> ApplyOutcome {
    match before {
        None => ApplyOutcome::Created,
        Some(version) if Some(&version) == after.as_ref() => ApplyOutcome::Unchanged,
        Some(_) => ApplyOutcome::Updated,
    }
}

#[async_trait]
impl ManifestApplier for KubeApplier {
    async fn apply_direct(&self, manifest: &Manifest) -> Result<ApplyOutcome> {
        match manifest {
            Manifest::ConfigMap(config_map) => {
                server_side_apply(self.api_for(config_map), config_map).await
            }
            Manifest::Service(service) => server_side_apply(self.api_for(service), service).await,
            Manifest::ServiceAccount(account) => {
                server_side_apply(self.api_for(account), account).await
            }
            Manifest::ClusterRole(role) => {
                server_side_apply(Api::all(self.client.clone()), role).await
            }
            Manifest::ClusterRoleBinding(binding) => {
                server_side_apply(Api::all(self.client.clone()), binding).await
            }
        }
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<ApplyOutcome> {
        server_side_apply(self.api_for(deployment), deployment).await
    }

    async fn apply_custom_resource(&self, resource: &DynamicObject) -> Result<ApplyOutcome> {
        let types = resource.types.as_ref().ok_or_else(|| {
            Error::ValidationError(format!(
                "resource {} has no apiVersion/kind",
                resource.name_any()
            ))
        })?;
        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", types.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &types.kind);
        let api_resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = match resource.namespace() {
            Some(namespace) => Api::namespaced_with(self.client.clone(), &namespace, &api_resource),
            None => Api::all_with(self.client.clone(), &api_resource),
        };

        let name = resource.name_any();
        let before = api
            .get_opt(&name)
            .await
            .map_err(|e| Error::from_kube(format!("get {} {}", types.kind, name), e))?
            .and_then(|existing| existing.resource_version());

        let params = PatchParams::apply(FIELD_MANAGER).force();
        let after = api
            .patch(&name, &params, &Patch::Apply(resource))
            .await
            .map_err(|e| Error::from_kube(format!("apply {} {}", types.kind, name), e))?;

        let outcome = compare_versions(before, after.resource_version());
        debug!("Applied {} {}: {:?}", types.kind, name, outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_follows_resource_version() {
        assert_eq!(compare_versions(None, Some("1".into())), ApplyOutcome::Created);
        assert_eq!(
            compare_versions(Some("7".into()), Some("7".into())),
            ApplyOutcome::Unchanged
        );
        assert_eq!(
            compare_versions(Some("7".into()), Some("8".into())),
            ApplyOutcome::Updated
        );
    }
}
