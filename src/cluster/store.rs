//! kube-rs backed [`ResourceStore`]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use super::ResourceStore;
use crate::crd::DexServer;
use crate::{Error, Result};

/// Resource store talking to the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new store
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secrets(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(format!("secret {}/{}", namespace, name), e))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret.namespace().unwrap_or_default();
        debug!("Creating secret {}/{}", namespace, secret.name_any());
        self.secrets(&namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| {
                Error::from_kube(format!("create secret {}/{}", namespace, secret.name_any()), e)
            })
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        debug!("Updating secret {}/{}", namespace, name);
        self.secrets(&namespace)
            .replace(&name, &PostParams::default(), secret)
            .await
            .map_err(|e| Error::from_kube(format!("update secret {}/{}", namespace, name), e))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        config_maps
            .get(name)
            .await
            .map_err(|e| Error::from_kube(format!("configmap {}/{}", namespace, name), e))
    }

    async fn update_status(&self, dex_server: &DexServer) -> Result<()> {
        let namespace = dex_server.namespace().unwrap_or_default();
        let name = dex_server.name_any();
        let dex_servers: Api<DexServer> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "status": dex_server.status
        });

        dex_servers
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(format!("update status of {}/{}", namespace, name), e))?;
        Ok(())
    }
}
