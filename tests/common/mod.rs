//! In-memory cluster shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use dex_operator::cluster::{ApplyOutcome, Manifest, ManifestApplier, ResourceStore};
use dex_operator::crd::{ConnectorSpec, DexServer, DexServerSpec, GitHubConnector, SecretRef};
use dex_operator::reconcilers::dexserver::PassContext;
use dex_operator::{Error, Result};

pub const NAMESPACE: &str = "idp";
pub const NAME: &str = "dex";
pub const DEX_IMAGE: &str = "quay.io/dexidp/dex:v2.41.1";
pub const GITHUB_SECRET_NAME: &str = "github-client-secret";

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    dex_servers: BTreeMap<(String, String), DexServer>,
    writes: Vec<String>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn record(&mut self, kind: &str, key: &Key) {
        self.writes.push(format!("{} {}/{}", kind, key.1, key.2));
    }
}

/// Cluster double implementing both collaborator traits
///
/// Objects are kept as JSON. An apply whose content matches what is stored
/// (ignoring the resource version) reports `Unchanged` and records no write.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key(kind: &str, meta: &ObjectMeta) -> Key {
    (
        kind.to_string(),
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn without_version(mut value: Value) -> Value {
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("resourceVersion");
    }
    value
}

fn with_version(mut value: Value, version: String) -> Value {
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert("resourceVersion".to_string(), Value::String(version));
    }
    value
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn put<K: Serialize>(&self, kind: &str, meta: &ObjectMeta, obj: &K) -> Result<ApplyOutcome> {
        let key = key(kind, meta);
        let value = without_version(serde_json::to_value(obj)?);
        let mut state = self.state.lock().unwrap();

        let outcome = match state.objects.get(&key) {
            Some(stored) if without_version(stored.clone()) == value => {
                return Ok(ApplyOutcome::Unchanged)
            }
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Created,
        };
        let version = state.next_version();
        state.objects.insert(key.clone(), with_version(value, version));
        state.record(kind, &key);
        Ok(outcome)
    }

    fn get<K: DeserializeOwned>(&self, kind: &str, namespace: &str, name: &str) -> Result<K> {
        let state = self.state.lock().unwrap();
        let value = state
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} {}/{}", kind, namespace, name)))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Seed a secret without recording a write
    pub fn insert_secret(&self, secret: Secret) {
        let key = key("Secret", &secret.metadata);
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let value = with_version(serde_json::to_value(&secret).unwrap(), version);
        state.objects.insert(key, value);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.get("Secret", namespace, name).ok()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.get("ConfigMap", namespace, name).ok()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.get("Deployment", namespace, name).ok()
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        self.get(kind, namespace, name).ok()
    }

    /// The DexServer as last written through its status
    pub fn dex_server(&self, namespace: &str, name: &str) -> Option<DexServer> {
        let state = self.state.lock().unwrap();
        state
            .dex_servers
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }
}

#[async_trait]
impl ResourceStore for FakeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.get("Secret", namespace, name)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let key = key("Secret", &secret.metadata);
        let mut state = self.state.lock().unwrap();
        if state.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("secret {}/{} already exists", key.1, key.2)));
        }
        let version = state.next_version();
        let value = with_version(without_version(serde_json::to_value(secret)?), version);
        state.objects.insert(key.clone(), value.clone());
        state.record("Secret", &key);
        Ok(serde_json::from_value(value)?)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret> {
        let key = key("Secret", &secret.metadata);
        let mut state = self.state.lock().unwrap();
        let stored_version = state
            .objects
            .get(&key)
            .and_then(|v| v["metadata"]["resourceVersion"].as_str().map(String::from))
            .ok_or_else(|| Error::NotFound(format!("secret {}/{}", key.1, key.2)))?;
        if secret.resource_version().is_some_and(|v| v != stored_version) {
            return Err(Error::Conflict(format!("secret {}/{} was modified", key.1, key.2)));
        }
        let version = state.next_version();
        let value = with_version(without_version(serde_json::to_value(secret)?), version);
        state.objects.insert(key.clone(), value.clone());
        state.record("Secret", &key);
        Ok(serde_json::from_value(value)?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.get("ConfigMap", namespace, name)
    }

    async fn update_status(&self, dex_server: &DexServer) -> Result<()> {
        let namespace = dex_server.namespace().unwrap_or_default();
        let name = dex_server.name_any();
        let mut state = self.state.lock().unwrap();
        let mut stored = dex_server.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state
            .writes
            .push(format!("DexServer/status {}/{}", namespace, name));
        state.dex_servers.insert((namespace, name), stored);
        Ok(())
    }
}

#[async_trait]
impl ManifestApplier for FakeCluster {
    async fn apply_direct(&self, manifest: &Manifest) -> Result<ApplyOutcome> {
        match manifest {
            Manifest::ConfigMap(r) => self.put(manifest.kind(), &r.metadata, r),
            Manifest::Service(r) => self.put(manifest.kind(), &r.metadata, r),
            Manifest::ServiceAccount(r) => self.put(manifest.kind(), &r.metadata, r),
            Manifest::ClusterRole(r) => self.put(manifest.kind(), &r.metadata, r),
            Manifest::ClusterRoleBinding(r) => self.put(manifest.kind(), &r.metadata, r),
        }
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<ApplyOutcome> {
        self.put("Deployment", &deployment.metadata, deployment)
    }

    async fn apply_custom_resource(&self, resource: &DynamicObject) -> Result<ApplyOutcome> {
        let kind = resource
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();
        self.put(&kind, &resource.metadata, resource)
    }
}

/// Store whose secret lookups take `delay` before answering
pub struct SlowStore<'a> {
    pub inner: &'a FakeCluster,
    pub delay: Duration,
}

#[async_trait]
impl ResourceStore for SlowStore<'_> {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_secret(namespace, name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.inner.create_secret(secret).await
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret> {
        self.inner.update_secret(secret).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.inner.get_config_map(namespace, name).await
    }

    async fn update_status(&self, dex_server: &DexServer) -> Result<()> {
        self.inner.update_status(dex_server).await
    }
}

/// Store serving secrets from an outdated cache
///
/// Every secret read carries a resource version the cluster has moved past,
/// so version-checked updates conflict. Update attempts are counted.
pub struct StaleStore<'a> {
    pub inner: &'a FakeCluster,
    pub secret_updates: AtomicUsize,
}

impl<'a> StaleStore<'a> {
    pub fn new(inner: &'a FakeCluster) -> Self {
        Self {
            inner,
            secret_updates: AtomicUsize::new(0),
        }
    }

    pub fn secret_updates(&self) -> usize {
        self.secret_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStore for StaleStore<'_> {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let mut secret = self.inner.get_secret(namespace, name).await?;
        secret.metadata.resource_version = Some("0".to_string());
        Ok(secret)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.inner.create_secret(secret).await
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret> {
        self.secret_updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_secret(secret).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.inner.get_config_map(namespace, name).await
    }

    async fn update_status(&self, dex_server: &DexServer) -> Result<()> {
        self.inner.update_status(dex_server).await
    }
}

/// A DexServer with a single GitHub connector
pub fn github_dex_server() -> DexServer {
    DexServer {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some("6f1c2a52-93c1-4a4e-8a57-0c1c7b9a3d10".to_string()),
            ..Default::default()
        },
        spec: DexServerSpec {
            issuer: "https://dex.apps.example.com/dex".to_string(),
            connectors: vec![ConnectorSpec {
                type_: "github".to_string(),
                id: "github".to_string(),
                name: "GitHub".to_string(),
                github: Some(GitHubConnector {
                    client_id: "3a4f5c".to_string(),
                    client_secret_ref: SecretRef {
                        name: GITHUB_SECRET_NAME.to_string(),
                        namespace: None,
                    },
                    redirect_uri: "https://dex.apps.example.com/dex/callback".to_string(),
                    org: Some("identitatem".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ingress_certificate_ref: None,
        },
        status: None,
    }
}

/// The GitHub OAuth client secret referenced by [`github_dex_server`]
pub fn github_secret(client_secret: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(
        "clientSecret".to_string(),
        ByteString(client_secret.as_bytes().to_vec()),
    );
    Secret {
        metadata: ObjectMeta {
            name: Some(GITHUB_SECRET_NAME.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

pub fn pass_context(cluster: &FakeCluster) -> PassContext<'_> {
    PassContext {
        store: cluster,
        applier: cluster,
        dex_image: DEX_IMAGE,
        renewal_window: chrono::Duration::hours(24),
    }
}

pub fn deadline() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(60)
}
