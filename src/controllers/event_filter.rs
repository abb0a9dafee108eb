//! Event filters deciding which watch events trigger reconciliation
//!
//! Watch streams only carry the current object, so each filtered stream keeps
//! the last object it saw per uid and classifies every new sighting against
//! it. The predicates below then decide on create/update/delete the way the
//! controller needs: DexServer status writes, deployment rolling restarts and
//! unrelated secret churn must not re-trigger a pass.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures::{future, Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tracing::debug;

use crate::adapters::secrets::IDP_CREDENTIAL_LABEL;
use crate::crd::DexServer;
use crate::metrics::FILTERED_EVENTS;

/// Pod template annotation stamped by `kubectl rollout restart`
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// How a watch event relates to what the stream saw before
#[derive(Clone, Debug, PartialEq)]
pub enum Sighting<K> {
    /// First time this object is seen
    Created,
    /// Same resource version as last time (relist)
    Unchanged,
    /// Changed; carries the previous object
    Updated(K),
    /// Removed from the cluster
    Deleted,
}

/// Last seen version of every object on one watch stream
#[derive(Debug)]
pub struct SeenObjects<K> {
    objects: HashMap<String, K>,
}

impl<K> Default for SeenObjects<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().uid {
        Some(ref uid) => uid.clone(),
        None => format!(
            "{}/{}",
            obj.meta().namespace.as_deref().unwrap_or_default(),
            obj.meta().name.as_deref().unwrap_or_default()
        ),
    }
}

impl<K: Resource + Clone> SeenObjects<K> {
    /// Record `obj` and classify it against the previous sighting
    pub fn observe(&mut self, obj: &K) -> Sighting<K> {
        match self.objects.insert(object_key(obj), obj.clone()) {
            None => Sighting::Created,
            Some(old) if old.meta().resource_version == obj.meta().resource_version => {
                Sighting::Unchanged
            }
            Some(old) => Sighting::Updated(old),
        }
    }

    /// Drop `obj` and report the deletion
    pub fn forget(&mut self, obj: &K) -> Sighting<K> {
        self.objects.remove(&object_key(obj));
        Sighting::Deleted
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Turn a watcher event stream into a stream of admitted objects
///
/// `admit` sees every classified sighting; rejected ones are counted under
/// `source` and dropped. Watch errors pass through untouched.
pub fn filtered<K, S, F>(
    events: S,
    source: &'static str,
    mut admit: F,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send
where
    K: Resource + Clone + Send + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    F: FnMut(&Sighting<K>, &K) -> bool + Send + 'static,
{
    let mut seen = SeenObjects::default();
    events.filter_map(move |event| {
        let (sighting, obj) = match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                (seen.observe(&obj), obj)
            }
            Ok(watcher::Event::Delete(obj)) => (seen.forget(&obj), obj),
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {
                return future::ready(None)
            }
            Err(e) => return future::ready(Some(Err(e))),
        };

        if admit(&sighting, &obj) {
            future::ready(Some(Ok(obj)))
        } else {
            FILTERED_EVENTS.with_label_values(&[source]).inc();
            future::ready(None)
        }
    })
}

/// DexServer predicate: creates always, updates only on spec or finalizer changes
pub fn admit_dex_server(sighting: &Sighting<DexServer>, new: &DexServer) -> bool {
    match sighting {
        Sighting::Created => true,
        Sighting::Updated(old) => {
            let changed = old.finalizers() != new.finalizers() || old.spec != new.spec;
            if !changed {
                debug!(
                    "Ignoring DexServer {} update without spec change",
                    new.name_any()
                );
            }
            changed
        }
        Sighting::Unchanged | Sighting::Deleted => false,
    }
}

/// Credential secret predicate: updates of labelled secrets only
pub fn admit_credential_secret(sighting: &Sighting<Secret>, new: &Secret) -> bool {
    matches!(sighting, Sighting::Updated(_)) && new.labels().contains_key(IDP_CREDENTIAL_LABEL)
}

/// Tracks rolling restarts of Dex deployments so their churn is ignored
///
/// A restart is detected when the pod template's restart timestamp changes;
/// the deployment generation at that point is remembered and every update at
/// that generation is suppressed. The first update at another generation
/// ends the restart and is admitted.
#[derive(Debug, Default)]
pub struct RestartTracker {
    in_progress: Mutex<HashMap<String, i64>>,
}

fn restart_key(namespace: &str, name: &str) -> String {
    format!("{}:{}", namespace, name)
}

fn restarted_at(deployment: &Deployment) -> Option<&String> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(RESTARTED_AT_ANNOTATION)
}

fn has_template_annotations(deployment: &Deployment) -> bool {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .is_some_and(|a| !a.is_empty())
}

impl RestartTracker {
    /// Generation at which a restart of `namespace/name` is in progress
    pub fn in_progress(&self, namespace: &str, name: &str) -> Option<i64> {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&restart_key(namespace, name))
            .copied()
    }

    /// Decide whether an update of a deployment should trigger reconciliation
    pub fn admit_update(&self, old: &Deployment, new: &Deployment) -> bool {
        if !owned_by_dex_server(old) {
            return false;
        }

        let namespace = new.namespace().unwrap_or_default();
        let name = new.name_any();
        let key = restart_key(&namespace, &name);
        let generation = new.metadata.generation.unwrap_or_default();

        let mut in_progress = self
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(&restart_generation) = in_progress.get(&key) {
            if restart_generation == generation {
                debug!(
                    "Ignoring update of deployment {}/{} during restart at generation {}",
                    namespace, name, generation
                );
                return false;
            }
            debug!(
                "Restart of deployment {}/{} finished, now at generation {}",
                namespace, name, generation
            );
            in_progress.remove(&key);
        }

        if let Some(new_restart) = restarted_at(new) {
            if !has_template_annotations(old) || restarted_at(old) != Some(new_restart) {
                debug!(
                    "New restart of deployment {}/{} at generation {}",
                    namespace, name, generation
                );
                in_progress.insert(key, generation);
                return false;
            }
        }

        true
    }

    /// Forget any restart recorded for a deleted deployment
    pub fn forget(&self, deployment: &Deployment) {
        let key = restart_key(&deployment.namespace().unwrap_or_default(), &deployment.name_any());
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    /// Owned deployment predicate
    pub fn admit(&self, sighting: &Sighting<Deployment>, new: &Deployment) -> bool {
        match sighting {
            Sighting::Created => true,
            Sighting::Deleted => {
                self.forget(new);
                true
            }
            Sighting::Unchanged => false,
            Sighting::Updated(old) => self.admit_update(old, new),
        }
    }
}

/// True when the first owner reference of `obj` is a DexServer
pub fn owned_by_dex_server<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .owner_references
        .as_ref()
        .and_then(|owners| owners.first())
        .is_some_and(|owner| owner.kind == DexServer::kind(&()))
}

/// Drop watch events for objects no DexServer owns
///
/// Keeps the seen-object cache of a filtered stream limited to Dex resources.
pub fn only_dex_server_owned<K, S>(
    events: S,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send
where
    K: Resource + Send + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    events.filter(|event| {
        future::ready(match event {
            Ok(watcher::Event::Apply(obj))
            | Ok(watcher::Event::InitApply(obj))
            | Ok(watcher::Event::Delete(obj)) => owned_by_dex_server(obj),
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) | Err(_) => true,
        })
    })
}
