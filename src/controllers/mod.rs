//! Controller implementations for watching and reconciling resources

pub mod dexserver_controller;
pub mod event_filter;

use kube::Client;
use std::sync::Arc;

use crate::cluster::{KubeApplier, KubeStore, ManifestApplier, ResourceStore};
use crate::config::OperatorConfig;
use crate::controllers::event_filter::RestartTracker;
use crate::reconcilers::dexserver::PassContext;

/// Shared context for controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Reads and version-checked writes
    pub store: Arc<dyn ResourceStore>,
    /// Create-or-update of rendered manifests
    pub applier: Arc<dyn ManifestApplier>,
    /// Operator settings
    pub config: OperatorConfig,
    /// Deployment restarts currently being ignored
    pub restart_tracker: Arc<RestartTracker>,
}

impl Context {
    /// Create a new context backed by the API server
    pub fn new(client: Client, config: OperatorConfig) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(KubeStore::new(client.clone())),
            applier: Arc::new(KubeApplier::new(client.clone())),
            client,
            config,
            restart_tracker: Arc::new(RestartTracker::default()),
        })
    }

    /// Borrow the collaborators a convergence pass needs
    pub fn pass_context(&self) -> PassContext<'_> {
        PassContext {
            store: self.store.as_ref(),
            applier: self.applier.as_ref(),
            dex_image: &self.config.dex_image,
            renewal_window: self.config.renewal_window,
        }
    }
}
