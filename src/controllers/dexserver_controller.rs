//! Controller for DexServer resources

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    runtime::{
        controller::{Action, Controller},
        reflector::{self, ObjectRef},
        watcher::{self, watcher, Config},
        WatchStreamExt,
    },
    Api, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::adapters::secrets::IDP_CREDENTIAL_LABEL;
use crate::controllers::event_filter::{
    admit_credential_secret, admit_dex_server, filtered, only_dex_server_owned,
};
use crate::controllers::Context;
use crate::crd::DexServer;
use crate::metrics::prometheus::{
    set_ready, MANAGED_RESOURCES, RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS,
};
use crate::reconcilers::dexserver;
use crate::Error;

/// Interval of the scheduled re-evaluation after a successful pass
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(3600);

/// Run the DexServer controller
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let dex_servers: Api<DexServer> = Api::all(client.clone());

    info!("Starting DexServer controller");

    let (reader, writer) = reflector::store();
    let dex_server_events = watcher(dex_servers, Config::default())
        .default_backoff()
        .reflect(writer);
    let dex_server_stream = filtered(dex_server_events, "dexserver", admit_dex_server);

    let restart_tracker = ctx.restart_tracker.clone();
    let deployment_events = only_dex_server_owned(
        watcher(Api::<Deployment>::all(client.clone()), Config::default()).default_backoff(),
    );
    let deployment_stream = filtered(deployment_events, "deployment", move |sighting, new| {
        restart_tracker.admit(sighting, new)
    });

    let credential_events = watcher(
        Api::<Secret>::all(client.clone()),
        Config::default().labels(IDP_CREDENTIAL_LABEL),
    )
    .default_backoff();
    let credential_stream = filtered(credential_events, "credential-secret", admit_credential_secret);

    let cache = reader.clone();
    let controller = Controller::for_stream(dex_server_stream, reader.clone())
        .owns_stream(owned::<ConfigMap>(&client))
        .owns_stream(owned::<Service>(&client))
        .owns_stream(owned::<ServiceAccount>(&client))
        .owns_stream(owned::<Secret>(&client))
        .owns_stream(owned::<Ingress>(&client))
        .owns_stream(deployment_stream)
        .watches_stream(credential_stream, move |secret| {
            // a credential may back any instance; re-evaluate all of them
            info!("Credential secret {} changed", secret.name_any());
            cache
                .state()
                .iter()
                .map(|dex_server| ObjectRef::from_obj(dex_server.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal();

    set_ready(true);
    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            MANAGED_RESOURCES
                .with_label_values(&["DexServer"])
                .set(reader.state().len() as f64);
            async move {
                match res {
                    Ok(o) => info!("Reconciled {:?}", o),
                    Err(e) => error!("Reconcile failed: {:?}", e),
                }
            }
        })
        .await;

    set_ready(false);
    info!("DexServer controller stopped");
}

/// Change stream of an owned kind
fn owned<K>(
    client: &kube::Client,
) -> impl futures::Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + 'static,
{
    watcher(Api::<K>::all(client.clone()), Config::default())
        .default_backoff()
        .touched_objects()
}

/// Reconcile a DexServer resource
#[instrument(skip(dex_server, ctx), fields(name = %dex_server.name_any(), namespace = dex_server.namespace().unwrap_or_default()))]
async fn reconcile(dex_server: Arc<DexServer>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = std::time::Instant::now();
    let ns = dex_server.namespace().unwrap_or_default();
    let name = dex_server.name_any();

    RECONCILIATIONS.with_label_values(&["DexServer"]).inc();

    let deadline = tokio::time::Instant::now() + ctx.config.reconcile_timeout;
    let result = dexserver::converge(&dex_server, ctx.pass_context(), deadline).await;

    let duration = start.elapsed().as_secs_f64();
    RECONCILE_DURATION
        .with_label_values(&["DexServer"])
        .observe(duration);

    match result {
        Ok(()) => {
            info!(
                "Successfully reconciled {}/{} in {:.2}s",
                ns, name, duration
            );
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(e) => {
            RECONCILIATION_ERRORS
                .with_label_values(&["DexServer", failure_reason(&e)])
                .inc();
            error!("Failed to reconcile {}/{}: {}", ns, name, e);
            Err(e)
        }
    }
}

/// Reason label of a failed pass
fn failure_reason(err: &Error) -> &'static str {
    match err {
        Error::StepFailed { reason, .. } => *reason,
        _ => "Unknown",
    }
}

/// How long to wait before retrying after `err`
fn retry_after(err: &Error) -> Duration {
    match err {
        Error::StepFailed { source, .. } => retry_after(source),
        Error::NotFound(_) | Error::SecretError(_) => Duration::from_secs(30),
        Error::Conflict(_) => Duration::from_secs(5),
        Error::KubeError(_) | Error::Timeout(_) => Duration::from_secs(30),
        Error::ConfigError(_) | Error::ValidationError(_) => Duration::from_secs(300),
        Error::CertificateError(_) => Duration::from_secs(60),
    }
}

/// Error policy for the controller
fn error_policy(dex_server: Arc<DexServer>, err: &Error, _ctx: Arc<Context>) -> Action {
    let ns = dex_server.namespace().unwrap_or_default();
    let name = dex_server.name_any();

    error!("Reconciliation error for {}/{}: {:?}", ns, name, err);

    Action::requeue(retry_after(err))
}
