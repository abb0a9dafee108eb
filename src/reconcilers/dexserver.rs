//! Convergence pass for DexServer resources
//!
//! A pass runs a fixed sequence of steps. The first failing step stops the
//! pass and is recorded on the `Applied` condition with the step's reason
//! code; a pass where every step succeeds records `Applied=True` together
//! with the list of derived resources.

use std::collections::HashSet;

use chrono::Duration;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapters::deployment_builder::{build_deployment, DeploymentValues};
use crate::adapters::dex_config::{
    build_config_map, build_dex_config, LdapCertFiles, ResolvedConnector,
};
use crate::adapters::ingress_builder::{build_ingress, to_dynamic};
use crate::adapters::rbac_builder::{build_cluster_role_binding, build_service_account};
use crate::adapters::secrets::{fetch_credential_secret, get_secret_key, has_key};
use crate::adapters::service_builder::{build_grpc_service, build_http_service};
use crate::adapters::{
    cluster_role_binding_name, config_map_name, GRPC_SERVICE_NAME, SERVICE_ACCOUNT_NAME,
};
use crate::cluster::{ApplyOutcome, Manifest, ManifestApplier, ResourceStore};
use crate::crd::{Condition, Connector, DexServer, RelatedObjectReference, CONDITION_TYPE_APPLIED};
use crate::reconcilers::certificates::{
    CertificateManager, MTLS_CERT_EXPIRY_ANNOTATION, SECRET_MTLS_NAME,
};
use crate::reconcilers::drift::current_fingerprint;
use crate::reconcilers::status::next_status;
use crate::{Error, Result};

/// Reason recorded when every step succeeded
pub const REASON_APPLIED: &str = "Applied";
/// Message recorded when every step succeeded
pub const MESSAGE_APPLIED: &str = "DexServer is applied";

/// Collaborators and settings a pass runs against
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    pub store: &'a dyn ResourceStore,
    pub applier: &'a dyn ManifestApplier,
    /// Dex server image
    pub dex_image: &'a str,
    /// Lead time before certificate expiry at which the bundle is renewed
    pub renewal_window: Duration,
}

/// The ordered steps of a convergence pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    MtlsSecret,
    ConfigMap,
    HttpService,
    GrpcService,
    ServiceAccount,
    ClusterRoleBinding,
    Deployment,
    Ingress,
}

impl Step {
    /// Execution order
    pub const ALL: [Step; 8] = [
        Step::MtlsSecret,
        Step::ConfigMap,
        Step::HttpService,
        Step::GrpcService,
        Step::ServiceAccount,
        Step::ClusterRoleBinding,
        Step::Deployment,
        Step::Ingress,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::MtlsSecret => "mtls-secret",
            Step::ConfigMap => "config-map",
            Step::HttpService => "http-service",
            Step::GrpcService => "grpc-service",
            Step::ServiceAccount => "service-account",
            Step::ClusterRoleBinding => "cluster-role-binding",
            Step::Deployment => "deployment",
            Step::Ingress => "ingress",
        }
    }

    /// Completes "failed to ..." in the condition message
    pub fn action(self) -> &'static str {
        match self {
            Step::MtlsSecret => "configure MTLS secret",
            Step::ConfigMap => "sync ConfigMap",
            Step::HttpService => "sync http service",
            Step::GrpcService => "sync grpc service",
            Step::ServiceAccount => "sync ServiceAccount",
            Step::ClusterRoleBinding => "sync ClusterRoleBinding",
            Step::Deployment => "sync Deployment",
            Step::Ingress => "sync Ingress",
        }
    }

    /// Reason code recorded when the step fails
    pub fn reason(self) -> &'static str {
        match self {
            Step::MtlsSecret => "ConfigMTLSSecretFailed",
            Step::ConfigMap => "ConfigMapFailed",
            Step::HttpService => "ConfigHTTPServiceFailed",
            Step::GrpcService => "ConfigGRPCServiceFailed",
            Step::ServiceAccount => "ConfigServiceAccountFailed",
            Step::ClusterRoleBinding => "ConfigClusterRoleBindingFailed",
            Step::Deployment => "ConfigDeploymentFailed",
            Step::Ingress => "ConfigIngressFailed",
        }
    }

    async fn run(self, dex_server: &DexServer, ctx: PassContext<'_>) -> Result<()> {
        match self {
            Step::MtlsSecret => {
                CertificateManager::new(ctx.store, ctx.renewal_window)
                    .ensure(dex_server)
                    .await?;
                Ok(())
            }
            Step::ConfigMap => sync_config_map(dex_server, ctx).await,
            Step::HttpService => {
                apply(ctx, Manifest::Service(build_http_service(dex_server))).await
            }
            Step::GrpcService => {
                apply(ctx, Manifest::Service(build_grpc_service(dex_server))).await
            }
            Step::ServiceAccount => {
                apply(ctx, Manifest::ServiceAccount(build_service_account(dex_server))).await
            }
            Step::ClusterRoleBinding => {
                apply(
                    ctx,
                    Manifest::ClusterRoleBinding(build_cluster_role_binding(dex_server)),
                )
                .await
            }
            Step::Deployment => sync_deployment(dex_server, ctx).await,
            Step::Ingress => {
                let ingress = to_dynamic(&build_ingress(dex_server)?)?;
                let outcome = ctx.applier.apply_custom_resource(&ingress).await?;
                log_outcome("Ingress", &ingress.name_any(), outcome);
                Ok(())
            }
        }
    }
}

fn log_outcome(kind: &str, name: &str, outcome: ApplyOutcome) {
    match outcome {
        ApplyOutcome::Unchanged => debug!("{} {} unchanged", kind, name),
        changed => info!("{} {} {:?}", kind, name, changed),
    }
}

async fn apply(ctx: PassContext<'_>, manifest: Manifest) -> Result<()> {
    let outcome = ctx.applier.apply_direct(&manifest).await?;
    let name = match &manifest {
        Manifest::ConfigMap(r) => r.name_any(),
        Manifest::Service(r) => r.name_any(),
        Manifest::ServiceAccount(r) => r.name_any(),
        Manifest::ClusterRole(r) => r.name_any(),
        Manifest::ClusterRoleBinding(r) => r.name_any(),
    };
    log_outcome(manifest.kind(), &name, outcome);
    Ok(())
}

/// Reject connector lists that reuse an identifier
fn check_unique_ids(dex_server: &DexServer) -> Result<()> {
    let mut seen = HashSet::new();
    for connector in &dex_server.spec.connectors {
        if !seen.insert(connector.id.as_str()) {
            return Err(Error::ValidationError(format!(
                "connector id {:?} is used more than once",
                connector.id
            )));
        }
    }
    Ok(())
}

async fn resolve_connectors<'a>(
    dex_server: &'a DexServer,
    ctx: PassContext<'_>,
) -> Result<Vec<ResolvedConnector<'a>>> {
    let namespace = dex_server.namespace().unwrap_or_default();
    let mut resolved = Vec::with_capacity(dex_server.spec.connectors.len());

    for spec in &dex_server.spec.connectors {
        let kind = spec.kind()?;
        let (secret_ref, key) = kind.credential_ref();
        let secret = fetch_credential_secret(ctx.store, secret_ref, &namespace).await?;
        let credential = get_secret_key(&secret, key)?;

        let mut ldap_certs = LdapCertFiles::default();
        if let Connector::Ldap(ldap) = kind {
            if let Some(ref root_ca) = ldap.root_ca_ref {
                let ca_secret = fetch_credential_secret(ctx.store, root_ca, &namespace).await?;
                ldap_certs = LdapCertFiles {
                    root_ca: has_key(&ca_secret, "ca.crt"),
                    client_cert: has_key(&ca_secret, "tls.crt"),
                    client_key: has_key(&ca_secret, "tls.key"),
                };
            }
        }

        resolved.push(ResolvedConnector {
            spec,
            credential,
            ldap_certs,
        });
    }

    Ok(resolved)
}

async fn sync_config_map(dex_server: &DexServer, ctx: PassContext<'_>) -> Result<()> {
    check_unique_ids(dex_server)?;
    let connectors = resolve_connectors(dex_server, ctx).await?;
    let config_yaml = build_dex_config(&dex_server.spec.issuer, &connectors)?;
    apply(
        ctx,
        Manifest::ConfigMap(build_config_map(dex_server, config_yaml)),
    )
    .await
}

async fn sync_deployment(dex_server: &DexServer, ctx: PassContext<'_>) -> Result<()> {
    let namespace = dex_server.namespace().unwrap_or_default();

    let config_hash =
        current_fingerprint(ctx.store, &namespace, &config_map_name(dex_server)).await?;
    let mtls_expiry = match ctx.store.get_secret(&namespace, SECRET_MTLS_NAME).await {
        Ok(secret) => secret
            .annotations()
            .get(MTLS_CERT_EXPIRY_ANNOTATION)
            .cloned(),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };

    let deployment = build_deployment(
        dex_server,
        &DeploymentValues {
            image: ctx.dex_image.to_string(),
            config_hash,
            mtls_expiry,
        },
    );
    let outcome = ctx.applier.apply_deployment(&deployment).await?;
    log_outcome("Deployment", &deployment.name_any(), outcome);
    Ok(())
}

/// References to every resource derived from `dex_server`
pub fn related_objects(dex_server: &DexServer) -> Vec<RelatedObjectReference> {
    let name = dex_server.name_any();
    let namespace = dex_server.namespace().unwrap_or_default();
    let reference = |group: &str, kind: &str, name: &str, namespace: &str| RelatedObjectReference {
        group: group.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
    };

    vec![
        reference("", "Secret", SECRET_MTLS_NAME, &namespace),
        reference("", "ConfigMap", &config_map_name(dex_server), &namespace),
        reference("", "Service", &name, &namespace),
        reference("", "Service", GRPC_SERVICE_NAME, &namespace),
        reference("", "ServiceAccount", SERVICE_ACCOUNT_NAME, &namespace),
        reference(
            "rbac.authorization.k8s.io",
            "ClusterRoleBinding",
            &cluster_role_binding_name(&namespace),
            "",
        ),
        reference("apps", "Deployment", &name, &namespace),
        reference("networking.k8s.io", "Ingress", &name, &namespace),
    ]
}

/// Merge `condition` into the status and persist it if anything changed
async fn record_status(
    dex_server: &DexServer,
    ctx: PassContext<'_>,
    condition: Condition,
    related: Option<Vec<RelatedObjectReference>>,
) -> Result<()> {
    let status = next_status(dex_server.status.as_ref(), condition, related);
    if dex_server.status.as_ref() == Some(&status) {
        debug!("Status of {} unchanged", dex_server.name_any());
        return Ok(());
    }

    let mut updated = dex_server.clone();
    updated.status = Some(status);
    ctx.store.update_status(&updated).await
}

/// Run one convergence pass, giving up on the step in flight at `deadline`
pub async fn converge(dex_server: &DexServer, ctx: PassContext<'_>, deadline: Instant) -> Result<()> {
    let ns = dex_server.namespace().unwrap_or_default();
    let name = dex_server.name_any();

    for step in Step::ALL {
        info!("Syncing {} for DexServer {}/{}", step.name(), ns, name);

        let result = match tokio::time::timeout_at(deadline, step.run(dex_server, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "pass deadline expired during {}",
                step.name()
            ))),
        };

        if let Err(source) = result {
            let err = Error::StepFailed {
                reason: step.reason(),
                action: step.action(),
                source: Box::new(source),
            };
            error!(
                "Step {} failed for DexServer {}/{} ({}): {}",
                step.name(),
                ns,
                name,
                step.reason(),
                err
            );

            let condition = Condition::new(
                CONDITION_TYPE_APPLIED,
                false,
                step.reason(),
                err.to_string(),
            );
            if let Err(status_err) = record_status(dex_server, ctx, condition, None).await {
                warn!(
                    "Failed to record failure status for DexServer {}/{}: {}",
                    ns, name, status_err
                );
            }
            return Err(err);
        }
    }

    let condition = Condition::new(CONDITION_TYPE_APPLIED, true, REASON_APPLIED, MESSAGE_APPLIED);
    record_status(dex_server, ctx, condition, Some(related_objects(dex_server))).await?;
    info!("DexServer {}/{} is applied", ns, name);
    Ok(())
}
