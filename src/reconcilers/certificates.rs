//! Mutual-TLS credential bundle for the Dex gRPC API
//!
//! The bundle is a single secret holding a CA, a server certificate for the
//! gRPC service and a client certificate, all signed by that CA. Its expiry
//! annotation records the server certificate's not-after and drives renewal.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::adapters::{build_owner_reference, GRPC_SERVICE_NAME};
use crate::cluster::ResourceStore;
use crate::crd::DexServer;
use crate::metrics::CERTIFICATE_ROTATIONS;
use crate::{Error, Result};

/// Name of the credential bundle secret
pub const SECRET_MTLS_NAME: &str = "grpc-mtls";
/// Annotation holding the server certificate's not-after (RFC 3339, UTC)
pub const MTLS_CERT_EXPIRY_ANNOTATION: &str = "auth.identitatem.io/expiry";

const CA_VALIDITY_DAYS: i64 = 365;
/// Validity of the server and client certificates
pub const LEAF_VALIDITY_DAYS: i64 = 90;

/// PEM encoded CA, server and client material
#[derive(Clone, Debug)]
pub struct MtlsBundle {
    pub ca_cert: String,
    pub ca_key: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
    /// Server certificate not-after
    pub expiry: DateTime<Utc>,
}

/// What to do with the bundle found in the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenewalDecision {
    /// No bundle exists yet
    Create,
    /// The bundle is corrupt or about to expire
    Regenerate(String),
    /// The bundle is fresh
    Keep,
}

/// Decide whether the existing bundle must be (re)generated at `now`
///
/// A missing or unparseable expiry annotation counts as corruption.
pub fn renewal_decision(
    existing: Option<&Secret>,
    now: DateTime<Utc>,
    renewal_window: Duration,
) -> RenewalDecision {
    let Some(secret) = existing else {
        return RenewalDecision::Create;
    };

    let Some(raw) = secret.annotations().get(MTLS_CERT_EXPIRY_ANNOTATION) else {
        return RenewalDecision::Regenerate("expiry annotation is missing".to_string());
    };

    match DateTime::parse_from_rfc3339(raw) {
        Err(e) => RenewalDecision::Regenerate(format!(
            "expiry annotation {:?} could not be parsed: {}",
            raw, e
        )),
        Ok(expiry) => match now.checked_add_signed(renewal_window) {
            Some(renew_from) if renew_from < expiry.with_timezone(&Utc) => RenewalDecision::Keep,
            _ => RenewalDecision::Regenerate(format!("certificate expires at {}", raw)),
        },
    }
}

/// Format a not-after as stored in the expiry annotation
pub fn format_expiry(expiry: DateTime<Utc>) -> String {
    expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// DNS names the gRPC service answers to inside the cluster
pub fn server_dns_names(namespace: &str) -> Vec<String> {
    vec![
        GRPC_SERVICE_NAME.to_string(),
        format!("{}.{}", GRPC_SERVICE_NAME, namespace),
        format!("{}.{}.svc", GRPC_SERVICE_NAME, namespace),
        format!("{}.{}.svc.cluster.local", GRPC_SERVICE_NAME, namespace),
    ]
}

fn cert_error(what: &str) -> impl Fn(rcgen::Error) -> Error + '_ {
    move |e| Error::CertificateError(format!("{}: {}", what, e))
}

fn to_offset(at: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::CertificateError(format!("timestamp out of range: {}", e)))
}

/// Generate a fresh CA, server and client chain issued at `now`
pub fn generate_bundle(namespace: &str, now: DateTime<Utc>) -> Result<MtlsBundle> {
    // certificates carry whole seconds; the annotation must match exactly
    let issued = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
    let expiry = issued + Duration::days(LEAF_VALIDITY_DAYS);

    let ca_key = KeyPair::generate().map_err(cert_error("generate CA key"))?;
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "dex-grpc-ca");
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, "identitatem");
    ca_params.not_before = to_offset(issued)?;
    ca_params.not_after = to_offset(issued + Duration::days(CA_VALIDITY_DAYS))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(cert_error("sign CA certificate"))?;

    let server_key = KeyPair::generate().map_err(cert_error("generate server key"))?;
    let mut server_params = CertificateParams::new(server_dns_names(namespace))
        .map_err(cert_error("server subject alternative names"))?;
    server_params
        .distinguished_name
        .push(DnType::CommonName, format!("{}.{}.svc", GRPC_SERVICE_NAME, namespace));
    server_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    server_params.not_before = to_offset(issued)?;
    server_params.not_after = to_offset(expiry)?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .map_err(cert_error("sign server certificate"))?;

    let client_key = KeyPair::generate().map_err(cert_error("generate client key"))?;
    let mut client_params = CertificateParams::default();
    client_params
        .distinguished_name
        .push(DnType::CommonName, "dex-grpc-client");
    client_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    client_params.not_before = to_offset(issued)?;
    client_params.not_after = to_offset(expiry)?;
    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .map_err(cert_error("sign client certificate"))?;

    Ok(MtlsBundle {
        ca_cert: ca_cert.pem(),
        ca_key: ca_key.serialize_pem(),
        server_cert: server_cert.pem(),
        server_key: server_key.serialize_pem(),
        client_cert: client_cert.pem(),
        client_key: client_key.serialize_pem(),
        expiry,
    })
}

/// Render the bundle secret owned by `dex_server`
pub fn build_mtls_secret(dex_server: &DexServer, bundle: &MtlsBundle) -> Secret {
    let pem = |value: &str| ByteString(value.as_bytes().to_vec());
    let data: BTreeMap<String, ByteString> = [
        ("ca.crt", pem(&bundle.ca_cert)),
        ("ca.key", pem(&bundle.ca_key)),
        ("tls.crt", pem(&bundle.server_cert)),
        ("tls.key", pem(&bundle.server_key)),
        ("client.crt", pem(&bundle.client_cert)),
        ("client.key", pem(&bundle.client_key)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), dex_server.name_any());
    let mut annotations = BTreeMap::new();
    annotations.insert(
        MTLS_CERT_EXPIRY_ANNOTATION.to_string(),
        format_expiry(bundle.expiry),
    );

    Secret {
        metadata: ObjectMeta {
            name: Some(SECRET_MTLS_NAME.to_string()),
            namespace: dex_server.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![build_owner_reference(dex_server)]),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Keeps the credential bundle of a DexServer present and fresh
pub struct CertificateManager<'a> {
    store: &'a dyn ResourceStore,
    renewal_window: Duration,
}

impl<'a> CertificateManager<'a> {
    pub fn new(store: &'a dyn ResourceStore, renewal_window: Duration) -> Self {
        Self {
            store,
            renewal_window,
        }
    }

    /// Ensure the bundle exists and is outside the renewal window
    ///
    /// Returns true when the bundle was created or regenerated.
    pub async fn ensure(&self, dex_server: &DexServer) -> Result<bool> {
        self.ensure_at(dex_server, Utc::now()).await
    }

    /// [`ensure`](Self::ensure) evaluated at a given instant
    pub async fn ensure_at(&self, dex_server: &DexServer, now: DateTime<Utc>) -> Result<bool> {
        let namespace = dex_server.namespace().unwrap_or_default();

        let existing = match self.store.get_secret(&namespace, SECRET_MTLS_NAME).await {
            Ok(secret) => Some(secret),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let decision = renewal_decision(existing.as_ref(), now, self.renewal_window);
        if decision == RenewalDecision::Keep {
            debug!("mTLS bundle {}/{} does not require renewal", namespace, SECRET_MTLS_NAME);
            return Ok(false);
        }

        let bundle = generate_bundle(&namespace, now)?;
        let mut secret = build_mtls_secret(dex_server, &bundle);

        match existing {
            None => {
                info!("Creating mTLS bundle {}/{}", namespace, SECRET_MTLS_NAME);
                self.store.create_secret(&secret).await?;
                CERTIFICATE_ROTATIONS.with_label_values(&["created"]).inc();
            }
            Some(current) => {
                if let RenewalDecision::Regenerate(ref why) = decision {
                    warn!(
                        "Regenerating mTLS bundle {}/{}: {}",
                        namespace, SECRET_MTLS_NAME, why
                    );
                }
                secret.metadata.resource_version = current.resource_version();
                self.store.update_secret(&secret).await?;
                CERTIFICATE_ROTATIONS.with_label_values(&["renewed"]).inc();
            }
        }
        Ok(true)
    }
}
