//! Kubernetes Deployment builder for Dex pods

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::adapters::dex_config::{
    CONFIG_MOUNT_PATH, LDAP_CERTS_MOUNT_PATH, MTLS_MOUNT_PATH, WEB_TLS_MOUNT_PATH,
};
use crate::adapters::{
    build_labels, build_owner_reference, config_map_name, web_tls_secret_name, CONFIG_FILE_KEY,
    GRPC_PORT, HTTPS_PORT, SERVICE_ACCOUNT_NAME,
};
use crate::crd::{Connector, DexServer};
use crate::reconcilers::certificates::{MTLS_CERT_EXPIRY_ANNOTATION, SECRET_MTLS_NAME};

/// Pod template annotation carrying the config map fingerprint
pub const CONFIG_HASH_ANNOTATION: &str = "auth.identitatem.io/config-hash";

/// Values rendered into the Deployment besides the DexServer itself
#[derive(Clone, Debug, Default)]
pub struct DeploymentValues {
    /// Dex image pull spec
    pub image: String,
    /// Fingerprint of the config map; omitted until the config map exists
    pub config_hash: Option<String>,
    /// Expiry annotation of the mTLS bundle; omitted until the bundle exists
    pub mtls_expiry: Option<String>,
}

/// Build the Dex Deployment
pub fn build_deployment(dex_server: &DexServer, values: &DeploymentValues) -> Deployment {
    let name = dex_server.name_any();
    let labels = build_labels(&name);

    let mut pod_annotations = BTreeMap::new();
    if let Some(ref hash) = values.config_hash {
        pod_annotations.insert(CONFIG_HASH_ANNOTATION.to_string(), hash.clone());
    }
    if let Some(ref expiry) = values.mtls_expiry {
        pod_annotations.insert(MTLS_CERT_EXPIRY_ANNOTATION.to_string(), expiry.clone());
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: dex_server.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![build_owner_reference(dex_server)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: if pod_annotations.is_empty() {
                        None
                    } else {
                        Some(pod_annotations)
                    },
                    ..Default::default()
                }),
                spec: Some(build_pod_spec(dex_server, &values.image)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn build_pod_spec(dex_server: &DexServer, image: &str) -> PodSpec {
    let mut volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name(dex_server),
                ..Default::default()
            }),
            ..Default::default()
        },
        secret_volume("tls", &web_tls_secret_name(dex_server)),
        secret_volume("mtls", SECRET_MTLS_NAME),
    ];
    let mut volume_mounts = vec![
        mount("config", CONFIG_MOUNT_PATH),
        mount("tls", WEB_TLS_MOUNT_PATH),
        mount("mtls", MTLS_MOUNT_PATH),
    ];

    // LDAP root CA (and optional client cert) secrets, one mount per connector
    for connector in &dex_server.spec.connectors {
        if let Ok(Connector::Ldap(ldap)) = connector.kind() {
            if let Some(ref root_ca) = ldap.root_ca_ref {
                let volume_name = format!("ldapcerts-{}", connector.id);
                volumes.push(secret_volume(&volume_name, &root_ca.name));
                volume_mounts.push(mount(
                    &volume_name,
                    &format!("{}/{}", LDAP_CERTS_MOUNT_PATH, connector.id),
                ));
            }
        }
    }

    let probe = |initial_delay: i32| Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::String("https".to_string()),
            scheme: Some("HTTPS".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    };

    let container = Container {
        name: "dex".to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/usr/local/bin/dex".to_string()]),
        args: Some(vec![
            "serve".to_string(),
            format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_FILE_KEY),
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("https".to_string()),
                container_port: HTTPS_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("grpc".to_string()),
                container_port: GRPC_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(volume_mounts),
        liveness_probe: Some(probe(10)),
        readiness_probe: Some(probe(5)),
        ..Default::default()
    };

    PodSpec {
        containers: vec![container],
        service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
        volumes: Some(volumes),
        ..Default::default()
    }
}
