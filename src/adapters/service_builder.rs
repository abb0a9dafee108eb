//! Kubernetes Service builders for the Dex web and gRPC listeners

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::adapters::{
    build_labels, build_owner_reference, web_tls_secret_name, GRPC_PORT, GRPC_SERVICE_NAME,
    HTTPS_PORT,
};
use crate::crd::DexServer;

/// Annotation asking the platform to mint a serving certificate into a secret
pub const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

/// Build the data-plane (HTTPS) Service, named after the DexServer
pub fn build_http_service(dex_server: &DexServer) -> Service {
    let name = dex_server.name_any();

    let mut annotations = BTreeMap::new();
    annotations.insert(
        SERVING_CERT_ANNOTATION.to_string(),
        web_tls_secret_name(dex_server),
    );

    build_service(
        dex_server,
        &name,
        Some(annotations),
        ServicePort {
            name: Some("https".to_string()),
            port: HTTPS_PORT,
            target_port: Some(IntOrString::String("https".to_string())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
    )
}

/// Build the control-plane (gRPC API) Service
pub fn build_grpc_service(dex_server: &DexServer) -> Service {
    build_service(
        dex_server,
        GRPC_SERVICE_NAME,
        None,
        ServicePort {
            name: Some("grpc".to_string()),
            port: GRPC_PORT,
            target_port: Some(IntOrString::String("grpc".to_string())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
    )
}

fn build_service(
    dex_server: &DexServer,
    name: &str,
    annotations: Option<BTreeMap<String, String>>,
    port: ServicePort,
) -> Service {
    let labels = build_labels(&dex_server.name_any());

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: dex_server.namespace(),
            labels: Some(labels.clone()),
            annotations,
            owner_references: Some(vec![build_owner_reference(dex_server)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![port]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::dex_server;

    #[test]
    fn http_service_requests_serving_cert() {
        let service = build_http_service(&dex_server("dex", "idp"));
        assert_eq!(service.metadata.name.as_deref(), Some("dex"));
        assert_eq!(service.metadata.namespace.as_deref(), Some("idp"));
        assert_eq!(
            service.metadata.annotations.unwrap()[SERVING_CERT_ANNOTATION],
            "dex-tls-secret"
        );
        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].port, 5556);
    }

    #[test]
    fn grpc_service_selects_dex_pods() {
        let dex = dex_server("dex", "idp");
        let service = build_grpc_service(&dex);
        assert_eq!(service.metadata.name.as_deref(), Some("grpc"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.ports.unwrap()[0].port, 5557);
        assert_eq!(spec.selector.unwrap()["app"], "dex");
        assert_eq!(
            service.metadata.owner_references.unwrap()[0].name,
            "dex".to_string()
        );
    }
}
