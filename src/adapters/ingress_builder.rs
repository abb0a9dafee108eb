//! Ingress builder exposing the Dex web listener on the issuer host

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::collections::BTreeMap;
use url::Url;

use crate::adapters::{build_labels, build_owner_reference, HTTPS_PORT};
use crate::crd::DexServer;
use crate::{Error, Result};

/// Route termination requested from the platform router
pub const ROUTE_TERMINATION_ANNOTATION: &str = "route.openshift.io/termination";

/// Host part of the issuer URL
pub fn issuer_host(issuer: &str) -> Result<String> {
    let url = Url::parse(issuer)
        .map_err(|e| Error::ConfigError(format!("invalid issuer URL {:?}: {}", issuer, e)))?;
    url.host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::ConfigError(format!("issuer URL {:?} has no host", issuer)))
}

/// Build the Ingress routing the issuer host to the data-plane service
pub fn build_ingress(dex_server: &DexServer) -> Result<Ingress> {
    let name = dex_server.name_any();
    let host = issuer_host(&dex_server.spec.issuer)?;

    let mut annotations = BTreeMap::new();
    annotations.insert(
        ROUTE_TERMINATION_ANNOTATION.to_string(),
        "reencrypt".to_string(),
    );

    let tls = dex_server
        .spec
        .ingress_certificate_ref
        .as_ref()
        .filter(|r| !r.name.is_empty())
        .map(|r| {
            vec![IngressTLS {
                hosts: Some(vec![host.clone()]),
                secret_name: Some(r.name.clone()),
            }]
        });

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: dex_server.namespace(),
            labels: Some(build_labels(&name)),
            annotations: Some(annotations),
            owner_references: Some(vec![build_owner_reference(dex_server)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            tls,
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name,
                                port: Some(ServiceBackendPort {
                                    number: Some(HTTPS_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Convert a typed resource into the untyped form accepted by the dynamic apply path
pub fn to_dynamic(ingress: &Ingress) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(ingress)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::dex_server;
    use crate::crd::LocalObjectRef;

    #[test]
    fn host_is_taken_from_issuer() {
        assert_eq!(
            issuer_host("https://dex.apps.example.com/dex").unwrap(),
            "dex.apps.example.com"
        );
        assert_eq!(
            issuer_host("https://dex.example.com:8443").unwrap(),
            "dex.example.com"
        );
    }

    #[test]
    fn malformed_issuer_is_a_config_error() {
        assert!(matches!(
            issuer_host("not a url").unwrap_err(),
            Error::ConfigError(_)
        ));
        assert!(matches!(
            issuer_host("unix:/var/run/dex.sock").unwrap_err(),
            Error::ConfigError(_)
        ));
    }

    #[test]
    fn ingress_routes_to_https_service() {
        let mut dex = dex_server("dex", "idp");
        dex.spec.ingress_certificate_ref = Some(LocalObjectRef {
            name: "dex-cert".to_string(),
        });
        let ingress = build_ingress(&dex).unwrap();
        let spec = ingress.spec.unwrap();

        let tls = &spec.tls.unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("dex-cert"));
        assert_eq!(tls.hosts.as_ref().unwrap()[0], "dex.apps.example.com");

        let rule = &spec.rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("dex.apps.example.com"));
        let backend = rule.http.as_ref().unwrap().paths[0]
            .backend
            .service
            .clone()
            .unwrap();
        assert_eq!(backend.name, "dex");
        assert_eq!(backend.port.unwrap().number, Some(5556));
    }

    #[test]
    fn ingress_without_certificate_has_no_tls() {
        let ingress = build_ingress(&dex_server("dex", "idp")).unwrap();
        assert!(ingress.spec.unwrap().tls.is_none());
    }

    #[test]
    fn dynamic_form_keeps_type_and_owner() {
        let ingress = build_ingress(&dex_server("dex", "idp")).unwrap();
        let dynamic = to_dynamic(&ingress).unwrap();
        let types = dynamic.types.unwrap();
        assert_eq!(types.api_version, "networking.k8s.io/v1");
        assert_eq!(types.kind, "Ingress");
        assert_eq!(dynamic.metadata.owner_references.unwrap()[0].kind, "DexServer");
        assert_eq!(dynamic.data["spec"]["rules"][0]["host"], "dex.apps.example.com");
    }
}
