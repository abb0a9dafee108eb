//! DexServer spec to Dex `config.yaml` transformation

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::adapters::{
    build_labels, build_owner_reference, config_map_name, CONFIG_FILE_KEY, GRPC_PORT, HTTPS_PORT,
};
use crate::crd::{Connector, ConnectorSpec, DexServer, GroupSearch, Org, UserSearch};
use crate::Result;

/// Directory the web TLS secret is mounted at
pub const WEB_TLS_MOUNT_PATH: &str = "/etc/dex/tls";
/// Directory the gRPC mTLS bundle is mounted at
pub const MTLS_MOUNT_PATH: &str = "/etc/dex/mtls";
/// Directory the config map is mounted at
pub const CONFIG_MOUNT_PATH: &str = "/etc/dex/config";
/// Parent directory of per-connector LDAP certificate mounts
pub const LDAP_CERTS_MOUNT_PATH: &str = "/etc/dex/ldapcerts";

/// A connector whose credential has been read from its secret
#[derive(Clone, Debug)]
pub struct ResolvedConnector<'a> {
    /// Connector as declared on the DexServer
    pub spec: &'a ConnectorSpec,
    /// Client secret or bind password
    pub credential: String,
    /// Files present in the LDAP root CA secret, if one is referenced
    pub ldap_certs: LdapCertFiles,
}

/// Which optional files an LDAP root CA secret provides
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LdapCertFiles {
    pub root_ca: bool,
    pub client_cert: bool,
    pub client_key: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DexConfig<'a> {
    issuer: &'a str,
    storage: Storage,
    web: Web,
    grpc: Grpc,
    oauth2: OAuth2,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    connectors: Vec<DexConnector<'a>>,
}

#[derive(Serialize)]
struct Storage {
    #[serde(rename = "type")]
    type_: &'static str,
    config: StorageConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorageConfig {
    in_cluster: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Web {
    https: String,
    tls_cert: String,
    tls_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Grpc {
    addr: String,
    tls_cert: String,
    tls_key: String,
    #[serde(rename = "tlsClientCA")]
    tls_client_ca: String,
    reflection: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OAuth2 {
    skip_approval_screen: bool,
}

#[derive(Serialize)]
struct DexConnector<'a> {
    #[serde(rename = "type")]
    type_: &'static str,
    id: &'a str,
    name: &'a str,
    config: ConnectorConfig<'a>,
}

#[derive(Default, Serialize)]
struct ConnectorConfig<'a> {
    #[serde(rename = "clientID", skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(rename = "clientSecret", skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    #[serde(rename = "redirectURI", skip_serializing_if = "Option::is_none")]
    redirect_uri: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    org: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    orgs: Option<&'a [Org]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    tenant: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    #[serde(rename = "insecureNoSSL", skip_serializing_if = "std::ops::Not::not")]
    insecure_no_ssl: bool,
    #[serde(rename = "insecureSkipVerify", skip_serializing_if = "std::ops::Not::not")]
    insecure_skip_verify: bool,
    #[serde(rename = "startTLS", skip_serializing_if = "std::ops::Not::not")]
    start_tls: bool,
    #[serde(rename = "rootCA", skip_serializing_if = "Option::is_none")]
    root_ca: Option<String>,
    #[serde(rename = "clientCert", skip_serializing_if = "Option::is_none")]
    client_cert: Option<String>,
    #[serde(rename = "clientKey", skip_serializing_if = "Option::is_none")]
    client_key: Option<String>,
    #[serde(rename = "bindDN", skip_serializing_if = "Option::is_none")]
    bind_dn: Option<&'a str>,
    #[serde(rename = "bindPW", skip_serializing_if = "Option::is_none")]
    bind_pw: Option<String>,
    #[serde(rename = "usernamePrompt", skip_serializing_if = "Option::is_none")]
    username_prompt: Option<&'a str>,
    #[serde(rename = "userSearch", skip_serializing_if = "Option::is_none")]
    user_search: Option<&'a UserSearch>,
    #[serde(rename = "groupSearch", skip_serializing_if = "Option::is_none")]
    group_search: Option<&'a GroupSearch>,
}

/// Mount path for one of the files of an LDAP connector's certificate secret
pub fn ldap_cert_path(connector_id: &str, file: &str) -> String {
    format!("{}/{}/{}", LDAP_CERTS_MOUNT_PATH, connector_id, file)
}

fn render_connector<'a>(resolved: &'a ResolvedConnector<'a>) -> Result<DexConnector<'a>> {
    let spec = resolved.spec;
    let kind = spec.kind()?;

    let config = match kind {
        Connector::GitHub(github) => ConnectorConfig {
            client_id: Some(&github.client_id),
            client_secret: Some(resolved.credential.clone()),
            redirect_uri: Some(&github.redirect_uri),
            org: github.org.as_deref(),
            orgs: (!github.orgs.is_empty()).then_some(github.orgs.as_slice()),
            ..Default::default()
        },
        Connector::Microsoft(microsoft) => ConnectorConfig {
            client_id: Some(&microsoft.client_id),
            client_secret: Some(resolved.credential.clone()),
            redirect_uri: Some(&microsoft.redirect_uri),
            tenant: microsoft.tenant.as_deref(),
            ..Default::default()
        },
        Connector::Ldap(ldap) => {
            let files = resolved.ldap_certs;
            let path = |present: bool, file: &str| present.then(|| ldap_cert_path(&spec.id, file));
            ConnectorConfig {
                host: Some(&ldap.host),
                insecure_no_ssl: ldap.insecure_no_ssl,
                insecure_skip_verify: ldap.insecure_skip_verify,
                start_tls: ldap.start_tls,
                root_ca: path(files.root_ca, "ca.crt"),
                client_cert: path(files.client_cert, "tls.crt"),
                client_key: path(files.client_key, "tls.key"),
                bind_dn: Some(&ldap.bind_dn),
                bind_pw: Some(resolved.credential.clone()),
                username_prompt: ldap.username_prompt.as_deref(),
                user_search: ldap.user_search.as_ref().filter(|s| !s.base_dn.is_empty()),
                group_search: ldap.group_search.as_ref().filter(|s| !s.base_dn.is_empty()),
                ..Default::default()
            }
        }
    };

    Ok(DexConnector {
        type_: kind.type_name(),
        id: &spec.id,
        name: &spec.name,
        config,
    })
}

/// Build the Dex `config.yaml` for an issuer and its resolved connectors
pub fn build_dex_config(issuer: &str, connectors: &[ResolvedConnector<'_>]) -> Result<String> {
    let connectors = connectors
        .iter()
        .map(|resolved| render_connector(resolved))
        .collect::<Result<Vec<_>>>()?;

    let config = DexConfig {
        issuer,
        storage: Storage {
            type_: "kubernetes",
            config: StorageConfig { in_cluster: true },
        },
        web: Web {
            https: format!("0.0.0.0:{}", HTTPS_PORT),
            tls_cert: format!("{}/tls.crt", WEB_TLS_MOUNT_PATH),
            tls_key: format!("{}/tls.key", WEB_TLS_MOUNT_PATH),
        },
        grpc: Grpc {
            addr: format!("0.0.0.0:{}", GRPC_PORT),
            tls_cert: format!("{}/tls.crt", MTLS_MOUNT_PATH),
            tls_key: format!("{}/tls.key", MTLS_MOUNT_PATH),
            tls_client_ca: format!("{}/ca.crt", MTLS_MOUNT_PATH),
            reflection: true,
        },
        oauth2: OAuth2 {
            skip_approval_screen: true,
        },
        connectors,
    };

    Ok(serde_yaml::to_string(&config)?)
}

/// Build the config map carrying `config.yaml`
pub fn build_config_map(dex_server: &DexServer, config_yaml: String) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(CONFIG_FILE_KEY.to_string(), config_yaml);

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(dex_server)),
            namespace: dex_server.namespace(),
            labels: Some(build_labels(&dex_server.name_any())),
            owner_references: Some(vec![build_owner_reference(dex_server)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LdapConnector, MicrosoftConnector, SecretRef};

    fn parse(yaml: &str) -> serde_yaml::Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn github() -> ConnectorSpec {
        crate::adapters::test_support::dex_server("dex", "idp").spec.connectors[0].clone()
    }

    fn ldap() -> ConnectorSpec {
        ConnectorSpec {
            type_: "ldap".to_string(),
            id: "corp".to_string(),
            name: "Corp".to_string(),
            ldap: Some(LdapConnector {
                host: "ldap.example.com:636".to_string(),
                bind_dn: "cn=admin,dc=example,dc=com".to_string(),
                bind_pw_ref: SecretRef {
                    name: "ldap-bind".to_string(),
                    namespace: None,
                },
                root_ca_ref: Some(SecretRef {
                    name: "ldap-ca".to_string(),
                    namespace: None,
                }),
                user_search: Some(UserSearch {
                    base_dn: "ou=people,dc=example,dc=com".to_string(),
                    username: "uid".to_string(),
                    ..Default::default()
                }),
                group_search: Some(GroupSearch::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn github_connector_inlines_client_secret() {
        let spec = github();
        let resolved = [ResolvedConnector {
            spec: &spec,
            credential: "s3cr3t".to_string(),
            ldap_certs: LdapCertFiles::default(),
        }];
        let config = parse(&build_dex_config("https://dex.example.com", &resolved).unwrap());

        assert_eq!(config["issuer"], "https://dex.example.com");
        let connectors = config["connectors"].as_sequence().unwrap();
        assert_eq!(connectors.len(), 1);
        assert_eq!(connectors[0]["type"], "github");
        assert_eq!(connectors[0]["id"], "github");
        assert_eq!(connectors[0]["config"]["clientID"], "client-id");
        assert_eq!(connectors[0]["config"]["clientSecret"], "s3cr3t");
        assert!(connectors[0]["config"].get("bindPW").is_none());
    }

    #[test]
    fn microsoft_connector_carries_tenant() {
        let spec = ConnectorSpec {
            type_: "microsoft".to_string(),
            id: "ms".to_string(),
            name: "Microsoft".to_string(),
            microsoft: Some(MicrosoftConnector {
                client_id: "app".to_string(),
                tenant: Some("organizations".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let resolved = [ResolvedConnector {
            spec: &spec,
            credential: "pw".to_string(),
            ldap_certs: LdapCertFiles::default(),
        }];
        let config = parse(&build_dex_config("https://dex.example.com", &resolved).unwrap());
        assert_eq!(config["connectors"][0]["config"]["tenant"], "organizations");
        assert_eq!(config["connectors"][0]["config"]["clientSecret"], "pw");
    }

    #[test]
    fn ldap_connector_references_present_cert_files_only() {
        let spec = ldap();
        let resolved = [ResolvedConnector {
            spec: &spec,
            credential: "bind-password".to_string(),
            ldap_certs: LdapCertFiles {
                root_ca: true,
                client_cert: false,
                client_key: false,
            },
        }];
        let config = parse(&build_dex_config("https://dex.example.com", &resolved).unwrap());
        let ldap = &config["connectors"][0]["config"];

        assert_eq!(ldap["bindPW"], "bind-password");
        assert_eq!(ldap["rootCA"], "/etc/dex/ldapcerts/corp/ca.crt");
        assert!(ldap.get("clientCert").is_none());
        assert_eq!(ldap["userSearch"]["baseDN"], "ou=people,dc=example,dc=com");
        // a group search without a base DN is dropped
        assert!(ldap.get("groupSearch").is_none());
    }

    #[test]
    fn grpc_listener_requires_client_certificates() {
        let config = parse(&build_dex_config("https://dex.example.com", &[]).unwrap());
        assert_eq!(config["grpc"]["tlsClientCA"], "/etc/dex/mtls/ca.crt");
        assert_eq!(config["web"]["https"], "0.0.0.0:5556");
        assert!(config.get("connectors").is_none());
    }

    #[test]
    fn config_map_is_named_after_server() {
        let dex = crate::adapters::test_support::dex_server("dex", "idp");
        let config_map = build_config_map(&dex, "issuer: x".to_string());
        assert_eq!(config_map.metadata.name.as_deref(), Some("dex"));
        assert_eq!(config_map.metadata.namespace.as_deref(), Some("idp"));
        assert_eq!(config_map.data.unwrap()[CONFIG_FILE_KEY], "issuer: x");
    }

    #[test]
    fn unknown_connector_type_fails() {
        let mut spec = github();
        spec.type_ = "saml".to_string();
        let resolved = [ResolvedConnector {
            spec: &spec,
            credential: String::new(),
            ldap_certs: LdapCertFiles::default(),
        }];
        assert!(build_dex_config("https://dex.example.com", &resolved).is_err());
    }
}
