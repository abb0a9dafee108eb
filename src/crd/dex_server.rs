//! DexServer Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Condition type summarising the outcome of a convergence pass
pub const CONDITION_TYPE_APPLIED: &str = "Applied";

/// DexServer resource specification
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "auth.identitatem.io",
    version = "v1alpha1",
    kind = "DexServer",
    plural = "dexservers",
    singular = "dexserver",
    namespaced,
    status = "DexServerStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Issuer", "type": "string", "jsonPath": ".spec.issuer"}"#,
    printcolumn = r#"{"name": "Applied", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DexServerSpec {
    /// Issuer URL advertised by the Dex server; its host is exposed through the ingress
    pub issuer: String,

    /// Upstream identity provider connectors, rendered in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connectors: Vec<ConnectorSpec>,

    /// Secret holding the certificate served by the ingress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_certificate_ref: Option<LocalObjectRef>,
}

/// Reference to an object in the DexServer namespace
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct LocalObjectRef {
    /// Object name
    pub name: String,
}

/// Reference to a Secret, defaulting to the DexServer namespace
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Secret namespace (defaults to the DexServer namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretRef {
    /// Namespace the secret lives in, given the owning DexServer namespace
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => default,
        }
    }
}

/// A connector entry as written by the user
///
/// `type` selects which of the per-provider sections is used; use
/// [`ConnectorSpec::kind`] to obtain the checked variant.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorSpec {
    /// Connector type (github, microsoft, ldap)
    #[serde(rename = "type")]
    pub type_: String,

    /// Connector identifier, unique within the DexServer
    pub id: String,

    /// Display name shown on the login page
    #[serde(default)]
    pub name: String,

    /// GitHub OAuth2 settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github: Option<GitHubConnector>,

    /// Microsoft OAuth2 settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub microsoft: Option<MicrosoftConnector>,

    /// LDAP settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ldap: Option<LdapConnector>,
}

/// Checked connector variant
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Connector<'a> {
    GitHub(&'a GitHubConnector),
    Microsoft(&'a MicrosoftConnector),
    Ldap(&'a LdapConnector),
}

impl ConnectorSpec {
    /// Resolve the type tag into its settings section
    pub fn kind(&self) -> Result<Connector<'_>> {
        let missing = |section: &str| {
            Error::ValidationError(format!(
                "connector {} has type {} but no {} section",
                self.id, self.type_, section
            ))
        };
        match self.type_.as_str() {
            "github" => self
                .github
                .as_ref()
                .map(Connector::GitHub)
                .ok_or_else(|| missing("github")),
            "microsoft" => self
                .microsoft
                .as_ref()
                .map(Connector::Microsoft)
                .ok_or_else(|| missing("microsoft")),
            "ldap" => self
                .ldap
                .as_ref()
                .map(Connector::Ldap)
                .ok_or_else(|| missing("ldap")),
            other => Err(Error::ValidationError(format!(
                "connector {} has unknown type {:?}",
                self.id, other
            ))),
        }
    }
}

impl Connector<'_> {
    /// Type tag as understood by Dex
    pub fn type_name(&self) -> &'static str {
        match self {
            Connector::GitHub(_) => "github",
            Connector::Microsoft(_) => "microsoft",
            Connector::Ldap(_) => "ldap",
        }
    }

    /// Secret and key holding this connector's credential
    pub fn credential_ref(&self) -> (&SecretRef, &'static str) {
        match self {
            Connector::GitHub(github) => (&github.client_secret_ref, "clientSecret"),
            Connector::Microsoft(microsoft) => (&microsoft.client_secret_ref, "clientSecret"),
            Connector::Ldap(ldap) => (&ldap.bind_pw_ref, "bindPW"),
        }
    }
}

/// GitHub OAuth2 connector
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct GitHubConnector {
    /// OAuth2 client ID
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Secret holding the client secret under `clientSecret`
    #[serde(rename = "clientSecretRef")]
    pub client_secret_ref: SecretRef,
    /// OAuth2 callback URL
    #[serde(rename = "redirectURI")]
    pub redirect_uri: String,
    /// Restrict logins to members of this organization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    /// Restrict logins to members of these organizations and teams
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orgs: Vec<Org>,
}

/// GitHub organization filter
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Org {
    /// Organization name
    pub name: String,
    /// Team names within the organization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teams: Vec<String>,
}

/// Microsoft OAuth2 connector
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct MicrosoftConnector {
    /// OAuth2 client ID
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Secret holding the client secret under `clientSecret`
    #[serde(rename = "clientSecretRef")]
    pub client_secret_ref: SecretRef,
    /// OAuth2 callback URL
    #[serde(rename = "redirectURI")]
    pub redirect_uri: String,
    /// Azure AD tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// LDAP connector
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct LdapConnector {
    /// Host and optional port of the LDAP server
    pub host: String,
    /// Connect without TLS
    #[serde(default, rename = "insecureNoSSL")]
    pub insecure_no_ssl: bool,
    /// Skip server certificate verification
    #[serde(default, rename = "insecureSkipVerify")]
    pub insecure_skip_verify: bool,
    /// Upgrade the connection with StartTLS
    #[serde(default, rename = "startTLS")]
    pub start_tls: bool,
    /// Secret with `ca.crt`, and optionally `tls.crt`/`tls.key` for client auth
    #[serde(default, rename = "rootCARef", skip_serializing_if = "Option::is_none")]
    pub root_ca_ref: Option<SecretRef>,
    /// Bind DN for the search user
    #[serde(rename = "bindDN")]
    pub bind_dn: String,
    /// Secret holding the bind password under `bindPW`
    #[serde(rename = "bindPWRef")]
    pub bind_pw_ref: SecretRef,
    /// Label of the username field on the login form
    #[serde(default, rename = "usernamePrompt", skip_serializing_if = "Option::is_none")]
    pub username_prompt: Option<String>,
    /// How users are located
    #[serde(default, rename = "userSearch", skip_serializing_if = "Option::is_none")]
    pub user_search: Option<UserSearch>,
    /// How group membership is located
    #[serde(default, rename = "groupSearch", skip_serializing_if = "Option::is_none")]
    pub group_search: Option<GroupSearch>,
}

/// LDAP user search
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UserSearch {
    #[serde(rename = "baseDN")]
    pub base_dn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(default, rename = "idAttr", skip_serializing_if = "String::is_empty")]
    pub id_attr: String,
    #[serde(default, rename = "emailAttr", skip_serializing_if = "String::is_empty")]
    pub email_attr: String,
    #[serde(default, rename = "nameAttr", skip_serializing_if = "String::is_empty")]
    pub name_attr: String,
}

/// LDAP group search
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct GroupSearch {
    #[serde(rename = "baseDN")]
    pub base_dn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(default, rename = "userMatchers", skip_serializing_if = "Vec::is_empty")]
    pub user_matchers: Vec<UserMatcher>,
    #[serde(default, rename = "nameAttr", skip_serializing_if = "String::is_empty")]
    pub name_attr: String,
}

/// Attribute pair joining a user entry to a group entry
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UserMatcher {
    #[serde(rename = "userAttr")]
    pub user_attr: String,
    #[serde(rename = "groupAttr")]
    pub group_attr: String,
}

/// DexServer status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DexServerStatus {
    /// Status conditions, at most one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Resources created for this DexServer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_objects: Vec<RelatedObjectReference>,
}

/// Status condition
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Machine-readable reason code
    pub reason: String,

    /// Human-readable message
    pub message: String,
}

impl Condition {
    /// Build a condition stamped with the current time
    pub fn new(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Utc::now(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    /// True when the status is "True"
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Reference to a resource derived from a DexServer
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelatedObjectReference {
    /// API group ("" for core)
    #[serde(default)]
    pub group: String,
    /// Resource kind
    pub kind: String,
    /// Resource name
    pub name: String,
    /// Resource namespace (empty for cluster-scoped kinds)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}
