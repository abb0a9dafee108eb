//! Connector credential secret utilities

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::cluster::ResourceStore;
use crate::crd::SecretRef;
use crate::{Error, Result};

/// Label marking secrets referenced by a connector so the secret watch can select them
pub const IDP_CREDENTIAL_LABEL: &str = "auth.identitatem.io/idp-credential";

/// Fetch a referenced secret and make sure it carries the credential label
///
/// Labelling is best effort: a failed update is logged and the secret is
/// still returned.
pub async fn fetch_credential_secret(
    store: &dyn ResourceStore,
    secret_ref: &SecretRef,
    default_namespace: &str,
) -> Result<Secret> {
    let namespace = secret_ref.namespace_or(default_namespace);
    let secret = store.get_secret(namespace, &secret_ref.name).await?;

    if let Some(labelled) = with_credential_label(&secret) {
        debug!(
            "Labelling credential secret {}/{}",
            namespace, secret_ref.name
        );
        if let Err(e) = store.update_secret(&labelled).await {
            warn!(
                "Failed to label credential secret {}/{}: {}",
                namespace, secret_ref.name, e
            );
        }
    }

    Ok(secret)
}

/// Copy of `secret` with the credential label added, or `None` if already labelled
pub fn with_credential_label(secret: &Secret) -> Option<Secret> {
    if secret.labels().contains_key(IDP_CREDENTIAL_LABEL) {
        return None;
    }
    let mut labelled = secret.clone();
    labelled
        .labels_mut()
        .insert(IDP_CREDENTIAL_LABEL.to_string(), String::new());
    Some(labelled)
}

/// True when the secret holds a non-empty value under `key`
pub fn has_key(secret: &Secret, key: &str) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .is_some_and(|value| !value.0.is_empty())
}

/// Get a specific key from a secret
pub fn get_secret_key(secret: &Secret, key: &str) -> Result<String> {
    let name = secret.name_any();
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| Error::SecretError(format!("Secret {} has no data", name)))?;

    let value = data.get(key).ok_or_else(|| {
        Error::SecretError(format!("Key '{}' not found in secret {}", key, name))
    })?;

    String::from_utf8(value.0.clone()).map_err(|e| {
        Error::SecretError(format!(
            "Invalid UTF-8 in secret {} key '{}': {}",
            name, key, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockResourceStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(labels: Option<BTreeMap<String, String>>) -> Secret {
        let mut data = BTreeMap::new();
        data.insert("clientSecret".to_string(), ByteString(b"s3cr3t".to_vec()));
        data.insert("empty".to_string(), ByteString(Vec::new()));
        Secret {
            metadata: ObjectMeta {
                name: Some("github-client-secret".to_string()),
                namespace: Some("idp".to_string()),
                labels,
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    fn secret_ref() -> SecretRef {
        SecretRef {
            name: "github-client-secret".to_string(),
            namespace: None,
        }
    }

    #[test]
    fn reads_key_values() {
        let secret = secret(None);
        assert_eq!(get_secret_key(&secret, "clientSecret").unwrap(), "s3cr3t");
        assert!(matches!(
            get_secret_key(&secret, "bindPW").unwrap_err(),
            Error::SecretError(_)
        ));
        assert!(has_key(&secret, "clientSecret"));
        assert!(!has_key(&secret, "empty"));
        assert!(!has_key(&secret, "tls.crt"));
    }

    #[test]
    fn label_is_added_without_touching_others() {
        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), "identity".to_string());
        let labelled = with_credential_label(&secret(Some(labels))).unwrap();
        let labels = labelled.metadata.labels.unwrap();
        assert_eq!(labels["team"], "identity");
        assert_eq!(labels[IDP_CREDENTIAL_LABEL], "");
    }

    #[test]
    fn labelled_secret_needs_no_update() {
        let mut labels = BTreeMap::new();
        labels.insert(IDP_CREDENTIAL_LABEL.to_string(), String::new());
        assert!(with_credential_label(&secret(Some(labels))).is_none());
    }

    #[tokio::test]
    async fn fetch_labels_unlabelled_secret_once() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_secret()
            .withf(|ns, name| ns == "idp" && name == "github-client-secret")
            .returning(|_, _| Ok(secret(None)));
        store
            .expect_update_secret()
            .withf(|s| s.labels().contains_key(IDP_CREDENTIAL_LABEL))
            .times(1)
            .returning(|s| Ok(s.clone()));

        let fetched = fetch_credential_secret(&store, &secret_ref(), "idp")
            .await
            .unwrap();
        assert_eq!(get_secret_key(&fetched, "clientSecret").unwrap(), "s3cr3t");
    }

    #[tokio::test]
    async fn label_failure_is_not_fatal() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_secret()
            .returning(|_, _| Ok(secret(None)));
        store
            .expect_update_secret()
            .returning(|_| Err(Error::Conflict("stale".to_string())));

        assert!(fetch_credential_secret(&store, &secret_ref(), "idp")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_secret()
            .returning(|ns, name| Err(Error::NotFound(format!("secret {}/{}", ns, name))));
        store.expect_update_secret().never();

        let err = fetch_credential_secret(&store, &secret_ref(), "idp")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
