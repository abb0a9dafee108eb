//! Config map fingerprinting
//!
//! The fingerprint is stamped on the Dex pod template so any change to the
//! rendered configuration rolls the pods.

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::ByteString;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::cluster::ResourceStore;
use crate::Result;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Content<'a> {
    data: &'a Option<BTreeMap<String, String>>,
    binary_data: &'a Option<BTreeMap<String, ByteString>>,
}

/// Hex SHA-256 over the canonical JSON of the config map's content
///
/// Only `data` and `binaryData` take part; server-managed metadata such as
/// the resource version would otherwise change the digest on every write.
pub fn fingerprint(config_map: &ConfigMap) -> Result<String> {
    // BTreeMap keys serialize sorted, which makes the encoding canonical
    let bytes = serde_json::to_vec(&Content {
        data: &config_map.data,
        binary_data: &config_map.binary_data,
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of the named config map, or `None` if it does not exist yet
pub async fn current_fingerprint(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
) -> Result<Option<String>> {
    match store.get_config_map(namespace, name).await {
        Ok(config_map) => fingerprint(&config_map).map(Some),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
