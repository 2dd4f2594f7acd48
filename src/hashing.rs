//! Hashing System - SHA-256 Fingerprints
//!
//! Asset keys are digests of a versioned, key-sorted JSON fingerprint.
//! Two briefs that differ only in field order hash the same.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::asset::AssetKey;
use crate::campaign::AspectRatio;

/// Bumped whenever the fingerprint layout changes; old cache entries then miss.
pub const KEY_SCHEMA_VERSION: &str = "2";

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut tree = serde_json::to_value(value)?;
    sort_keys(&mut tree);
    serde_json::to_string(&tree)
}

fn sort_keys(tree: &mut Value) {
    match tree {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (name, mut child) in entries {
                sort_keys(&mut child);
                map.insert(name, child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sort_keys),
        _ => {}
    }
}

/// Every parameter that influences what the generation service would produce.
///
/// `locale` is `None` unless the key policy makes locales generate separately.
/// `request` is the payload the request builder made for the cell, so any
/// brief field a builder reads reaches the key.
#[derive(Debug, Clone, Serialize)]
pub struct Fingerprint<'a> {
    pub campaign_id: &'a str,
    pub product_id: &'a str,
    pub product_name: &'a str,
    pub product_category: &'a str,
    pub aspect_ratio: AspectRatio,
    pub campaign_message: &'a str,
    pub campaign_parameters: &'a BTreeMap<String, Value>,
    pub creative: &'a BTreeMap<String, Value>,
    pub generator_profile: &'a str,
    pub locale: Option<&'a str>,
    pub request: &'a Value,
}

/// asset_key = sha256(schema_version + ":" + canonical_fingerprint)
pub fn compute_asset_key(fingerprint: &Fingerprint<'_>) -> Result<AssetKey, serde_json::Error> {
    let canonical = canonical_json(fingerprint)?;
    let combined = format!("{}:{}", KEY_SCHEMA_VERSION, canonical);
    Ok(AssetKey::from_digest(sha256_hex(combined.as_bytes())))
}
