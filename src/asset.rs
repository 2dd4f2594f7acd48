//! Asset payloads and their cache identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::hashing::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid asset key '{0}': expected 64 lowercase hex characters")]
pub struct InvalidAssetKey(pub String);

/// Deterministic fingerprint of everything that influences a generated asset.
///
/// Always a SHA-256 digest in lowercase hex. Keys name cache files, so the
/// format is enforced on every way in, deserialization included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetKey(String);

impl AssetKey {
    pub const LEN: usize = 64;

    pub fn parse(hex: impl Into<String>) -> Result<Self, InvalidAssetKey> {
        let hex = hex.into();
        let valid = hex.len() == Self::LEN
            && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(hex))
        } else {
            Err(InvalidAssetKey(hex))
        }
    }

    /// Wrap the output of `sha256_hex`.
    pub(crate) fn from_digest(hex: String) -> Self {
        debug_assert_eq!(hex.len(), Self::LEN);
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Two-char shard prefix and the full key.
    pub(crate) fn shard(&self) -> (&str, &str) {
        (&self.0[..2], &self.0)
    }
}

impl TryFrom<String> for AssetKey {
    type Error = InvalidAssetKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AssetKey> for String {
    fn from(key: AssetKey) -> Self {
        key.0
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binary image payload. Cloning shares the underlying bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Asset {
    data: Arc<[u8]>,
    content_type: String,
}

impl Asset {
    pub fn new(data: impl Into<Arc<[u8]>>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: content_type.into(),
        }
    }

    pub fn png(data: impl Into<Arc<[u8]>>) -> Self {
        Self::new(data, "image/png")
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sha256(&self) -> String {
        sha256_hex(&self.data)
    }

    /// File extension matching the content type.
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("content_type", &self.content_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A cache entry. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAsset {
    pub key: AssetKey,
    pub asset: Asset,
    pub created_at: DateTime<Utc>,
}

impl CachedAsset {
    pub fn generated(key: AssetKey, asset: Asset) -> Self {
        Self {
            key,
            asset,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_clone_shares_bytes() {
        let a = Asset::png(vec![1u8, 2, 3]);
        let b = a.clone();
        assert_eq!(a, b);
        assert!(std::ptr::eq(a.bytes().as_ptr(), b.bytes().as_ptr()));
    }

    #[test]
    fn test_extension_from_content_type() {
        assert_eq!(Asset::png(vec![0u8]).extension(), "png");
        assert_eq!(Asset::new(vec![0u8], "image/jpeg").extension(), "jpg");
    }

    #[test]
    fn test_key_short() {
        let key = AssetKey::parse("0123456789abcdef".repeat(4)).unwrap();
        assert_eq!(key.short(), "0123456789ab");
        assert_eq!(key.shard().0, "01");
    }

    #[test]
    fn test_key_rejects_non_digests() {
        for bad in [
            String::new(),
            "ab".to_string(),
            "../../etc/passwd".to_string(),
            format!("../{}", "a".repeat(61)),
            "AB".repeat(32),
            "zz".repeat(32),
            "é".repeat(32),
            "ab".repeat(33),
        ] {
            assert_eq!(AssetKey::parse(bad.clone()), Err(InvalidAssetKey(bad)));
        }
        assert!(AssetKey::parse("ab".repeat(32)).is_ok());
    }

    #[test]
    fn test_key_deserialize_validates() {
        let ok: AssetKey = serde_json::from_str(&format!("\"{}\"", "cd".repeat(32))).unwrap();
        assert_eq!(ok.as_str(), "cd".repeat(32));
        assert!(serde_json::from_str::<AssetKey>("\"../escape\"").is_err());
        assert_eq!(serde_json::to_string(&ok).unwrap(), format!("\"{}\"", "cd".repeat(32)));
    }
}
