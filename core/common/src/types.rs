//! Common types used throughout tokenvault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// String metadata attached to a sealed record.
pub type Metadata = BTreeMap<String, String>;

/// Identifier of a tokenized payload, unique across all providers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    /// Create a new TokenId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "TokenId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag naming one storage provider (e.g. "aws", "azure", "gcp").
///
/// The well-known cloud tags are available as constants; any other
/// non-empty tag can be created with [`ProviderId::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(Cow<'static, str>);

impl ProviderId {
    pub const AWS: ProviderId = ProviderId(Cow::Borrowed("aws"));
    pub const AZURE: ProviderId = ProviderId(Cow::Borrowed("azure"));
    pub const GCP: ProviderId = ProviderId(Cow::Borrowed("gcp"));

    /// Create a provider tag.
    ///
    /// # Errors
    /// - Returns error if the tag is empty or contains whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid provider id: '{}'",
                id
            )));
        }
        Ok(Self(Cow::Owned(id)))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encrypted payload plus metadata, as produced by the encryption layer.
///
/// The ciphertext is opaque here. Only the metadata map may change after
/// creation, and only when divergent copies are merged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedRecord {
    /// Logical identity of the record across providers.
    pub token_id: TokenId,
    /// Encrypted payload.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// IV / nonce used by the encryption layer.
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Algorithm identifier (e.g. "AES-256-GCM").
    pub algorithm: String,
    /// Time the record was sealed; drives last-writer-wins.
    pub timestamp: DateTime<Utc>,
    /// Free-form string metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl SealedRecord {
    /// Create a record sealed now with empty metadata.
    pub fn new(
        token_id: TokenId,
        ciphertext: Vec<u8>,
        nonce: Vec<u8>,
        algorithm: impl Into<String>,
    ) -> Self {
        Self {
            token_id,
            ciphertext,
            nonce,
            algorithm: algorithm.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    /// Override the seal timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Debug for SealedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedRecord")
            .field("token_id", &self.token_id)
            .field("ciphertext", &format_args!("[{} bytes]", self.ciphertext.len()))
            .field("nonce", &format_args!("[{} bytes]", self.nonce.len()))
            .field("algorithm", &self.algorithm)
            .field("timestamp", &self.timestamp)
            .field("metadata", &self.metadata)
            .finish()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_id_creation() {
        let id = TokenId::new("tok_123").unwrap();
        assert_eq!(id.as_str(), "tok_123");
    }

    #[test]
    fn test_token_id_empty_fails() {
        assert!(TokenId::new("").is_err());
    }

    #[test]
    fn test_provider_id_constants() {
        assert_eq!(ProviderId::AWS.as_str(), "aws");
        assert_eq!(ProviderId::new("aws").unwrap(), ProviderId::AWS);
        assert!(ProviderId::new("").is_err());
        assert!(ProviderId::new("a b").is_err());
    }

    #[test]
    fn test_sealed_record_json_uses_base64() {
        let record = SealedRecord::new(
            TokenId::new("tok_1").unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef],
            vec![1, 2, 3],
            "AES-256-GCM",
        )
        .with_metadata("merchant", "m-42");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ciphertext"], "3q2+7w==");
        assert_eq!(json["token_id"], "tok_1");

        let restored = SealedRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_sealed_record_debug_hides_payload() {
        let record = SealedRecord::new(
            TokenId::new("tok_1").unwrap(),
            vec![42; 16],
            vec![7; 12],
            "AES-256-GCM",
        );
        let debug = format!("{:?}", record);
        assert!(debug.contains("[16 bytes]"));
        assert!(!debug.contains("42, 42"));
    }
}
