//! Strong type definitions for driftsync.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Maximum length of a collection name.
pub const MAX_COLLECTION_LEN: usize = 64;

/// Name of a logical collection (e.g. `"diaries"`).
///
/// Keys are unique within a collection, and the scheduler never runs two
/// tasks for the same collection at once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Collection(String);

impl Collection {
    /// Create a collection name, validating its characters and length.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_COLLECTION_LEN {
            return Err(CoreError::InvalidCollection(name));
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(CoreError::InvalidCollection(name));
        }
        Ok(Self(name))
    }

    /// The collection name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Collection {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Collection {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Collection> for String {
    fn from(c: Collection) -> Self {
        c.0
    }
}

/// Version assigned to a change by its origin store at write time.
///
/// Versions are Lamport-style: a store never hands out a version lower than
/// one it has already observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// The version preceding every real write.
    pub const ZERO: Self = Self(0);

    /// The next version after this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The store that produced a change.
///
/// Variant order matches the lexicographic order of the names (`"local"` <
/// `"remote"`), which is the tie-breaker of the conflict rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
        }
    }

    /// Parse the lowercase name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Origin::Local),
            "remote" => Some(Origin::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 32-byte identifier for one direction of a bound adapter pair.
///
/// Derived from Blake3(collection || source || destination), so the pull and
/// push halves of the same collection never share a marker slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairId(pub [u8; 32]);

impl PairId {
    /// Derive the pair ID for changes flowing from `source` to `destination`.
    pub fn derive(collection: &Collection, source: Origin, destination: Origin) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"driftsync-pair-v0:");
        hasher.update(collection.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(source.as_str().as_bytes());
        hasher.update(b"->");
        hasher.update(destination.as_str().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Opaque cursor: every change up to and including this position of the
/// source store's change log has been applied on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncMarker {
    position: u64,
}

impl SyncMarker {
    /// Marker covering the change log up to `position`.
    pub const fn at(position: u64) -> Self {
        Self { position }
    }

    /// The change-log position this marker covers.
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Encode for persistence (CBOR).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail for a plain struct.
        let _ = ciborium::into_writer(self, &mut buf);
        buf
    }

    /// Decode a persisted marker.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

impl fmt::Display for SyncMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.position)
    }
}

/// Which way a task moves changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
    /// Pull, then push.
    Bidirectional,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
            Direction::Bidirectional => "bidirectional",
        })
    }
}

/// Priority tier of a task. Higher tiers are admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Background,
    #[default]
    Normal,
    Interactive,
}

/// Retry class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Timeouts and transport errors: exponential backoff.
    Transient,
    /// Quota or capacity exceeded: longer, linearly growing delay.
    Capacity,
    /// Malformed payloads, authorization rejections: never retried.
    Fatal,
}

impl ErrorClass {
    /// Whether the scheduler may retry this class at all.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Fatal)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Capacity => "capacity",
            ErrorClass::Fatal => "fatal",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_validation() {
        assert!(Collection::new("diaries").is_ok());
        assert!(Collection::new("user.profile-v2_x").is_ok());
        assert!(Collection::new("").is_err());
        assert!(Collection::new("has space").is_err());
        assert!(Collection::new("a".repeat(MAX_COLLECTION_LEN + 1)).is_err());
    }

    #[test]
    fn test_collection_serde_rejects_invalid() {
        let ok: Collection = serde_json::from_str("\"diaries\"").unwrap();
        assert_eq!(ok.as_str(), "diaries");
        assert!(serde_json::from_str::<Collection>("\"bad name\"").is_err());
    }

    #[test]
    fn test_origin_order_is_lexicographic() {
        assert!(Origin::Local < Origin::Remote);
        assert!(Origin::Local.as_str() < Origin::Remote.as_str());
        assert_eq!(Origin::parse("remote"), Some(Origin::Remote));
        assert_eq!(Origin::parse("cloud"), None);
    }

    #[test]
    fn test_pair_id_distinguishes_direction() {
        let c = Collection::new("diaries").unwrap();
        let pull = PairId::derive(&c, Origin::Remote, Origin::Local);
        let push = PairId::derive(&c, Origin::Local, Origin::Remote);
        assert_ne!(pull, push);
        assert_eq!(pull, PairId::derive(&c, Origin::Remote, Origin::Local));
        assert_eq!(PairId::from_hex(&pull.to_hex()).unwrap(), pull);
    }

    #[test]
    fn test_marker_bytes() {
        let marker = SyncMarker::at(42);
        let decoded = SyncMarker::from_bytes(&marker.to_bytes()).unwrap();
        assert_eq!(decoded.position(), 42);
        assert!(SyncMarker::from_bytes(&[0xff, 0x00]).is_err());
    }

    #[test]
    fn test_only_fatal_is_final() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::Capacity.is_retryable());
        assert!(!ErrorClass::Fatal.is_retryable());
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Interactive > Priority::Normal);
        assert!(Priority::Normal > Priority::Background);
    }
}
