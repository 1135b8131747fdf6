//! # Key/Record Type Definitions
//!
//! Value types exchanged between the driver and cluster nodes.
//!
//! ## Design Principles
//!
//! 1. **Validated Construction**: `Key::new` enforces component limits once,
//!    so every `Key` in flight is known to be encodable.
//! 2. **Canonical Encoding**: `Key::wire_bytes` is the only encoding nodes
//!    see; nodes never parse keys, they store by these bytes.
//! 3. **Opaque Bins**: bin values are `serde_json::Value`s. Encoding bin data
//!    types is the job of whoever builds the record.
//! 4. **Stable Placement**: `Key::placement_hash` uses fixed seeds so every
//!    thread of a process maps a key to the same node.
//!
//! ## Wire Layout
//!
//! ```text
//! Key::wire_bytes():
//! +-----------+-----+-----+-----+-----+-------------------+
//! | namespace | 0x1F| set | 0x1F| tag | user key payload  |
//! +-----------+-----+-----+-----+-----+-------------------+
//! tag: b'i' (i64 big endian), b's' (utf-8), b'b' (raw bytes)
//! ```

use std::collections::BTreeMap;
use std::fmt;

use ahash::RandomState;
use serde::{Deserialize, Serialize};

use crate::error::{CkvError, CkvResult};

/// Maximum namespace length in bytes.
pub const MAX_NAMESPACE_LEN: usize = 31;

/// Maximum set name length in bytes.
pub const MAX_SET_LEN: usize = 63;

/// Maximum user key length in bytes (string and blob keys).
pub const MAX_USER_KEY_LEN: usize = 1024;

/// Separator between key components on the wire.
const SEPARATOR: u8 = 0x1f;

// Fixed seeds keep placement identical across threads and client instances.
const PLACEMENT_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// User-supplied part of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl KeyValue {
    fn payload_len(&self) -> usize {
        match self {
            KeyValue::Int(_) => 8,
            KeyValue::Str(value) => value.len(),
            KeyValue::Bytes(value) => value.len(),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Int(value as i64)
    }
}

impl From<u32> for KeyValue {
    fn from(value: u32) -> Self {
        KeyValue::Int(value as i64)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Str(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Str(value)
    }
}

impl From<Vec<u8>> for KeyValue {
    fn from(value: Vec<u8>) -> Self {
        KeyValue::Bytes(value)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(value) => write!(f, "{}", value),
            KeyValue::Str(value) => write!(f, "{:?}", value),
            KeyValue::Bytes(value) => write!(f, "<{} bytes>", value.len()),
        }
    }
}

/// Record address: namespace, set, and user key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    namespace: String,
    set: String,
    user_key: KeyValue,
}

impl Key {
    /// Creates a key after validating every component.
    ///
    /// # Errors
    /// Returns `CkvError::NamespaceEmpty`, `NamespaceTooLong`, `SetTooLong`,
    /// `KeyTooLong` or `ReservedByte` when a component is out of bounds.
    ///
    /// # Examples
    /// ```rust
    /// use ckv_common::{CkvError, Key};
    ///
    /// let key = Key::new("test", "users", "alice").expect("valid key");
    /// assert_eq!(key.namespace(), "test");
    ///
    /// assert_eq!(Key::new("", "users", 1), Err(CkvError::NamespaceEmpty));
    /// ```
    pub fn new(
        namespace: impl Into<String>,
        set: impl Into<String>,
        user_key: impl Into<KeyValue>,
    ) -> CkvResult<Self> {
        let namespace = namespace.into();
        let set = set.into();
        let user_key = user_key.into();

        if namespace.is_empty() {
            return Err(CkvError::NamespaceEmpty);
        }
        if namespace.len() > MAX_NAMESPACE_LEN {
            return Err(CkvError::NamespaceTooLong {
                max: MAX_NAMESPACE_LEN,
            });
        }
        if set.len() > MAX_SET_LEN {
            return Err(CkvError::SetTooLong { max: MAX_SET_LEN });
        }
        if user_key.payload_len() > MAX_USER_KEY_LEN {
            return Err(CkvError::KeyTooLong {
                max: MAX_USER_KEY_LEN,
            });
        }
        if namespace.as_bytes().contains(&SEPARATOR) || set.as_bytes().contains(&SEPARATOR) {
            return Err(CkvError::ReservedByte);
        }

        Ok(Key {
            namespace,
            set,
            user_key,
        })
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[inline]
    pub fn set(&self) -> &str {
        &self.set
    }

    #[inline]
    pub fn user_key(&self) -> &KeyValue {
        &self.user_key
    }

    /// Canonical encoding sent to nodes.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.namespace.len() + self.set.len() + self.user_key.payload_len() + 3,
        );
        out.extend_from_slice(self.namespace.as_bytes());
        out.push(SEPARATOR);
        out.extend_from_slice(self.set.as_bytes());
        out.push(SEPARATOR);
        match &self.user_key {
            KeyValue::Int(value) => {
                out.push(b'i');
                out.extend_from_slice(&value.to_be_bytes());
            }
            KeyValue::Str(value) => {
                out.push(b's');
                out.extend_from_slice(value.as_bytes());
            }
            KeyValue::Bytes(value) => {
                out.push(b'b');
                out.extend_from_slice(value);
            }
        }
        out
    }

    /// Deterministic 64-bit hash used to pick the owning node.
    pub fn placement_hash(&self) -> u64 {
        let [k0, k1, k2, k3] = PLACEMENT_SEEDS;
        RandomState::with_seeds(k0, k1, k2, k3).hash_one(self.wire_bytes())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.set, self.user_key)
    }
}

/// Bin name to opaque value.
pub type Bins = BTreeMap<String, serde_json::Value>;

/// Record metadata without bin data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Write counter maintained by the node.
    pub generation: u32,
    /// Remaining lifetime in seconds, 0 means no expiration.
    pub ttl: u32,
}

/// Record snapshot as returned by a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub bins: Bins,
    #[serde(default)]
    pub generation: u32,
    #[serde(default)]
    pub ttl: u32,
}

impl Record {
    /// Creates a record carrying bins and zeroed metadata.
    pub fn new(bins: Bins) -> Self {
        Record {
            bins,
            generation: 0,
            ttl: 0,
        }
    }

    /// Creates a metadata-only record (used by exists lookups).
    pub fn from_meta(meta: RecordMeta) -> Self {
        Record {
            bins: Bins::new(),
            generation: meta.generation,
            ttl: meta.ttl,
        }
    }

    #[inline]
    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            generation: self.generation,
            ttl: self.ttl,
        }
    }

    /// Returns a copy keeping only the named bins.
    pub fn project(&self, names: &[String]) -> Record {
        let bins = self
            .bins
            .iter()
            .filter(|(name, _)| names.iter().any(|wanted| wanted == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Record {
            bins,
            generation: self.generation,
            ttl: self.ttl,
        }
    }

    /// Encodes the record as the JSON payload nodes exchange.
    pub fn to_json(&self) -> CkvResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a JSON payload produced by `to_json`.
    pub fn from_json(data: &[u8]) -> CkvResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl RecordMeta {
    pub fn to_json(&self) -> CkvResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> CkvResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Read-only snapshot of one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterNode {
    /// Stable node id: 16 uppercase hexadecimal characters.
    pub name: String,
    /// Address the client reaches the node at, `host:port`.
    pub address: String,
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_creation() {
        let key = Key::new("test", "demo", 42).unwrap();
        assert_eq!(key.namespace(), "test");
        assert_eq!(key.set(), "demo");
        assert_eq!(key.user_key(), &KeyValue::Int(42));
        assert_eq!(key.to_string(), "test:demo:42");
    }

    #[test]
    fn test_key_limits() {
        assert_eq!(Key::new("", "demo", 1), Err(CkvError::NamespaceEmpty));

        let long_ns = "n".repeat(MAX_NAMESPACE_LEN + 1);
        assert!(matches!(
            Key::new(long_ns, "demo", 1),
            Err(CkvError::NamespaceTooLong { .. })
        ));

        let long_set = "s".repeat(MAX_SET_LEN + 1);
        assert!(matches!(
            Key::new("test", long_set, 1),
            Err(CkvError::SetTooLong { .. })
        ));

        let max_key = "k".repeat(MAX_USER_KEY_LEN);
        assert!(Key::new("test", "demo", max_key).is_ok());
        let long_key = vec![0u8; MAX_USER_KEY_LEN + 1];
        assert!(matches!(
            Key::new("test", "demo", long_key),
            Err(CkvError::KeyTooLong { .. })
        ));

        assert_eq!(Key::new("te\x1fst", "demo", 1), Err(CkvError::ReservedByte));
    }

    #[test]
    fn test_wire_bytes_distinguish_key_types() {
        let int_key = Key::new("test", "demo", 1).unwrap();
        let str_key = Key::new("test", "demo", "1").unwrap();
        assert_ne!(int_key.wire_bytes(), str_key.wire_bytes());
        assert_eq!(&str_key.wire_bytes(), b"test\x1fdemo\x1fs1");
    }

    #[test]
    fn test_placement_hash_is_stable() {
        let a = Key::new("test", "demo", "alice").unwrap();
        let b = Key::new("test", "demo", "alice").unwrap();
        assert_eq!(a.placement_hash(), b.placement_hash());
    }

    #[test]
    fn test_record_projection_and_meta() {
        let mut bins = Bins::new();
        bins.insert("name".to_string(), json!("alice"));
        bins.insert("age".to_string(), json!(31));
        let record = Record {
            bins,
            generation: 3,
            ttl: 60,
        };

        let projected = record.project(&["age".to_string()]);
        assert_eq!(projected.bins.len(), 1);
        assert_eq!(projected.bins["age"], json!(31));
        assert_eq!(projected.meta(), RecordMeta { generation: 3, ttl: 60 });

        let decoded = Record::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_decode_error() {
        assert!(matches!(Record::from_json(b"{"), Err(CkvError::Decode(_))));
    }
}
