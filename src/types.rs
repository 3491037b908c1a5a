//! Core types used throughout the remote cache client.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier the remote server assigns to a registered listener.
pub type ListenerId = i64;

/// Listener id of a listener the server has not registered yet.
pub const LISTENER_UNREGISTERED: ListenerId = 0;

/// Listener id meaning "no listener at all".
pub const NO_LISTENER: ListenerId = -1;

/// Address of a remote cache endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Location {
    /// Create a new location.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("location '{}' is not host:port", s)))?;
        if host.is_empty() {
            return Err(Error::Config(format!("location '{}' has no host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("location '{}' has a bad port: {}", s, e)))?;
        Ok(Self::new(host, port))
    }
}

/// Role of a remote cache region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteType {
    /// One active endpoint out of a priority-ordered failover list.
    Local,
    /// Every endpoint is a live peer; no failover.
    Cluster,
}

impl fmt::Display for RemoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteType::Local => write!(f, "local"),
            RemoteType::Cluster => write!(f, "cluster"),
        }
    }
}

/// Health of a cache layer, derived on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Connected and able to deliver.
    Alive,
    /// Disconnected or unable to deliver.
    Error,
    /// Explicitly shut down.
    Disposed,
}

impl CacheStatus {
    /// Check if the status is `Alive`.
    pub fn is_alive(&self) -> bool {
        matches!(self, CacheStatus::Alive)
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Alive => write!(f, "alive"),
            CacheStatus::Error => write!(f, "error"),
            CacheStatus::Disposed => write!(f, "disposed"),
        }
    }
}

/// Metadata carried with each element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementAttributes {
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Maximum life in seconds, `None` for no limit.
    pub max_life_secs: Option<u64>,
    /// Eternal elements never expire.
    pub is_eternal: bool,
}

impl ElementAttributes {
    /// Attributes stamped with the current time.
    pub fn new() -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            created_at_ms,
            max_life_secs: None,
            is_eternal: true,
        }
    }

    /// Limit the element's life.
    pub fn with_max_life(mut self, max_life: Duration) -> Self {
        self.max_life_secs = Some(max_life.as_secs());
        self.is_eternal = false;
        self
    }
}

impl Default for ElementAttributes {
    fn default() -> Self {
        Self::new()
    }
}

/// A cached value together with its key and region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheElement {
    /// Region the element belongs to.
    pub region: String,
    /// Element key.
    pub key: String,
    /// Element value.
    pub value: Bytes,
    /// Element metadata.
    pub attributes: Option<ElementAttributes>,
}

impl CacheElement {
    /// Create an element with fresh attributes.
    pub fn new(region: impl Into<String>, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            region: region.into(),
            key: key.into(),
            value: value.into(),
            attributes: Some(ElementAttributes::new()),
        }
    }

    /// Replace the element's attributes.
    pub fn with_attributes(mut self, attributes: Option<ElementAttributes>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Transport-neutral form of an element: the value is an opaque bincode payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedCacheElement {
    /// Region the element belongs to.
    pub region: String,
    /// Element key.
    pub key: String,
    /// Encoded value.
    pub payload: Vec<u8>,
    /// Element metadata.
    pub attributes: ElementAttributes,
}

impl SerializedCacheElement {
    /// Encode an element. Fails with `MissingAttributes` if it has no metadata.
    pub fn from_element(element: &CacheElement) -> Result<Self> {
        let attributes = element
            .attributes
            .clone()
            .ok_or_else(|| Error::MissingAttributes {
                key: element.key.clone(),
            })?;
        let payload = bincode::serialize(&element.value)?;
        Ok(Self {
            region: element.region.clone(),
            key: element.key.clone(),
            payload,
            attributes,
        })
    }

    /// Decode back into an element.
    pub fn to_element(&self) -> Result<CacheElement> {
        let value: Bytes = bincode::deserialize(&self.payload).map_err(|e| {
            Error::Unmarshal(format!("element {} in {}: {}", self.key, self.region, e))
        })?;
        Ok(CacheElement {
            region: self.region.clone(),
            key: self.key.clone(),
            value,
            attributes: Some(self.attributes.clone()),
        })
    }
}

/// An element as it crosses the remote boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEntry {
    /// Plain element.
    Raw(CacheElement),
    /// Element whose value is still encoded.
    Serialized(SerializedCacheElement),
}

impl CacheEntry {
    /// Region of the entry.
    pub fn region(&self) -> &str {
        match self {
            CacheEntry::Raw(e) => &e.region,
            CacheEntry::Serialized(e) => &e.region,
        }
    }

    /// Key of the entry.
    pub fn key(&self) -> &str {
        match self {
            CacheEntry::Raw(e) => &e.key,
            CacheEntry::Serialized(e) => &e.key,
        }
    }

    /// Check if the entry is still encoded.
    pub fn is_serialized(&self) -> bool {
        matches!(self, CacheEntry::Serialized(_))
    }

    /// Decode into a plain element if needed.
    pub fn into_element(self) -> Result<CacheElement> {
        match self {
            CacheEntry::Raw(e) => Ok(e),
            CacheEntry::Serialized(s) => s.to_element(),
        }
    }

    /// Encode into the transport-neutral form if needed.
    pub fn into_serialized(self) -> Result<SerializedCacheElement> {
        match self {
            CacheEntry::Raw(e) => SerializedCacheElement::from_element(&e),
            CacheEntry::Serialized(s) => Ok(s),
        }
    }
}

impl From<CacheElement> for CacheEntry {
    fn from(element: CacheElement) -> Self {
        CacheEntry::Raw(element)
    }
}

impl From<SerializedCacheElement> for CacheEntry {
    fn from(element: SerializedCacheElement) -> Self {
        CacheEntry::Serialized(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_parse_and_display() {
        let loc: Location = "cache-1.internal:1102".parse().unwrap();
        assert_eq!(loc, Location::new("cache-1.internal", 1102));
        assert_eq!(loc.to_string(), "cache-1.internal:1102");
    }

    #[test]
    fn test_location_parse_rejects_garbage() {
        assert!("no-port".parse::<Location>().is_err());
        assert!(":1102".parse::<Location>().is_err());
        assert!("host:notaport".parse::<Location>().is_err());
    }

    #[test]
    fn test_serialized_element_keeps_value() {
        let element = CacheElement::new("users", "u1", "Alice");
        let serialized = SerializedCacheElement::from_element(&element).unwrap();
        assert_eq!(serialized.key, "u1");
        assert_ne!(serialized.payload, b"Alice".to_vec());

        let decoded = serialized.to_element().unwrap();
        assert_eq!(decoded, element);
    }

    #[test]
    fn test_missing_attributes_cannot_serialize() {
        let element = CacheElement::new("users", "u1", "Alice").with_attributes(None);
        let err = SerializedCacheElement::from_element(&element).unwrap_err();
        assert!(matches!(err, Error::MissingAttributes { key } if key == "u1"));
    }

    #[test]
    fn test_corrupt_payload_is_unmarshal_error() {
        let element = CacheElement::new("users", "u1", "Alice");
        let mut serialized = SerializedCacheElement::from_element(&element).unwrap();
        serialized.payload.truncate(2);
        assert!(serialized.to_element().unwrap_err().is_unmarshal());
    }
}
