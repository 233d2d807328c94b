//! Change-stream event types shared by the watch client and its consumers.

use serde::{Deserialize, Serialize};

/// Opaque resumption cursor. Only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

/// Error reported in-band by the change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchFault {
    pub code: Option<u16>,
    pub message: String,
}

impl WatchFault {
    /// The server no longer holds history for the requested cursor (HTTP 410 Gone).
    pub fn is_expired(&self) -> bool { self.code == Some(410) }
}

/// Raw event as produced by a single subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added { version: ResourceVersion, object: T },
    Modified { version: ResourceVersion, object: T },
    Deleted { version: ResourceVersion, object: T },
    /// Cursor progress without a domain object.
    Bookmark { version: ResourceVersion },
    Error(WatchFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// One-character marker used in line-oriented output.
    pub fn sigil(&self) -> char {
        match self {
            ChangeKind::Added => '+',
            ChangeKind::Modified => '~',
            ChangeKind::Deleted => '-',
        }
    }
}

/// Domain event delivered to consumers of a resilient watch.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub kind: ChangeKind,
    pub version: ResourceVersion,
    pub object: T,
}
