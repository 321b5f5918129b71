//! Snapshot inputs
//!
//! Snapshot contents are opaque here. An isolate booting from a snapshot
//! hands the three buffers to the installed [`Deserializer`].

use crate::isolate::Isolate;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {0} is empty")]
    Empty(&'static str),

    #[error("snapshot rejected: {0}")]
    Rejected(String),
}

/// An opaque snapshot buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotData {
    bytes: Arc<[u8]>,
}

impl SnapshotData {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hex SHA-256 of the contents, for logging
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

/// The three snapshots an isolate boots from
#[derive(Debug, Clone, Copy)]
pub struct SnapshotSet<'a> {
    pub startup: &'a SnapshotData,
    pub read_only: &'a SnapshotData,
    pub shared: &'a SnapshotData,
    pub can_rehash: bool,
}

/// Fills a freshly initialized isolate from snapshots
pub trait Deserializer: Send + Sync {
    fn deserialize_into(&self, isolate: &Isolate, snapshots: SnapshotSet<'_>) -> Result<(), SnapshotError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable() {
        let a = SnapshotData::new(vec![1u8, 2, 3]);
        let b = SnapshotData::new(vec![1u8, 2, 3]);
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
        assert_eq!(a.len(), 3);
        assert!(SnapshotData::new(Vec::new()).is_empty());
    }
}
