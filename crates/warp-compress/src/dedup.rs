//! Content-addressed deduplication
//!
//! A [`DedupBackend`] replaces a buffer with a short reference when it
//! already holds identical content. The pool treats the backend as an
//! external collaborator; [`ContentStore`] is the in-process implementation
//! keyed by BLAKE3 digests.

use bytes::Bytes;
use dashmap::DashMap;

use crate::{Error, Result};

/// Length of a content reference (BLAKE3 digest)
pub const REFERENCE_LEN: usize = 32;

/// Deduplication backend
pub trait DedupBackend: Send + Sync {
    /// Return a reference if the backend already holds this content.
    ///
    /// A backend may register unseen content and return `None`, so the next
    /// identical buffer deduplicates.
    fn deduplicate(&self, buffer: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Resolve a reference back to the original bytes
    fn rehydrate(&self, reference: &[u8]) -> Result<Vec<u8>>;
}

/// In-memory content-addressed blob store
#[derive(Debug, Default)]
pub struct ContentStore {
    blobs: DashMap<[u8; REFERENCE_LEN], Bytes>,
}

impl ContentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store holds no blobs
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total bytes held across blobs
    pub fn stored_bytes(&self) -> u64 {
        self.blobs.iter().map(|b| b.value().len() as u64).sum()
    }
}

impl DedupBackend for ContentStore {
    fn deduplicate(&self, buffer: &[u8]) -> Result<Option<Vec<u8>>> {
        let digest = *blake3::hash(buffer).as_bytes();

        if self.blobs.contains_key(&digest) {
            return Ok(Some(digest.to_vec()));
        }

        self.blobs.insert(digest, Bytes::copy_from_slice(buffer));
        Ok(None)
    }

    fn rehydrate(&self, reference: &[u8]) -> Result<Vec<u8>> {
        let digest: [u8; REFERENCE_LEN] = reference
            .try_into()
            .map_err(|_| Error::Dedup(format!("reference must be {REFERENCE_LEN} bytes")))?;

        self.blobs
            .get(&digest)
            .map(|blob| blob.to_vec())
            .ok_or_else(|| Error::Dedup("unknown content reference".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sighting_registers() {
        let store = ContentStore::new();
        let data = vec![9u8; 4096];

        assert!(store.deduplicate(&data).unwrap().is_none());
        assert_eq!(store.len(), 1);

        let reference = store.deduplicate(&data).unwrap().unwrap();
        assert_eq!(reference.len(), REFERENCE_LEN);
        assert_eq!(store.rehydrate(&reference).unwrap(), data);
    }

    #[test]
    fn test_bad_reference() {
        let store = ContentStore::new();
        assert!(store.rehydrate(&[0u8; 5]).is_err());
        assert!(store.rehydrate(&[0u8; REFERENCE_LEN]).is_err());
    }

    #[test]
    fn test_stored_bytes() {
        let store = ContentStore::new();
        store.deduplicate(&[1u8; 100]).unwrap();
        store.deduplicate(&[2u8; 50]).unwrap();
        store.deduplicate(&[1u8; 100]).unwrap();
        assert_eq!(store.stored_bytes(), 150);
    }
}
