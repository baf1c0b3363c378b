//! In-memory blob cache.

use crate::BlobCache;
use parking_lot::RwLock;
use quorumstate_types::Hash;
use std::collections::HashMap;
use std::sync::Arc;

/// [`BlobCache`] backed by a shared hash map.
#[derive(Debug, Default)]
pub struct MemoryBlobCache {
    blobs: RwLock<HashMap<Hash, Arc<Vec<u8>>>>,
}

impl MemoryBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobCache for MemoryBlobCache {
    fn has_blob(&self, hash: &Hash) -> bool {
        self.blobs.read().contains_key(hash)
    }

    fn get_blob(&self, hash: &Hash) -> Option<Arc<Vec<u8>>> {
        self.blobs.read().get(hash).cloned()
    }

    fn put_blob(&self, data: Vec<u8>) -> Hash {
        let hash = Hash::from_bytes(&data);
        self.blobs.write().entry(hash).or_insert_with(|| Arc::new(data));
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_is_content_addressed() {
        let cache = MemoryBlobCache::new();
        let hash = cache.put_blob(b"program".to_vec());
        assert_eq!(hash, Hash::from_bytes(b"program"));
        assert!(cache.has_blob(&hash));
        assert_eq!(cache.put_blob(b"program".to_vec()), hash);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_blob(&hash).unwrap().as_slice(), b"program");
        assert!(cache.get_blob(&Hash::ZERO).is_none());
    }
}
