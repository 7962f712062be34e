//! Content-addressed storage for raw message part payloads.
//!
//! A blob ref is the lowercase hex SHA-256 of the payload; the same bytes
//! from any folder land in the same file, so writes are idempotent. Blobs
//! orphaned by a crash between a blob write and the matching store commit
//! are left for a separate GC worker.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("creating blob directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn put(&self, data: &[u8]) -> Result<String> {
        let digest = hex::encode(Sha256::digest(data));
        let path = self.path_for(&digest);
        if path.exists() {
            return Ok(digest);
        }

        let parent = path.parent().expect("blob path has a fan-out parent");
        fs::create_dir_all(parent)
            .with_context(|| format!("creating blob fan-out {}", parent.display()))?;

        // Write via a temp name so a partial write never occupies the ref.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).with_context(|| format!("writing blob {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("placing blob {}", path.display()))?;
        Ok(digest)
    }

    pub fn get(&self, blob_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(blob_ref);
        fs::read(&path).with_context(|| format!("reading blob {}", path.display()))
    }

    pub fn contains(&self, blob_ref: &str) -> bool {
        self.path_for(blob_ref).exists()
    }

    fn path_for(&self, blob_ref: &str) -> PathBuf {
        let (fan, rest) = blob_ref.split_at(2.min(blob_ref.len()));
        self.root.join(fan).join(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent_and_content_addressed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::open(dir.path().to_path_buf()).expect("open");

        let a = store.put(b"hello").expect("put");
        let b = store.put(b"hello").expect("put again");
        assert_eq!(a, b);
        assert!(store.contains(&a));
        assert_eq!(store.get(&a).expect("get"), b"hello");

        let c = store.put(b"other").expect("put other");
        assert_ne!(a, c);
    }
}
