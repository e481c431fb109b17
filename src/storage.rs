//! Content-addressed blob storage for OCI layers.
//!
//! Layers pulled from a registry land here before flattening. Storing by
//! digest gives two properties the pipeline relies on:
//!
//! - **Integrity**: [`BlobStore::put_blob`] hashes the content and refuses a
//!   mismatch, so a corrupt or tampered download never becomes extractable.
//! - **Fresh streams**: [`BlobStore::open_blob`] opens a new reader per call,
//!   which is what lets a [`Layer`](crate::source::Layer) hand out a fresh
//!   compressed stream every time without re-hitting the network.
//!
//! Blobs live in a sharded two-level layout to keep directories small:
//!
//! ```text
//! ~/.walkio/blobs/
//! └── sha256/
//!     ├── ab/abcd1234...
//!     └── cd/cdef5678...
//! ```
//!
//! Writes go through a uniquely named temp file plus rename, so concurrent
//! pulls of the same layer race harmlessly (identical content, last rename
//! wins) and a crash never leaves a partial blob under its final name.

use crate::constants::BLOB_STORE_DIR;
use crate::digest::ImageDigest;
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content-addressed blob store for compressed layer data.
///
/// Safe for concurrent use: every operation is independent and writes are
/// atomic installs.
#[derive(Debug)]
pub struct BlobStore {
    /// Base directory for blob storage.
    base_dir: PathBuf,
}

impl BlobStore {
    /// Creates a blob store at the default location (`~/.walkio/blobs`).
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_path())
    }

    /// Creates a blob store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInit {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self { base_dir })
    }

    /// Returns the default storage path.
    fn default_path() -> PathBuf {
        if let Some(home) = dirs::home_dir() {
            home.join(".walkio").join(BLOB_STORE_DIR)
        } else {
            PathBuf::from(".walkio").join(BLOB_STORE_DIR)
        }
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &ImageDigest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Returns the on-disk path for a digest.
    ///
    /// The digest is validated at construction, so its parts are safe to use
    /// as path components here.
    pub fn blob_path(&self, digest: &ImageDigest) -> PathBuf {
        let hash = digest.hex();
        let prefix = &hash[..2.min(hash.len())];
        self.base_dir
            .join(digest.algorithm())
            .join(prefix)
            .join(hash)
    }

    /// Opens a blob for reading, yielding a fresh stream per call.
    pub fn open_blob(&self, digest: &ImageDigest) -> Result<File> {
        File::open(self.blob_path(digest)).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Stores a blob after verifying its content matches the digest.
    ///
    /// # Security
    ///
    /// Only sha256 digests are accepted so every stored blob is verified;
    /// a registry or network handing back wrong bytes fails here, before the
    /// content can reach the flattener.
    pub fn put_blob(&self, digest: &ImageDigest, data: &[u8]) -> Result<()> {
        if digest.algorithm() != "sha256" {
            return Err(Error::StorageWrite(format!(
                "unsupported digest algorithm '{}': only sha256 is supported",
                digest.algorithm()
            )));
        }

        let computed = ImageDigest::sha256(data);
        if computed != *digest {
            return Err(Error::StorageWrite(format!(
                "digest mismatch: expected {}, computed {}",
                digest, computed
            )));
        }

        let path = self.blob_path(digest);
        if path.exists() {
            debug!("blob {} already exists", digest);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWrite(e.to_string()))?;
        }

        // Unique temp name so concurrent writers of the same blob never step
        // on each other; the final rename is atomic.
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, data).map_err(|e| Error::StorageWrite(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWrite(e.to_string())
        })?;

        debug!("stored blob {} ({} bytes, verified)", digest, data.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_and_open_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_path(temp.path().to_path_buf()).unwrap();

        let data = b"layer bytes";
        let digest = ImageDigest::sha256(data);

        store.put_blob(&digest, data).unwrap();
        assert!(store.has_blob(&digest));

        // Two opens yield two independent readers over the same content.
        use std::io::Read;
        for _ in 0..2 {
            let mut reader = store.open_blob(&digest).unwrap();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).unwrap();
            assert_eq!(buf, data);
        }
    }

    #[test]
    fn put_rejects_digest_mismatch() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_path(temp.path().to_path_buf()).unwrap();

        let wrong = ImageDigest::sha256(b"something else");
        let result = store.put_blob(&wrong, b"layer bytes");
        assert!(result.is_err(), "mismatched digest must be rejected");
    }

    #[test]
    fn blob_path_is_sharded() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_path(temp.path().to_path_buf()).unwrap();

        let digest = ImageDigest::sha256(b"x");
        let path = store.blob_path(&digest);
        let rel = path.strip_prefix(temp.path()).unwrap();
        let parts: Vec<_> = rel.components().collect();
        assert_eq!(parts.len(), 3, "algo/shard/hash layout expected");
    }

    #[test]
    fn open_missing_blob_fails() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_path(temp.path().to_path_buf()).unwrap();

        let digest = ImageDigest::sha256(b"never stored");
        assert!(matches!(
            store.open_blob(&digest),
            Err(Error::BlobNotFound { .. })
        ));
    }
}
