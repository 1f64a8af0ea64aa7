use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest extension accepted for a stored key.
const MAX_EXTENSION_LEN: usize = 8;

/// A blob that has been written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Filename inside the storage directory.
    pub key: String,
    /// Public path the blob is served under, e.g. `/files/<key>`.
    pub url: String,
}

/// On-disk storage for uploaded message attachments.
///
/// Every blob is a flat file at `{dir}/{key}`, where `key` is a fresh UUID
/// plus the extension chosen by the caller. Blobs are served back by the
/// HTTP layer under `public_prefix`, which derives the Content-Type from
/// that extension.
pub struct BlobStore {
    dir: PathBuf,
    public_prefix: String,
}

impl BlobStore {
    pub async fn new(dir: PathBuf, public_prefix: &str) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Blob storage directory: {}", dir.display());
        Ok(Self {
            dir,
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path to the file for a given key.
    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_prefix, key)
    }

    /// Inverse of [`BlobStore::url_for`]. `None` if the reference does not
    /// point into this store.
    pub fn key_from_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        let key = url.strip_prefix(&self.public_prefix)?.strip_prefix('/')?;
        is_valid_key(key).then_some(key)
    }

    /// Write `data` under a newly generated key ending in `extension`.
    pub async fn put(&self, data: &[u8], extension: Option<&str>) -> Result<StoredBlob> {
        if data.is_empty() {
            bail!("Refusing to store an empty blob");
        }

        let key = match extension {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), clean_extension(ext)?),
            None => Uuid::new_v4().to_string(),
        };

        let path = self.blob_path(&key);
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        debug!("Stored blob {} ({} bytes)", key, data.len());
        Ok(StoredBlob {
            url: self.url_for(&key),
            key,
        })
    }

    /// Delete a blob. A blob that is already gone is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        if !is_valid_key(key) {
            bail!("Invalid blob key: {}", key);
        }

        let path = self.blob_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted blob {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Blob {} already gone", key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        is_valid_key(key) && fs::try_exists(self.blob_path(key)).await.unwrap_or(false)
    }
}

fn clean_extension(ext: &str) -> Result<String> {
    let ext = ext.trim_start_matches('.');
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        bail!("Invalid blob extension: {:?}", ext);
    }
    Ok(ext.to_ascii_lowercase())
}

// Keys are generated by `put`; anything else (slashes, dot-dot) is refused
// so a stored reference can never escape the storage directory.
fn is_valid_key(key: &str) -> bool {
    let stem = key.split_once('.').map_or(key, |(stem, _)| stem);
    stem.parse::<Uuid>().is_ok()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !key.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("files"), "/files/").await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_uses_the_given_extension() {
        let (_dir, store) = store().await;

        let blob = store.put(b"png-bytes", Some("PNG")).await.unwrap();
        assert!(blob.key.ends_with(".png"));
        assert_eq!(blob.url, format!("/files/{}", blob.key));
        assert_eq!(tokio::fs::read(store.blob_path(&blob.key)).await.unwrap(), b"png-bytes");

        let blob = store.put(b"x", None).await.unwrap();
        assert!(!blob.key.contains('.'));
    }

    #[tokio::test]
    async fn malformed_extension_is_refused() {
        let (_dir, store) = store().await;

        for ext in ["", "../../etc/passwd", "svg+xml", "verylongext"] {
            assert!(store.put(b"x", Some(ext)).await.is_err(), "{ext}");
        }
        let mut entries = tokio::fs::read_dir(store.dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_generates_unique_keys() {
        let (_dir, store) = store().await;

        let a = store.put(b"same", Some("jpg")).await.unwrap();
        let b = store.put(b"same", Some("jpg")).await.unwrap();
        assert_ne!(a.key, b.key);
    }

    #[tokio::test]
    async fn empty_blob_is_rejected() {
        let (_dir, store) = store().await;
        assert!(store.put(b"", Some("png")).await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store().await;

        let blob = store.put(b"data", None).await.unwrap();
        assert!(store.exists(&blob.key).await);
        store.delete(&blob.key).await.unwrap();
        assert!(!store.exists(&blob.key).await);
        store.delete(&blob.key).await.unwrap();
    }

    #[tokio::test]
    async fn key_from_url_only_accepts_own_refs() {
        let (_dir, store) = store().await;
        let blob = store.put(b"data", Some("gif")).await.unwrap();

        assert_eq!(store.key_from_url(&blob.url), Some(blob.key.as_str()));
        assert_eq!(store.key_from_url("/elsewhere/x.gif"), None);
        assert_eq!(store.key_from_url("/files/../secret"), None);
        assert!(store.delete("../secret").await.is_err());
    }
}
