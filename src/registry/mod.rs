//! Registry client capability: digest resolution, registry to registry copies
//! and OCI image layout archives.

pub mod client;
pub mod layout;
pub mod mirror;
pub mod resolver;

pub use client::HttpRegistry;
pub use mirror::Mirror;
pub use resolver::Resolver;

use crate::credentials::RegistryAuth;
use crate::error::{Error, Result};
use crate::image_reference::ImageReference;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use tempfile::TempPath;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

/// Upper bound on the bytes of a blob held in memory at once.
pub const BLOB_CHUNK_SIZE: usize = 64 * 1024;

/// An image in a registry together with the credentials to reach it.
#[derive(Debug, Clone)]
pub struct Location {
    pub image: ImageReference,
    pub auth: RegistryAuth,
    pub insecure: bool,
}

impl Location {
    pub fn new(image: ImageReference, auth: RegistryAuth, insecure: bool) -> Self {
        Self {
            image,
            auth,
            insecure,
        }
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Digest of the manifest `location` currently points to.
    async fn manifest_digest(&self, location: &Location) -> Result<String>;

    /// Copies `src` to `dst`, including every image of a manifest list.
    /// Returns the digest of the manifest pushed to `dst`.
    async fn copy(&self, src: &Location, dst: &Location) -> Result<String>;

    /// Writes `src` as an OCI image layout tar archive to `archive`.
    async fn export(&self, src: &Location, archive: &Path) -> Result<()>;

    /// Pushes the image stored in the OCI image layout tar `archive` to `dst`.
    /// Returns the digest of the pushed manifest.
    async fn import(&self, archive: &Path, dst: &Location) -> Result<String>;
}

/// Exports `src` into a temporary OCI layout archive. The file is removed when
/// the returned path is dropped, and on every error path.
pub async fn save(registry: &dyn Registry, src: &Location) -> Result<TempPath> {
    let path = tempfile::NamedTempFile::new()?.into_temp_path();
    registry.export(src, &path).await?;
    Ok(path)
}

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Reads the file at `path` in chunks of at most [`BLOB_CHUNK_SIZE`] bytes.
pub async fn blob_stream(path: &Path) -> Result<ReaderStream<tokio::fs::File>> {
    let file = tokio::fs::File::open(path).await?;
    Ok(ReaderStream::with_capacity(file, BLOB_CHUNK_SIZE))
}

/// Hashes the file at `path` chunk by chunk and compares it with `digest`.
/// Digests of other algorithms are accepted unchecked.
pub async fn verify_file(path: &Path, digest: &str) -> Result<()> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        return Ok(());
    };
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; BLOB_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let actual = hex::encode(hasher.finalize());
    if actual != expected {
        return Err(Error::Invalid(format!(
            "blob {} has digest sha256:{}",
            digest, actual
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::TryStreamExt;

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    fn large_blob() -> Vec<u8> {
        (0..5 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_large_blob_is_streamed_in_bounded_chunks() {
        let data = large_blob();
        let digest = sha256_digest(&data);
        let file = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), &data).await.unwrap();

        let chunks: Vec<Bytes> = blob_stream(file.path())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(chunks.len() >= data.len() / BLOB_CHUNK_SIZE);
        assert!(chunks.iter().all(|c| c.len() <= BLOB_CHUNK_SIZE));

        let mut hasher = Sha256::new();
        for chunk in &chunks {
            hasher.update(chunk);
        }
        assert_eq!(format!("sha256:{}", hex::encode(hasher.finalize())), digest);
    }

    #[tokio::test]
    async fn test_verify_file() {
        let data = large_blob();
        let digest = sha256_digest(&data);
        let file = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), &data).await.unwrap();
        verify_file(file.path(), &digest).await.unwrap();

        let mut tampered = data;
        tampered[4 * 1024 * 1024] ^= 1;
        tokio::fs::write(file.path(), &tampered).await.unwrap();
        assert!(verify_file(file.path(), &digest).await.is_err());
        verify_file(file.path(), "sha512:00").await.unwrap();
    }
}
