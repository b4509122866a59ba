//! OCI image layout directories and their tar archives.

use crate::error::{Error, Result};
use crate::registry::{sha256_digest, verify_file};
use bytes::Bytes;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageIndex, ImageIndexBuilder, MediaType,
    OciLayoutBuilder,
};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

static OCI_LAYOUT_FILE: &str = "oci-layout";
static INDEX_FILE: &str = "index.json";
static REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Index entry for the image a layout is written for, named after `ref_name`.
pub fn root_descriptor(media_type: &str, digest: &str, size: u64, ref_name: &str) -> Result<Descriptor> {
    Ok(DescriptorBuilder::default()
        .media_type(MediaType::from(media_type))
        .digest(
            Digest::from_str(digest)
                .map_err(|e| Error::Invalid(format!("invalid digest {:?}: {}", digest, e)))?,
        )
        .size(size)
        .annotations(HashMap::from([(
            REF_NAME_ANNOTATION.to_string(),
            ref_name.to_string(),
        )]))
        .build()?)
}

/// Blob path for `digest`, refusing anything that could escape the layout.
fn blob_path(root: &Path, digest: &str) -> Result<PathBuf> {
    let invalid = || Error::Invalid(format!("invalid blob digest {:?}", digest));
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(invalid)?;
    let valid_algorithm = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_encoded = !encoded.is_empty() && encoded.chars().all(|c| c.is_ascii_hexdigit());
    if !valid_algorithm || !valid_encoded {
        return Err(invalid());
    }
    Ok(root.join("blobs").join(algorithm).join(encoded))
}

pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("blobs")).await?;
        let layout = OciLayoutBuilder::default()
            .image_layout_version("1.0.0".to_string())
            .build()?;
        tokio::fs::write(self.root.join(OCI_LAYOUT_FILE), layout.to_string()?).await?;
        Ok(())
    }

    /// Path a blob is stored at, with its parent directory created.
    pub async fn blob_file(&self, digest: &str) -> Result<PathBuf> {
        let path = blob_path(&self.root, digest)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }

    pub async fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.blob_file(digest).await?, data).await?;
        Ok(())
    }

    /// Reads a small blob such as a manifest and checks it against its digest.
    pub async fn read_blob(&self, digest: &str) -> Result<Bytes> {
        let data = Bytes::from(tokio::fs::read(blob_path(&self.root, digest)?).await?);
        if digest.starts_with("sha256:") && sha256_digest(&data) != digest {
            return Err(Error::Invalid(format!(
                "blob {} does not match its digest",
                digest
            )));
        }
        Ok(data)
    }

    /// Path of a stored blob after streaming it through its digest.
    pub async fn verified_blob(&self, digest: &str) -> Result<PathBuf> {
        let path = blob_path(&self.root, digest)?;
        verify_file(&path, digest).await?;
        Ok(path)
    }

    pub async fn write_index(&self, root: Descriptor) -> Result<()> {
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![root])
            .build()?;
        tokio::fs::write(self.root.join(INDEX_FILE), index.to_string()?).await?;
        Ok(())
    }

    /// The single image the layout was written for.
    pub async fn read_index(&self) -> Result<Descriptor> {
        let data = tokio::fs::read(self.root.join(INDEX_FILE)).await?;
        let index = ImageIndex::from_reader(&data[..])?;
        match index.manifests().as_slice() {
            [root] => Ok(root.clone()),
            [] => Err(Error::Invalid("image archive contains no image".to_string())),
            _ => Err(Error::Invalid(
                "image archive contains more than one image".to_string(),
            )),
        }
    }
}

/// Writes the directory `dir` as a tar archive at `archive`.
pub async fn pack(dir: &Path, archive: &Path) -> Result<()> {
    let dir = dir.to_path_buf();
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut builder = tar::Builder::new(File::create(&archive)?);
        builder.append_dir_all(".", &dir)?;
        builder.into_inner()?.sync_all()?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Extracts the tar archive at `archive` into `dir`.
pub async fn unpack(archive: &Path, dir: &Path) -> Result<()> {
    let dir = dir.to_path_buf();
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        tar::Archive::new(File::open(&archive)?).unpack(&dir)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
}
