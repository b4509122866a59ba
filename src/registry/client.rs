use crate::credentials::RegistryAuth;
use crate::error::{Error, Result};
use crate::image_reference::ImageReference;
use crate::registry::layout::{self, Layout};
use crate::registry::{Location, Registry, blob_stream, sha256_digest, verify_file};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use oci_client::client::{Certificate, CertificateEncoding, ClientConfig, ClientProtocol};
use oci_client::manifest::{
    IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE, OciDescriptor, OciManifest,
};
use oci_client::secrets::RegistryAuth as OciRegistryAuth;
use oci_client::{Client, Reference, RegistryOperation};
use reqwest::header::HeaderValue;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Every manifest type we can copy.
const MANIFEST_TYPES: [&str; 4] = [
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE,
];

impl From<&RegistryAuth> for OciRegistryAuth {
    fn from(auth: &RegistryAuth) -> Self {
        match auth {
            RegistryAuth::Anonymous => OciRegistryAuth::Anonymous,
            RegistryAuth::Basic { username, password } => {
                OciRegistryAuth::Basic(username.clone(), password.expose_secret().to_string())
            }
        }
    }
}

fn oci_reference(image: &ImageReference) -> Reference {
    match &image.digest {
        Some(digest) => Reference::with_digest(
            image.registry.clone(),
            image.repository.clone(),
            digest.clone(),
        ),
        None => Reference::with_tag(
            image.registry.clone(),
            image.repository.clone(),
            image.reference().to_string(),
        ),
    }
}

/// Insecure registries on loopback are usually plain HTTP, everything else self-signed TLS.
fn protocol(location: &Location) -> ClientProtocol {
    let registry = &location.image.registry;
    let host = registry.split(':').next().unwrap_or(registry);
    if location.insecure && (host == "localhost" || host == "127.0.0.1") {
        ClientProtocol::HttpsExcept(vec![registry.clone()])
    } else {
        ClientProtocol::Https
    }
}

/// OCI distribution client.
#[derive(Clone)]
pub struct HttpRegistry {
    root_certificates: Vec<Vec<u8>>,
}

impl HttpRegistry {
    pub fn new(ca_certificate_paths: &[PathBuf]) -> Result<Self> {
        info!("Initializing OCI registry client");
        // System certificates are loaded automatically with rustls-tls-native-roots
        let root_certificates = ca_certificate_paths
            .iter()
            .map(std::fs::read)
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self { root_certificates })
    }

    /// A client bound to the credentials of `location`. Registry tokens are
    /// cached per client, so two credential sets never share one.
    fn remote(&self, location: &Location) -> Remote {
        let client = Client::new(ClientConfig {
            protocol: protocol(location),
            accept_invalid_certificates: location.insecure,
            extra_root_certificates: self
                .root_certificates
                .iter()
                .map(|pem| Certificate {
                    encoding: CertificateEncoding::Pem,
                    data: pem.clone(),
                })
                .collect(),
            ..Default::default()
        });
        Remote {
            client,
            image: location.image.clone(),
            auth: (&location.auth).into(),
        }
    }
}

/// A manifest or index as pulled. Pushing the same bytes keeps the digest.
struct RawManifest {
    body: Bytes,
    digest: String,
    manifest: OciManifest,
}

impl RawManifest {
    fn parse(body: Bytes, digest: String) -> Result<Self> {
        if digest.starts_with("sha256:") && sha256_digest(&body) != digest {
            return Err(Error::registry(format!(
                "manifest {} does not match its digest",
                digest
            )));
        }
        let manifest = serde_json::from_slice(&body)?;
        Ok(Self {
            body,
            digest,
            manifest,
        })
    }

    fn media_type(&self) -> &str {
        match &self.manifest {
            OciManifest::Image(image) => image.media_type.as_deref().unwrap_or(OCI_IMAGE_MEDIA_TYPE),
            OciManifest::ImageIndex(index) => index
                .media_type
                .as_deref()
                .unwrap_or(OCI_IMAGE_INDEX_MEDIA_TYPE),
        }
    }

    /// Digests of the images of an index.
    fn children(&self) -> Vec<String> {
        match &self.manifest {
            OciManifest::ImageIndex(index) => {
                index.manifests.iter().map(|m| m.digest.clone()).collect()
            }
            OciManifest::Image(_) => Vec::new(),
        }
    }

    /// Config and layer blobs, skipping foreign layers that live outside the registry.
    fn blobs(&self) -> Vec<&OciDescriptor> {
        match &self.manifest {
            OciManifest::Image(image) => std::iter::once(&image.config)
                .chain(&image.layers)
                .filter(|d| d.urls.as_ref().is_none_or(Vec::is_empty))
                .collect(),
            OciManifest::ImageIndex(_) => Vec::new(),
        }
    }
}

/// One repository reached with one credential set.
struct Remote {
    client: Client,
    image: ImageReference,
    auth: OciRegistryAuth,
}

impl Remote {
    fn reference(&self) -> Reference {
        oci_reference(&self.image)
    }

    fn by_digest(&self, digest: &str) -> Reference {
        Reference::with_digest(
            self.image.registry.clone(),
            self.image.repository.clone(),
            digest.to_string(),
        )
    }

    async fn manifest(&self, reference: &Reference) -> Result<RawManifest> {
        let (body, digest) = self
            .client
            .pull_manifest_raw(reference, &self.auth, &MANIFEST_TYPES)
            .await?;
        RawManifest::parse(Bytes::from(body), digest)
    }

    /// Streams a blob into the file at `path` and checks its digest.
    async fn pull_blob(&self, blob: &OciDescriptor, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        self.client
            .pull_blob(&self.reference(), blob, &mut file)
            .await?;
        file.flush().await?;
        verify_file(path, &blob.digest).await
    }

    /// Fetches a push token; uploads reuse it.
    async fn authorize_push(&self) -> Result<()> {
        self.client
            .auth(&self.reference(), &self.auth, RegistryOperation::Push)
            .await?;
        Ok(())
    }

    /// Uploads the file at `path` chunk by chunk.
    async fn push_blob(&self, path: &Path, digest: &str) -> Result<()> {
        let chunks = blob_stream(path).await?.map_err(Into::into);
        self.client
            .push_blob_stream(&self.reference(), chunks, digest)
            .await?;
        debug!(digest, "Pushed blob");
        Ok(())
    }

    async fn push_manifest(&self, reference: &Reference, manifest: &RawManifest) -> Result<String> {
        let media_type = manifest.media_type();
        let content_type = HeaderValue::from_str(media_type)
            .map_err(|e| Error::registry(format!("invalid media type {}: {}", media_type, e)))?;
        self.client
            .push_manifest_raw(reference, manifest.body.to_vec(), content_type)
            .await?;
        Ok(manifest.digest.clone())
    }
}

/// Moves every blob of `manifest` through a file in `spool`, one blob at a time.
async fn copy_blobs(from: &Remote, to: &Remote, manifest: &RawManifest, spool: &Path) -> Result<()> {
    for blob in manifest.blobs() {
        let path = tempfile::NamedTempFile::new_in(spool)?.into_temp_path();
        from.pull_blob(blob, &path).await?;
        to.push_blob(&path, &blob.digest).await?;
    }
    Ok(())
}

async fn export_blobs(remote: &Remote, layout: &Layout, manifest: &RawManifest) -> Result<()> {
    for blob in manifest.blobs() {
        let path = layout.blob_file(&blob.digest).await?;
        remote.pull_blob(blob, &path).await?;
    }
    Ok(())
}

async fn import_blobs(remote: &Remote, layout: &Layout, manifest: &RawManifest) -> Result<()> {
    for blob in manifest.blobs() {
        let path = layout.verified_blob(&blob.digest).await?;
        remote.push_blob(&path, &blob.digest).await?;
    }
    Ok(())
}

async fn stored_manifest(layout: &Layout, digest: &str) -> Result<RawManifest> {
    RawManifest::parse(layout.read_blob(digest).await?, digest.to_string())
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn manifest_digest(&self, location: &Location) -> Result<String> {
        let remote = self.remote(location);
        let digest = remote
            .client
            .fetch_manifest_digest(&remote.reference(), &remote.auth)
            .await?;
        info!(image = %location.image, digest = %digest, "Resolved image digest");
        Ok(digest)
    }

    async fn copy(&self, src: &Location, dst: &Location) -> Result<String> {
        let from = self.remote(src);
        let to = self.remote(dst);
        let root = from.manifest(&from.reference()).await?;
        to.authorize_push().await?;

        let spool = tempfile::tempdir()?;
        for child in root.children() {
            let manifest = from.manifest(&from.by_digest(&child)).await?;
            copy_blobs(&from, &to, &manifest, spool.path()).await?;
            to.push_manifest(&to.by_digest(&child), &manifest).await?;
        }
        copy_blobs(&from, &to, &root, spool.path()).await?;
        let pushed = to.push_manifest(&to.reference(), &root).await?;
        info!(src = %src.image, dst = %dst.image, digest = %pushed, "Copied image");
        Ok(pushed)
    }

    async fn export(&self, src: &Location, archive: &Path) -> Result<()> {
        let remote = self.remote(src);
        let dir = tempfile::tempdir()?;
        let layout = Layout::new(dir.path());
        layout.init().await?;

        let root = remote.manifest(&remote.reference()).await?;
        for child in root.children() {
            let manifest = remote.manifest(&remote.by_digest(&child)).await?;
            export_blobs(&remote, &layout, &manifest).await?;
            layout.write_blob(&manifest.digest, &manifest.body).await?;
        }
        export_blobs(&remote, &layout, &root).await?;
        layout.write_blob(&root.digest, &root.body).await?;
        layout
            .write_index(layout::root_descriptor(
                root.media_type(),
                &root.digest,
                root.body.len() as u64,
                &src.image.to_string(),
            )?)
            .await?;
        layout::pack(dir.path(), archive).await
    }

    async fn import(&self, archive: &Path, dst: &Location) -> Result<String> {
        let remote = self.remote(dst);
        let dir = tempfile::tempdir()?;
        layout::unpack(archive, dir.path()).await?;
        let layout = Layout::new(dir.path());
        let root = layout.read_index().await?;
        let root = stored_manifest(&layout, &root.digest().to_string()).await?;
        remote.authorize_push().await?;

        for child in root.children() {
            let manifest = stored_manifest(&layout, &child).await?;
            import_blobs(&remote, &layout, &manifest).await?;
            remote.push_manifest(&remote.by_digest(&child), &manifest).await?;
        }
        import_blobs(&remote, &layout, &root).await?;
        let digest = remote.push_manifest(&remote.reference(), &root).await?;
        info!(dst = %dst.image, digest = %digest, "Imported image archive");
        Ok(digest)
    }
}
