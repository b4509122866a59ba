use crate::credentials::NamespaceCredentials;
use crate::error::{Error, Result};
use crate::image_reference::ImageReference;
use crate::registry::{Location, Mirror, Registry, save};
use crate::resources::Tag;
use crate::store::SharedStore;
use crate::syncer::tag::request_generation;
use crate::transfer::proto::transfer_service_server::{TransferService, TransferServiceServer};
use crate::transfer::proto::{PullResponse, PushAck, PushRequest, TagRequest, push_request};
use crate::transfer::{
    Authorizer, CHUNK_SIZE, GENERATION_METADATA, Keepalive, PROGRESS_EVERY, REFERENCE_METADATA,
    Request, Verb, read_chunk,
};
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::transport::Server;
use tonic::{Status, Streaming};
use tracing::{error, info, warn};

/// Time an unanswered HTTP/2 keepalive ping gets before the connection is dropped.
const PING_TIMEOUT: Duration = Duration::from_secs(20);

type ArchiveStream = Pin<Box<dyn Stream<Item = Result<PullResponse, Status>> + Send>>;

pub struct TransferServer {
    authorizer: Arc<dyn Authorizer>,
    tags: SharedStore<Tag>,
    credentials: NamespaceCredentials,
    registry: Arc<dyn Registry>,
    mirror: Option<Mirror>,
    keepalive: Keepalive,
}

impl TransferServer {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        tags: SharedStore<Tag>,
        credentials: NamespaceCredentials,
        registry: Arc<dyn Registry>,
        mirror: Option<Mirror>,
    ) -> Self {
        Self {
            authorizer,
            tags,
            credentials,
            registry,
            mirror,
            keepalive: Keepalive::default(),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Keepalive) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Serves gRPC on `listener` until `token` is cancelled, then lets the RPCs
    /// in flight finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        let keepalive = self.keepalive;
        let incoming = async_stream::stream! {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => yield Ok::<_, std::io::Error>(stream),
                    Err(e) => warn!(error = %e, "Unable to accept transfer connection"),
                }
            }
        };
        let served = Server::builder()
            .http2_keepalive_interval(Some(keepalive.idle))
            .http2_keepalive_timeout(Some(PING_TIMEOUT))
            .max_connection_age(keepalive.max_age)
            .timeout(keepalive.deadline())
            .add_service(TransferServiceServer::from_arc(self))
            .serve_with_incoming_shutdown(Box::pin(incoming), token.cancelled_owned())
            .await;
        if let Err(e) = served {
            error!(error = %e, "Transfer server failed");
        }
        info!("Transfer server stopped");
    }

    async fn next_message(&self, stream: &mut Streaming<PushRequest>) -> Result<Option<PushRequest>> {
        match timeout(self.keepalive.idle, stream.message()).await {
            Ok(message) => Ok(message?),
            Err(_) => Err(Error::Timeout(self.keepalive.idle)),
        }
    }

    async fn authorize(&self, request: &Request, verb: Verb) -> Result<()> {
        if let Some(field) = request.missing_field() {
            return Err(Error::protocol(format!("request is missing {field}")));
        }
        self.authorizer
            .authorize(request.token.expose_secret(), &request.namespace, verb)
            .await
    }

    /// Exports `image` with the first credential set that works.
    async fn export(&self, namespace: &str, image: &ImageReference, insecure: bool) -> Result<TempPath> {
        let credentials = self.credentials.for_registry(namespace, &image.registry).await?;
        let mut failures = Vec::new();
        for auth in credentials {
            let location = match &self.mirror {
                Some(mirror) => mirror.locate(image.clone(), auth.clone(), insecure),
                None => Location::new(image.clone(), auth.clone(), insecure),
            };
            match save(self.registry.as_ref(), &location).await {
                Ok(archive) => return Ok(archive),
                Err(e) => failures.push(format!("{:?}: {}", auth, e)),
            }
        }
        Err(Error::AllCredentialsFailed {
            reference: image.to_string(),
            failures,
        })
    }

    /// Exports the tag's current image, returning the archive with the
    /// reference and generation it was exported for.
    async fn prepare_pull(&self, request: &Request) -> Result<(TempPath, String, i64)> {
        self.authorize(request, Verb::Get).await?;
        let tag = self.tags.get(&request.namespace, &request.name).await?;
        let current = tag.current_reference().ok_or_else(|| {
            Error::Invalid(format!(
                "tag {}/{} has no imported image for generation {}",
                request.namespace, request.name, tag.spec.generation
            ))
        })?;
        let image = ImageReference::parse(&current.image_reference)?;
        let archive = self.export(&request.namespace, &image, tag.spec.insecure).await?;
        Ok((archive, image.to_string(), tag.spec.generation))
    }

    async fn receive_push(&self, stream: &mut Streaming<PushRequest>) -> Result<PushAck> {
        let request: Request = match self.next_message(stream).await? {
            Some(PushRequest {
                message: Some(push_request::Message::Header(header)),
            }) => header.into(),
            Some(other) => {
                return Err(Error::protocol(format!(
                    "expected header as first message, got {}",
                    other.kind()
                )));
            }
            None => return Err(Error::protocol("push ended before its header")),
        };
        self.authorize(&request, Verb::Update).await?;
        let mirror = self
            .mirror
            .as_ref()
            .ok_or_else(|| Error::Invalid("pushing requires a mirror registry".to_string()))?;

        let archive = tempfile::NamedTempFile::new()?.into_temp_path();
        let mut file = tokio::fs::File::create(&archive).await?;
        let mut size = 0u64;
        while let Some(message) = self.next_message(stream).await? {
            match message.message {
                Some(push_request::Message::Chunk(data)) => {
                    file.write_all(&data).await?;
                    size += data.len() as u64;
                }
                _ => {
                    return Err(Error::protocol(format!(
                        "unexpected {} message during push",
                        message.kind()
                    )));
                }
            }
        }
        file.flush().await?;
        drop(file);

        let generation = match self.tags.get(&request.namespace, &request.name).await {
            Ok(tag) => tag.next_generation(),
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        let pinned = mirror
            .load_archive(&archive, &request.namespace, &request.name, &generation.to_string())
            .await?;
        let reference = pinned.to_string();
        let tag = request_generation(
            self.tags.as_ref(),
            &request.namespace,
            &request.name,
            Some(&reference),
        )
        .await?;
        info!(
            tag = %request.name,
            namespace = %request.namespace,
            reference = %reference,
            generation = tag.spec.generation,
            bytes = size,
            "Accepted push"
        );
        Ok(PushAck {
            reference,
            size,
            generation: Some(tag.spec.generation),
        })
    }
}

/// Streams `archive` in [`CHUNK_SIZE`] chunks with periodic progress, giving up
/// at `deadline`. The archive is removed once the stream is dropped.
fn stream_archive(
    archive: TempPath,
    deadline: Instant,
) -> impl Stream<Item = Result<PullResponse, Status>> + Send + 'static {
    async_stream::try_stream! {
        let total = tokio::fs::metadata(&archive).await?.len();
        let mut file = tokio::fs::File::open(&archive).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        let mut chunks = 0usize;
        loop {
            let n = timeout_at(deadline, read_chunk(&mut file, &mut buf))
                .await
                .map_err(|_| Status::deadline_exceeded("pull exceeded the maximum connection age"))??;
            if n == 0 {
                break;
            }
            if chunks % PROGRESS_EVERY == 0 {
                yield PullResponse::progress(transferred, total);
            }
            yield PullResponse::chunk(Bytes::copy_from_slice(&buf[..n]));
            transferred += n as u64;
            chunks += 1;
        }
        yield PullResponse::progress(transferred, total);
    }
}

#[tonic::async_trait]
impl TransferService for TransferServer {
    type PullStream = ArchiveStream;

    async fn pull(
        &self,
        request: tonic::Request<TagRequest>,
    ) -> Result<tonic::Response<Self::PullStream>, Status> {
        let deadline = Instant::now() + self.keepalive.deadline();
        let request = Request::from(request.into_inner());
        let (archive, reference, generation) =
            self.prepare_pull(&request).await.map_err(|e| {
                warn!(tag = %request.name, namespace = %request.namespace, error = %e, "Pull rejected");
                Status::from(e)
            })?;
        info!(tag = %request.name, namespace = %request.namespace, reference = %reference, "Serving pull");

        let stream: ArchiveStream = Box::pin(stream_archive(archive, deadline));
        let mut response = tonic::Response::new(stream);
        let metadata = response.metadata_mut();
        metadata.insert(
            REFERENCE_METADATA,
            MetadataValue::try_from(reference.as_str())
                .map_err(|e| Status::internal(e.to_string()))?,
        );
        metadata.insert(GENERATION_METADATA, MetadataValue::from(generation));
        Ok(response)
    }

    async fn push(
        &self,
        request: tonic::Request<Streaming<PushRequest>>,
    ) -> Result<tonic::Response<PushAck>, Status> {
        let mut stream = request.into_inner();
        let deadline = self.keepalive.deadline();
        let outcome = match timeout(deadline, self.receive_push(&mut stream)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(deadline)),
        };
        outcome.map(tonic::Response::new).map_err(|e| {
            warn!(error = %e, "Push aborted");
            Status::from(e)
        })
    }
}
