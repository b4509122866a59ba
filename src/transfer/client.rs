use crate::error::{Error, Result};
use crate::transfer::proto::transfer_service_client::TransferServiceClient;
use crate::transfer::proto::{PushRequest, TagRequest, pull_response};
use crate::transfer::{
    Ack, CHUNK_SIZE, GENERATION_METADATA, Progress, REFERENCE_METADATA, Request, read_chunk,
};
use bytes::Bytes;
use futures::SinkExt;
use futures::channel::mpsc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tonic::Streaming;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Chunks buffered between the archive reader and the push RPC.
const PUSH_BUFFER: usize = 64;

/// Client side of the transfer RPCs.
pub struct TransferClient {
    inner: TransferServiceClient<Channel>,
    idle: Duration,
}

impl TransferClient {
    /// Dials `addr`, either a URI or a plain `host:port`.
    pub async fn connect(addr: &str) -> Result<Self> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let channel = Endpoint::from_shared(uri)?.connect().await?;
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            inner: TransferServiceClient::new(channel),
            idle: Duration::from_secs(60),
        }
    }

    async fn next_message<T>(&self, stream: &mut Streaming<T>) -> Result<Option<T>> {
        match timeout(self.idle, stream.message()).await {
            Ok(message) => Ok(message?),
            Err(_) => Err(Error::Timeout(self.idle)),
        }
    }

    /// Downloads the current image archive of a tag into `out`.
    pub async fn pull<W>(
        mut self,
        request: Request,
        out: &mut W,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<Ack>
    where
        W: AsyncWrite + Unpin,
    {
        let response = self.inner.pull(TagRequest::from(&request)).await?;
        let metadata = response.metadata();
        let reference = metadata
            .get(REFERENCE_METADATA)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Error::protocol("pull response does not name its image"))?
            .to_string();
        let generation = metadata
            .get(GENERATION_METADATA)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());

        let mut stream = response.into_inner();
        let mut received = 0u64;
        let mut total = None;
        while let Some(message) = self.next_message(&mut stream).await? {
            match message.message {
                Some(pull_response::Message::Chunk(data)) => {
                    out.write_all(&data).await?;
                    received += data.len() as u64;
                }
                Some(pull_response::Message::Progress(progress)) => {
                    total = Some(progress.total);
                    on_progress(progress);
                }
                None => return Err(Error::protocol("empty message during pull")),
            }
        }
        out.flush().await?;
        match total {
            Some(total) if total != received => Err(Error::protocol(format!(
                "received {} bytes, server sent {}",
                received, total
            ))),
            _ => Ok(Ack {
                reference,
                size: received,
                generation,
            }),
        }
    }

    /// Uploads an image archive as the next generation of a tag.
    pub async fn push<R>(mut self, request: Request, input: &mut R) -> Result<Ack>
    where
        R: AsyncRead + Unpin,
    {
        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        let push = self.inner.push(rx);
        let send = send_archive(tx, &request, input);
        tokio::pin!(push, send);

        // The server may answer before the whole archive is sent, its status
        // explains why. A failed read drops the RPC so no partial archive lands.
        let reply = tokio::select! {
            reply = &mut push => reply,
            sent = &mut send => {
                let sent = sent?;
                debug!(sent, "Archive sent, waiting for acknowledgement");
                push.await
            }
        };
        Ok(reply?.into_inner().into())
    }
}

/// Sends the header and the chunks of `input`. Stops early once the server has
/// closed the stream.
async fn send_archive<R>(
    mut tx: mpsc::Sender<PushRequest>,
    request: &Request,
    input: &mut R,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    if tx.send(PushRequest::header(request.into())).await.is_err() {
        return Ok(0);
    }
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = read_chunk(input, &mut buf).await?;
        if n == 0 {
            break;
        }
        if tx
            .send(PushRequest::chunk(Bytes::copy_from_slice(&buf[..n])))
            .await
            .is_err()
        {
            break;
        }
        sent += n as u64;
    }
    Ok(sent)
}
