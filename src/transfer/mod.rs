//! gRPC service streaming a tag's current image as an OCI layout archive.
//!
//! `Pull` answers a [`proto::TagRequest`] with a stream of chunks, every
//! [`PROGRESS_EVERY`]th preceded by progress, and closes with a progress
//! message covering the whole archive. `Push` takes a stream whose first message
//! is a header naming the tag, followed by chunks, and answers with a single
//! [`proto::PushAck`] once the client closes its side.

pub mod auth;
pub mod client;
pub mod proto;
pub mod server;

use crate::error::Error;
use crate::secret_string::SecretString;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tonic::{Code, Status};

pub use auth::{Authorizer, KubeAuthorizer, Verb};
pub use client::TransferClient;
pub use proto::Progress;
pub use server::TransferServer;

pub const CHUNK_SIZE: usize = 1024;
pub const PROGRESS_EVERY: usize = 50;

/// Response metadata naming the image a pull streams.
pub(crate) static REFERENCE_METADATA: &str = "tagger-reference";
pub(crate) static GENERATION_METADATA: &str = "tagger-generation";

/// Identifies the tag a transfer is about and carries the caller's bearer token.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub namespace: String,
    pub name: String,
    pub token: SecretString,
}

impl Request {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            token: SecretString::new(token),
        }
    }

    fn missing_field(&self) -> Option<&'static str> {
        if self.namespace.is_empty() {
            Some("namespace")
        } else if self.name.is_empty() {
            Some("name")
        } else if self.token.is_empty() {
            Some("token")
        } else {
            None
        }
    }
}

impl From<&Request> for proto::TagRequest {
    fn from(request: &Request) -> Self {
        Self {
            namespace: request.namespace.clone(),
            name: request.name.clone(),
            token: request.token.expose_secret().to_string(),
        }
    }
}

impl From<proto::TagRequest> for Request {
    fn from(request: proto::TagRequest) -> Self {
        Request::new(request.namespace, request.name, request.token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Reference the transferred archive corresponds to
    pub reference: String,
    pub size: u64,
    /// Tag generation the archive belongs to
    pub generation: Option<i64>,
}

impl From<proto::PushAck> for Ack {
    fn from(ack: proto::PushAck) -> Self {
        Self {
            reference: ack.reference,
            size: ack.size,
            generation: ack.generation,
        }
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        match e {
            Error::Unauthorized(message) => Status::permission_denied(message),
            Error::Protocol(message) => Status::invalid_argument(message),
            Error::MirrorNotConfigured => Status::failed_precondition(e.to_string()),
            e @ Error::NotFound { .. } => Status::not_found(e.to_string()),
            e @ Error::Timeout(_) => Status::deadline_exceeded(e.to_string()),
            other => Status::internal(other.to_string()),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::PermissionDenied | Code::Unauthenticated => Error::Unauthorized(message),
            Code::InvalidArgument => Error::Protocol(message),
            code => Error::Transfer { code, message },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    /// Longest wait for the next message, also the HTTP/2 ping interval
    pub idle: Duration,
    pub max_age: Duration,
    /// Extra time an RPC still running at max age gets to finish
    pub grace: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            max_age: Duration::from_secs(20 * 60),
            grace: Duration::from_secs(60),
        }
    }
}

impl Keepalive {
    /// Hard limit on a single RPC.
    pub fn deadline(&self) -> Duration {
        self.max_age + self.grace
    }
}

/// Reads until `buf` is full or the reader is exhausted, so every chunk but
/// the last has the full size.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_kind() {
        let status = Status::from(Error::Unauthorized("token rejected".to_string()));
        assert_eq!(status.code(), Code::PermissionDenied);
        assert!(matches!(Error::from(status), Error::Unauthorized(m) if m == "token rejected"));

        let status = Status::from(Error::protocol("request is missing token"));
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(matches!(Error::from(status), Error::Protocol(_)));

        let status = Status::from(Error::not_found("Tag", "team", "app"));
        assert_eq!(status.code(), Code::NotFound);
        let err = Error::from(status);
        assert!(matches!(err, Error::Transfer { code: Code::NotFound, .. }));
        assert!(err.to_string().contains("Tag team/app not found"), "{err}");
    }

    #[test]
    fn test_tag_request_debug_redacts_token() {
        let request = proto::TagRequest::from(&Request::new("team", "app", "s3cr3t"));
        assert_eq!(request.token, "s3cr3t");
        assert!(!format!("{:?}", request).contains("s3cr3t"));
    }
}
