//! Wire messages of `tagger.v1.TransferService`.

use bytes::Bytes;
use std::fmt;

/// Names a tag and carries the caller's bearer token. Sent as the pull request
/// and as the first message of a push.
#[derive(Clone, PartialEq, prost::Message)]
#[prost(skip_debug)]
pub struct TagRequest {
    #[prost(string, tag = "1")]
    pub namespace: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub token: String,
}

impl fmt::Debug for TagRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagRequest")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct Progress {
    #[prost(uint64, tag = "1")]
    pub transferred: u64,
    #[prost(uint64, tag = "2")]
    pub total: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PullResponse {
    #[prost(oneof = "pull_response::Message", tags = "1, 2")]
    pub message: Option<pull_response::Message>,
}

pub mod pull_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Progress(super::Progress),
        #[prost(bytes = "bytes", tag = "2")]
        Chunk(bytes::Bytes),
    }
}

impl PullResponse {
    pub fn progress(transferred: u64, total: u64) -> Self {
        Self {
            message: Some(pull_response::Message::Progress(Progress { transferred, total })),
        }
    }

    pub fn chunk(data: Bytes) -> Self {
        Self {
            message: Some(pull_response::Message::Chunk(data)),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushRequest {
    #[prost(oneof = "push_request::Message", tags = "1, 2")]
    pub message: Option<push_request::Message>,
}

pub mod push_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Header(super::TagRequest),
        #[prost(bytes = "bytes", tag = "2")]
        Chunk(bytes::Bytes),
    }
}

impl PushRequest {
    pub fn header(request: TagRequest) -> Self {
        Self {
            message: Some(push_request::Message::Header(request)),
        }
    }

    pub fn chunk(data: Bytes) -> Self {
        Self {
            message: Some(push_request::Message::Chunk(data)),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match &self.message {
            Some(push_request::Message::Header(_)) => "header",
            Some(push_request::Message::Chunk(_)) => "chunk",
            None => "empty",
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushAck {
    /// Pinned mirror reference the pushed archive was loaded as
    #[prost(string, tag = "1")]
    pub reference: String,
    #[prost(uint64, tag = "2")]
    pub size: u64,
    #[prost(int64, optional, tag = "3")]
    pub generation: Option<i64>,
}

include!(concat!(env!("OUT_DIR"), "/tagger.v1.TransferService.rs"));
