use crate::image_reference::ParseError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The object was deleted between being enqueued and being fetched.
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("registry error: {0}")]
    Registry(String),

    /// Every credential set was rejected while resolving a digest.
    #[error("unable to resolve {reference}: {}", .failures.join("; "))]
    AllCredentialsFailed {
        reference: String,
        failures: Vec<String>,
    },

    #[error("invalid image reference: {0}")]
    InvalidReference(#[from] ParseError),

    #[error("{0}")]
    InvalidGeneration(String),

    #[error("mirroring requested but no mirror registry is configured")]
    MirrorNotConfigured,

    #[error("invalid queue key {0:?}")]
    InvalidKey(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A transfer RPC failed on the server side.
    #[error("transfer failed ({code:?}): {message}")]
    Transfer { code: tonic::Code, message: String },

    #[error("transfer connection error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("registry error: {0}")]
    Distribution(#[from] oci_client::errors::OciDistributionError),

    #[error("oci image layout error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, namespace: &str, name: &str) -> Self {
        Error::NotFound {
            kind: kind.into(),
            key: format!("{namespace}/{name}"),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Error::Registry(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
