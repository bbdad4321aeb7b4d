use std::path::Path;

use thiserror::Error;

/// Malformed input from the caller. Always answered with HTTP 400 and never
/// escalated past the request that caused it.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported content type {0:?}, expected application/json")]
    UnsupportedContentType(String),

    #[error("malformed admission review: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unexpected kind {0:?}, expected \"AdmissionReview\"")]
    UnexpectedKind(String),

    #[error("unsupported apiVersion {0:?}")]
    UnsupportedApiVersion(String),

    #[error("admission review carries no request")]
    MissingRequest,
}

/// Invalid static policy configuration, detected while building the policies.
#[derive(Error, Debug)]
pub enum PolicyConfigError {
    #[error("unknown cloud provider {0:?}, expected one of: gcp, azure, aws")]
    UnknownProvider(String),

    #[error("resource kind must not be empty")]
    EmptyKind,

    #[error("invalid annotation pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid annotation requirement {0:?}, expected KEY or KEY=REGEX")]
    InvalidRequirement(String),
}

/// Unexpected failure while evaluating a decision function. The handler turns
/// it into a deny; it never reaches the caller as a 5xx.
#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("cannot decode {kind} object: {source}")]
    ObjectDecode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("policy panicked: {0}")]
    Panicked(String),
}

/// Listener and TLS failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("{0}")]
    Tls(String),

    #[error("{0}: {1}")]
    Rustls(String, #[source] rustls::Error),

    #[error("{0}: {1}")]
    Watch(String, #[source] notify::Error),

    #[error("server on {0} failed: {1}")]
    Serve(String, #[source] std::io::Error),

    #[error("server is already running")]
    AlreadyRunning,
}

impl TransportError {
    pub(crate) fn read(what: &str, path: &Path, source: std::io::Error) -> Self {
        TransportError::Io(format!("cannot read {what} {}", path.display()), source)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("policy configuration error: {0}")]
    PolicyConfig(#[from] PolicyConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("telemetry error: {0}")]
    Telemetry(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
