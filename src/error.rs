use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("dialog error: {0}")]
    Dialog(String),

    #[error("media relay error: {0}")]
    Media(String),

    #[error("sdp error: {0}")]
    Sdp(#[from] SdpError),

    #[error("sdp rewrite failed: {0}")]
    Rewrite(#[from] RewriteError),

    #[error("protocol inconsistency: {0}")]
    ProtocolInconsistency(String),

    #[error("session {0} is gone")]
    PeerGone(String),
}

impl Error {
    pub fn dialog<E: std::fmt::Display>(err: E) -> Self {
        Self::Dialog(err.to_string())
    }

    pub fn configuration<E: std::fmt::Display>(err: E) -> Self {
        Self::Configuration(err.to_string())
    }

    pub fn inconsistency<E: std::fmt::Display>(err: E) -> Self {
        Self::ProtocolInconsistency(err.to_string())
    }
}

/// Reasons a body could not be parsed as a session description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdpError {
    #[error("body is empty")]
    Empty,

    #[error("missing v= line at start of description")]
    MissingVersion,

    #[error("malformed line {line}: {text}")]
    Malformed { line: usize, text: String },

    #[error("invalid media port in line {line}: {text}")]
    InvalidPort { line: usize, text: String },
}

/// Reasons relay address substitution was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteError {
    #[error("content type {0} is not application/sdp")]
    NotSdp(String),

    #[error("body is empty")]
    EmptyBody,

    #[error(transparent)]
    Parse(#[from] SdpError),

    #[error("relay stream {0} has no local binding")]
    StreamUnbound(usize),
}
