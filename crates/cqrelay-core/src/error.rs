use thiserror::Error;

/// Errors produced by the relay's transport and configuration layers.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<url::ParseError> for RelayError {
    fn from(e: url::ParseError) -> Self {
        RelayError::InvalidUrl(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Why a media reference could not be turned into something the gateway can
/// fetch. Always recovered by forwarding the original reference.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no upload endpoint configured")]
    NoEndpoint,

    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upload returned status {status}: {body}")]
    UploadStatus { status: u16, body: String },

    #[error("undecodable upload response: {0}")]
    UploadDecode(#[from] serde_json::Error),

    #[error("upload response carried neither url nor local_path")]
    EmptyUpload,
}
