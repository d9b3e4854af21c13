use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The per-host request queue is longer than the configured backlog
    #[error("too many pending requests for {0}")]
    TooManyPendingRequests(String),

    #[error("rate limited by {host} after {attempts} attempts")]
    RateLimited { host: String, attempts: u32 },

    #[error("request cancelled")]
    Cancelled,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("network error: {0}")]
    Http(String),

    #[error("malformed manifest for {image}: {reason}")]
    MalformedManifest { image: String, reason: String },

    #[error("invalid image reference: {0}")]
    InvalidImage(#[from] crate::image::ImageError),

    #[error("invalid credentials for {host}: {reason}")]
    InvalidCredentials { host: String, reason: String },

    #[error("invalid registry url: {0}")]
    Url(#[from] url::ParseError),

    #[error("lookup task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Http(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RegistryError {
    fn from(err: tokio::task::JoinError) -> Self {
        RegistryError::Task(err.to_string())
    }
}
