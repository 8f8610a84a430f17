use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1}")]
    Transport(String, #[source] reqwest::Error),

    #[error("{0} returned status {1}: {2}")]
    Status(String, u16, String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("{0}: {1}")]
    Decode(String, #[source] serde_json::Error),

    #[error("invalid api address {0:?}: {1}")]
    InvalidAddress(String, #[source] url::ParseError),

    #[error("failed to read {0}: {1}")]
    ReadFile(String, #[source] std::io::Error),

    #[error("invalid certificate {0}: {1}")]
    InvalidCertificate(String, #[source] reqwest::Error),
}

impl Error {
    /// Whether a retry of the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Transport(..) => true,
            Error::Status(_, code, _) => *code >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
