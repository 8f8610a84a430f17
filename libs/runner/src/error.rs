use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1}")]
    Api(String, #[source] piped_api_client::Error),

    #[error("{0}: {1}")]
    Git(String, #[source] piped_git::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported stage {0}")]
    UnsupportedStage(String),

    #[error("no planner registered for kind {0}")]
    UnsupportedKind(String),

    #[error("{0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("component {0} exited unexpectedly")]
    ComponentExited(&'static str),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
