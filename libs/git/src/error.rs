use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("git io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("git {args} exited with {code:?}: {stderr}")]
    Command {
        args: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse git output: {0}")]
    Parse(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
