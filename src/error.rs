use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds surfaced by configuration, routing and response handling.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("can't find a docs directory at {}", .0.display())]
    InvalidDocsDir(PathBuf),

    #[error("unable to find the interpreter directory at {}", .0.display())]
    InterpreterDirNotFound(PathBuf),

    #[error("sorry, \"{0}\" is not a valid file extension")]
    InvalidFileExtension(String),

    #[error("can't find the stylesheet compiler at {}", .0.display())]
    NoCompilerFound(PathBuf),

    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),

    #[error("{} exited with {status}", .program.display())]
    ProcessFailed {
        program: PathBuf,
        status: std::process::ExitStatus,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] serde_json::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
