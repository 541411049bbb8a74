//! Error types for syncq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown task group: {0}")]
    UnknownGroup(String),

    #[error("queue has been shut down")]
    ShutDown,

    #[error("queue already started")]
    AlreadyStarted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("destination error: {0}")]
    Destination(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
