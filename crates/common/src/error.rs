//! Errors of the worker execution layer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The worker's command queue is closed
    #[error("Worker disconnected: {0}")]
    Disconnected(String),

    /// The worker dropped a reply slot without answering
    #[error("Worker dropped the reply")]
    NoReply,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Worker thread {0} panicked")]
    WorkerPanicked(String),
}

pub type Result<T> = std::result::Result<T, Error>;
