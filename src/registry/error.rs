use std::time::Duration;

use thiserror::Error;

use super::metadata::MetadataError;
use crate::session::SessionError;
use crate::tmux::MultiplexerError;

/// Errors surfaced by the session registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Maximum sessions reached ({max}), try again later")]
    CapacityExceeded { max: usize },

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Shutdown did not finish within {0:?}")]
    DeadlineExceeded(Duration),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Multiplexer(#[from] MultiplexerError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
