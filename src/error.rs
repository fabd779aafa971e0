#![forbid(unsafe_code)]

// Domain error taxonomy shared by the registry, admission, media and signaling layers

use serde::Serialize;
use thiserror::Error;

use crate::media::types::MediaError;
use crate::store::StoreError;

/// Errors returned by room, playlist and media operations.
///
/// Everything except `Unavailable` is reported to the calling client only.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Incompatible: {0}")]
    Incompatible(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The media engine rejected or failed a request
    #[error("Media engine error: {0}")]
    Engine(String),
}

/// Wire name of an error, sent in `error` replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Incompatible,
    Unavailable,
    BadRequest,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Incompatible(_) => ErrorKind::Incompatible,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Store(_) | Error::Engine(_) => ErrorKind::Internal,
        }
    }
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::RoomNotFound(id) => Error::NotFound(format!("media session for room {id}")),
            MediaError::ResourceNotFound(what) => Error::NotFound(what),
            MediaError::InvalidState(msg) => Error::InvalidState(msg),
            MediaError::Incompatible(msg) => Error::Incompatible(msg),
            MediaError::WorkerError(msg) => Error::Unavailable(msg),
            MediaError::InvalidParameters(msg) => Error::BadRequest(msg),
            other => Error::Engine(other.to_string()),
        }
    }
}

/// Result type alias for domain operations
pub type Result<T> = std::result::Result<T, Error>;
