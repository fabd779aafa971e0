#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Custom error type for media operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Incompatible: {0}")]
    Incompatible(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Mediasoup error: {0}")]
    MediasoupError(#[from] mediasoup::worker::RequestError),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Which way media flows over a transport, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[default]
    Audio,
    Video,
}

/// Transport information for signaling.
///
/// Connectivity parameters are kept as JSON so the session layer stays
/// independent of the engine's own types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Consumer information for signaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub producer_id: String,
    #[serde(rename = "consumerId")]
    pub id: String,
    #[serde(rename = "mediaKind")]
    pub kind: TrackKind,
    pub rtp_parameters: Value,
    pub consumer_type: String,
    pub producer_paused: bool,
}
