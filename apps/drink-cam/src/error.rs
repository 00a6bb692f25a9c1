use signal_relay::RelayError;
use thiserror::Error;

use crate::controller::ControllerError;
use crate::media::CameraError;
use crate::protocol::ProtocolError;

/// Errors surfaced to whoever drives a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("signaling relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error("camera unavailable: {0}")]
    MediaAcquisitionDenied(#[from] CameraError),
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("access key required")]
    AccessRequired,
    #[error("access key rejected")]
    AccessDenied,
    #[error("room code not set")]
    MissingRoomCode,
    #[error("invalid room code: {0}")]
    InvalidRoomCode(#[source] ProtocolError),
    #[error("room code cannot change while the session is running")]
    Busy,
    #[error("session task has stopped")]
    Closed,
}

impl From<RelayError> for SessionError {
    fn from(err: RelayError) -> Self {
        SessionError::RelayUnavailable(err.to_string())
    }
}

impl From<ControllerError> for SessionError {
    fn from(err: ControllerError) -> Self {
        SessionError::NegotiationFailed(err.to_string())
    }
}
