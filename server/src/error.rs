//! Errors local to one session
//!
//! None of these are fatal to the server. They are logged and the offending
//! message is dropped.

use crate::session::InGameStage;
use shared::FrameError;
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A second connection-established arrived for an established session
    AlreadyConnected,
    /// An application frame arrived before the handshake completed
    NotConnected,
    /// A request arrived before the session reached the stage it needs
    PrematureRequest {
        stage: InGameStage,
        required: InGameStage,
    },
    UnknownPeer(SocketAddr),
    /// A payload referenced an entity id no session owns
    UnknownEntity(u16),
    /// The connected-session limit is reached
    ServerFull,
    /// An outgoing payload could not be framed
    Encode(FrameError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyConnected => write!(f, "session already connected"),
            SessionError::NotConnected => write!(f, "session not connected"),
            SessionError::PrematureRequest { stage, required } => write!(
                f,
                "request needs stage {:?} but session is at {:?}",
                required, stage
            ),
            SessionError::UnknownPeer(addr) => write!(f, "no session for {}", addr),
            SessionError::UnknownEntity(id) => write!(f, "no entity with netview id {}", id),
            SessionError::ServerFull => write!(f, "server is full"),
            SessionError::Encode(e) => write!(f, "cannot encode frame: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        SessionError::Encode(e)
    }
}
