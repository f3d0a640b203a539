use shared::ProtocolError;
use std::io;
use thiserror::Error;

/// Errors raised anywhere in the server.
///
/// Only `Bind` and `Config` are fatal, and only at startup. Everything else
/// is contained by the connection or tick that produced it.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("session {session_id} is full ({capacity} players)")]
    Capacity { session_id: u32, capacity: usize },

    #[error("session {0} is no longer accepting players")]
    SessionClosed(u32),

    #[error("no free cell found after {attempts} placement attempts")]
    NoSpace { attempts: usize },

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ServerError {
    /// Errors the matchmaker treats as "try the next session".
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            ServerError::Capacity { .. } | ServerError::SessionClosed(_)
        )
    }
}
