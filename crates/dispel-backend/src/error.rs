use dispel_core::{PacketError, WireError};

use crate::{console::ConsoleError, lobby::LobbyError, proxy::ProxyError, redirect::RedirectError};

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("user is not logged in")]
    UserNotLoggedIn,

    #[error("malformed packet: {0}")]
    PacketMalformed(#[from] PacketError),

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Lobby(#[from] LobbyError),

    #[error(transparent)]
    Redirect(#[from] RedirectError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("session closed")]
    Cancelled,
}

impl BackendError {
    /// Whether the session must be torn down.
    pub fn is_fatal(&self) -> bool {
        match self {
            BackendError::ProtocolViolation(_)
            | BackendError::UserNotLoggedIn
            | BackendError::Lobby(_)
            | BackendError::Io(_)
            | BackendError::Cancelled => true,
            BackendError::PacketMalformed(_)
            | BackendError::Console(_)
            | BackendError::Redirect(_)
            | BackendError::Proxy(_)
            | BackendError::Wire(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(BackendError::UserNotLoggedIn.is_fatal());
        assert!(BackendError::ProtocolViolation("bad key".into()).is_fatal());
        assert!(BackendError::Lobby(LobbyError::HandshakeRejected).is_fatal());
        assert!(!BackendError::PacketMalformed(PacketError::MissingTerminator).is_fatal());
        assert!(!BackendError::Console(ConsoleError::Timeout).is_fatal());
    }
}
