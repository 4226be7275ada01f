use std::sync::Arc;

use dispel_core::{EventType, wire::Chat};

use crate::{error::BackendError, session::Session};

/// Longest lobby line the game can display.
pub const MAX_MESSAGE_LEN: usize = 87;

/// 0x0E: forward a lobby line to everyone in the lobby.
pub async fn send_lobby_message(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_end_matches('\0');
    if text.is_empty() || text.len() > MAX_MESSAGE_LEN {
        tracing::debug!(len = text.len(), "Dropping lobby message");
        return Ok(());
    }

    let user = session.user().map(|user| user.username).unwrap_or_default();
    session
        .send_event(
            EventType::Chat,
            Chat {
                user,
                text: text.to_string(),
            },
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use dispel_core::{MessageContent, PacketType, wire};

    use super::*;
    use crate::{
        config::BackendConfig,
        console::memory::MemoryConsole,
        handlers::testing::call,
        lobby::hub::FakeHub,
        session::testing::{session, user},
    };

    #[tokio::test]
    async fn test_lobby_message_is_forwarded() {
        let hub = FakeHub::start().await;
        let config = BackendConfig {
            lobby_url: hub.url(),
            ..BackendConfig::default()
        };
        let (session, _rx) = session(Arc::new(MemoryConsole::new()), config);
        session.set_user(user(3, "jp"));
        session.connect_lobby().await.unwrap();

        call(&session, PacketType::SendLobbyMessage, b"hello\0").await.unwrap();
        call(&session, PacketType::SendLobbyMessage, b"\0").await.unwrap();
        let mut long = vec![b'a'; MAX_MESSAGE_LEN + 1];
        long.push(0);
        call(&session, PacketType::SendLobbyMessage, &long).await.unwrap();

        hub.wait_until("chat frame", |hub| {
            !hub.frames_from("3", EventType::Chat).is_empty()
        })
        .await;
        let frames = hub.frames_from("3", EventType::Chat);
        assert_eq!(frames.len(), 1);
        let (_, message): (_, MessageContent<Chat>) = wire::decode(&frames[0]).unwrap();
        assert_eq!(message.content.user, "jp");
        assert_eq!(message.content.text, "hello");
        session.close().await;
    }

    #[tokio::test]
    async fn test_lobby_message_without_lobby_is_an_error() {
        let (session, _rx) = session(Arc::new(MemoryConsole::new()), BackendConfig::default());
        session.set_user(user(3, "jp"));
        let err = call(&session, PacketType::SendLobbyMessage, b"hi\0")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Lobby(_)));
    }
}
