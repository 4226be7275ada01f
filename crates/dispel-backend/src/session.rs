//! State of one connected game client.

use std::{
    net::Ipv4Addr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use dispel_core::{
    Character, ClassType, EventType, Player, User, packet,
    packet::{PacketType, Writer},
    wire::{self, Chat, LobbyUsers},
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::{BackendConfig, ProxyMode},
    console::Console,
    error::BackendError,
    lobby::{LobbyClient, LobbyError, LobbyHandler},
    proxy::{self, Proxy},
};

/// `kind` of a 0x0F message shown with the system label.
pub const MESSAGE_SYSTEM: u32 = 1;

#[derive(Default)]
struct Identity {
    user: Option<User>,
    character: Option<Character>,
}

pub struct Session {
    id: Uuid,
    span: tracing::Span,
    identity: RwLock<Identity>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    lobby: RwLock<Option<Arc<LobbyClient>>>,
    lobby_users: RwLock<Vec<Player>>,
    proxy: Arc<dyn Proxy>,
    character_selected: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    console: Arc<dyn Console>,
    config: Arc<BackendConfig>,
}

impl Session {
    /// Create a session whose game-bound packets go to `outbound`.
    pub fn new(
        console: Arc<dyn Console>,
        config: Arc<BackendConfig>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let span = tracing::info_span!(
            "session",
            session_id = %id,
            user_id = tracing::field::Empty
        );
        let cancel = parent.child_token();

        Arc::new_cyclic(|me: &Weak<Session>| {
            let proxy = {
                let _entered = span.enter();
                proxy::build(me.clone(), &config, cancel.clone())
            };
            Self {
                id,
                span: span.clone(),
                identity: RwLock::new(Identity::default()),
                outbound,
                lobby: RwLock::new(None),
                lobby_users: RwLock::new(Vec::new()),
                proxy,
                character_selected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                cancel,
                console,
                config,
            }
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn console(&self) -> &Arc<dyn Console> {
        &self.console
    }

    pub fn proxy(&self) -> &Arc<dyn Proxy> {
        &self.proxy
    }

    /// Frame `payload` and queue it for the game client.
    pub fn send_packet(&self, ty: PacketType, payload: &[u8]) -> Result<(), BackendError> {
        let bytes = packet::encode(ty.opcode(), payload)?;
        self.outbound
            .send(bytes)
            .map_err(|_| BackendError::Cancelled)
    }

    /// Push a 0x0F chat line to the game client.
    pub fn send_message(&self, kind: u32, user: &str, text: &str) -> Result<(), BackendError> {
        let mut writer = Writer::new();
        writer.u32_le(kind).cstring(user).cstring(text);
        self.send_packet(PacketType::ReceiveMessage, &writer.into_inner())
    }

    pub fn set_user(&self, user: User) {
        self.span.record("user_id", user.id);
        self.identity.write().user = Some(user);
    }

    pub fn set_character(&self, character: Character) {
        self.identity.write().character = Some(character);
    }

    pub fn user(&self) -> Option<User> {
        self.identity.read().user.clone()
    }

    pub fn character(&self) -> Option<Character> {
        self.identity.read().character.clone()
    }

    /// Id of the logged-in user, `0` before login.
    pub fn user_id(&self) -> i64 {
        self.identity.read().user.as_ref().map_or(0, |user| user.id)
    }

    pub fn is_logged_in(&self) -> bool {
        self.identity.read().user.is_some()
    }

    /// Address other players should see for this session.
    pub fn self_ip(&self) -> Ipv4Addr {
        match self.config.mode {
            ProxyMode::Lan => self.config.lan_ip,
            ProxyMode::P2p | ProxyMode::Relay => Ipv4Addr::LOCALHOST,
        }
    }

    /// This session as a room member reachable at `ip`. Needs a user and a
    /// selected character.
    pub fn player(&self, ip: Ipv4Addr) -> Option<Player> {
        let identity = self.identity.read();
        let user = identity.user.as_ref()?;
        let character = identity.character.as_ref()?;
        let class_type = character.class_type().unwrap_or_else(|byte| {
            tracing::warn!(character = %character.name, class = byte, "Unknown class byte, reporting knight");
            ClassType::default()
        });
        Some(Player {
            user_id: user.id,
            username: user.username.clone(),
            character_id: character.id,
            class_type,
            ip_address: ip.to_string(),
        })
    }

    pub fn lobby_users(&self) -> Vec<Player> {
        self.lobby_users.read().clone()
    }

    pub fn lobby(&self) -> Option<Arc<LobbyClient>> {
        self.lobby.read().clone()
    }

    /// Open the lobby connection for the logged-in user.
    pub async fn connect_lobby(&self) -> Result<(), BackendError> {
        let user = self.user().ok_or(BackendError::UserNotLoggedIn)?;
        let client = LobbyClient::connect(&self.config.lobby_url, &user)
            .instrument(self.span.clone())
            .await?;
        let previous = self.lobby.write().replace(Arc::new(client));
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(())
    }

    pub async fn send_event<T: Serialize + Send>(
        &self,
        event: EventType,
        content: T,
    ) -> Result<(), LobbyError> {
        let lobby = self.lobby().ok_or(LobbyError::NotConnected)?;
        lobby.send_event(event, content).await
    }

    pub async fn send_event_to<T: Serialize + Send>(
        &self,
        event: EventType,
        content: T,
        to: &str,
    ) -> Result<(), LobbyError> {
        let lobby = self.lobby().ok_or(LobbyError::NotConnected)?;
        lobby.send_event_to(event, content, to).await
    }

    /// Join the lobby and start observing it. Only the first call after a
    /// character is selected has any effect.
    pub async fn on_character_selected(self: &Arc<Self>) -> Result<(), BackendError> {
        let lobby = self.lobby().ok_or(LobbyError::NotConnected)?;
        let me = self
            .player(self.self_ip())
            .ok_or(BackendError::UserNotLoggedIn)?;
        if self.character_selected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handlers: Vec<Arc<dyn LobbyHandler>> = vec![
            Arc::new(SessionEvents {
                session: Arc::downgrade(self),
            }),
            Arc::new(ProxyEvents {
                session: Arc::downgrade(self),
            }),
        ];
        let observer = lobby.observe(self.cancel.clone(), handlers, self.span.clone())?;
        lobby.send_event(EventType::JoinLobby, me).await?;

        let session = Arc::downgrade(self);
        tokio::spawn(
            async move {
                let result = observer
                    .await
                    .unwrap_or(Err(LobbyError::Closed));
                if let (Err(err), Some(session)) = (result, session.upgrade()) {
                    tracing::warn!(error = %err, "Lobby connection lost");
                    session.cancel.cancel();
                }
            }
            .instrument(self.span.clone()),
        );
        tracing::info!(user_id = self.user_id(), "Joined lobby");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Leave the room and the lobby. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.proxy.close().await;
        let lobby = self.lobby.write().take();
        if let Some(lobby) = lobby {
            if let Some(me) = self.player(self.self_ip()) {
                if let Err(err) = lobby.send_event(EventType::LeaveLobby, me).await {
                    tracing::debug!(error = %err, "Could not announce leaving the lobby");
                }
            }
            lobby.close().await;
        }
        self.cancel.cancel();
        tracing::info!("Session closed");
    }
}

/// Lobby roster and chat.
struct SessionEvents {
    session: Weak<Session>,
}

#[tonic::async_trait]
impl LobbyHandler for SessionEvents {
    async fn handle(&self, frame: &[u8]) -> Result<(), BackendError> {
        let Some(session) = self.session.upgrade() else {
            return Err(BackendError::Cancelled);
        };
        let Ok(event) = wire::decode_event(frame) else {
            return Ok(());
        };
        match event {
            EventType::LobbyUsers => {
                let (_, message) = wire::decode::<LobbyUsers>(frame)?;
                tracing::debug!(count = message.content.players.len(), "Lobby roster");
                *session.lobby_users.write() = message.content.players;
            }
            EventType::JoinLobby | EventType::JoinedLobby => {
                let (_, message) = wire::decode::<Player>(frame)?;
                let player = message.content;
                let mut users = session.lobby_users.write();
                match users.iter_mut().find(|p| p.user_id == player.user_id) {
                    Some(existing) => *existing = player,
                    None => users.push(player),
                }
            }
            EventType::LeaveLobby => {
                let (_, message) = wire::decode::<Player>(frame)?;
                session
                    .lobby_users
                    .write()
                    .retain(|p| p.user_id != message.content.user_id);
            }
            EventType::Chat => {
                let (_, message) = wire::decode::<Chat>(frame)?;
                session.send_message(MESSAGE_SYSTEM, &message.content.user, &message.content.text)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Hands lobby frames to the session's proxy.
struct ProxyEvents {
    session: Weak<Session>,
}

#[tonic::async_trait]
impl LobbyHandler for ProxyEvents {
    async fn handle(&self, frame: &[u8]) -> Result<(), BackendError> {
        let Some(session) = self.session.upgrade() else {
            return Err(BackendError::Cancelled);
        };
        let proxy = session.proxy().clone();
        proxy.handle(frame).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use dispel_core::{Character, User, model::CLASS_TYPE_OFFSET, model::STATS_LEN};

    use super::*;
    use crate::console::memory::MemoryConsole;

    pub fn character(id: i64, name: &str, class: u8) -> Character {
        let mut stats = [0u8; STATS_LEN];
        stats[CLASS_TYPE_OFFSET] = class;
        Character::new(id, name, stats)
    }

    pub fn user(id: i64, username: &str) -> User {
        User {
            id,
            username: username.to_string(),
            version: "test".to_string(),
        }
    }

    /// A LAN-mode session over `console` and the packets it sends.
    pub fn session(
        console: Arc<MemoryConsole>,
        config: BackendConfig,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(console, Arc::new(config), tx, &CancellationToken::new());
        (session, rx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dispel_core::{ClassType, MessageContent};

    use super::{testing::*, *};
    use crate::{console::memory::MemoryConsole, lobby::hub::FakeHub};

    fn lan_config(hub: &FakeHub) -> BackendConfig {
        BackendConfig {
            lobby_url: hub.url(),
            mode: ProxyMode::Lan,
            lan_ip: Ipv4Addr::new(192, 168, 1, 10),
            ..BackendConfig::default()
        }
    }

    async fn next_packet(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_identity_and_player() {
        let hub = FakeHub::start().await;
        let (session, _rx) = session(Arc::new(MemoryConsole::new()), lan_config(&hub));
        assert_eq!(session.user_id(), 0);
        assert!(!session.is_logged_in());
        assert!(session.player(Ipv4Addr::LOCALHOST).is_none());

        session.set_user(user(4, "alice"));
        assert!(session.player(Ipv4Addr::LOCALHOST).is_none());
        session.set_character(character(40, "mage", 3));

        let player = session.player(session.self_ip()).unwrap();
        assert_eq!(player.user_id, 4);
        assert_eq!(player.character_id, 40);
        assert_eq!(player.class_type, ClassType::Mage);
        assert_eq!(player.ip_address, "192.168.1.10");
    }

    #[tokio::test]
    async fn test_unknown_class_byte_reports_knight() {
        let hub = FakeHub::start().await;
        let (session, _rx) = session(Arc::new(MemoryConsole::new()), lan_config(&hub));
        session.set_user(user(4, "alice"));
        session.set_character(character(41, "odd", 9));

        let player = session.player(Ipv4Addr::LOCALHOST).unwrap();
        assert_eq!(player.class_type, ClassType::Knight);
        assert_eq!(player.character_id, 41);
    }

    #[tokio::test]
    async fn test_send_message_framing() {
        let hub = FakeHub::start().await;
        let (session, mut rx) = session(Arc::new(MemoryConsole::new()), lan_config(&hub));
        session.send_message(MESSAGE_SYSTEM, "bob", "hi").unwrap();

        let bytes = next_packet(&mut rx).await;
        assert_eq!(bytes[..4], [0xFF, PacketType::ReceiveMessage.opcode(), 15, 0]);
        assert_eq!(&bytes[4..], b"\x01\x00\x00\x00bob\0hi\0");
    }

    #[tokio::test]
    async fn test_character_selection_joins_lobby_once() {
        let hub = FakeHub::start().await;
        let (session, _rx) = session(Arc::new(MemoryConsole::new()), lan_config(&hub));
        session.set_user(user(4, "alice"));
        session.set_character(character(40, "mage", 2));

        assert!(matches!(
            session.on_character_selected().await,
            Err(BackendError::Lobby(LobbyError::NotConnected))
        ));

        session.connect_lobby().await.unwrap();
        session.on_character_selected().await.unwrap();
        session.on_character_selected().await.unwrap();
        hub.wait_until("join lobby sent", |hub| {
            hub.frames_from("4", EventType::JoinLobby).len() == 1
        })
        .await;

        let roster = wire::compose(
            EventType::LobbyUsers,
            &MessageContent::new(LobbyUsers {
                players: vec![session.player(Ipv4Addr::LOCALHOST).unwrap()],
            }),
        )
        .unwrap();
        hub.push("4", roster);
        for _ in 0..200 {
            if !session.lobby_users().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.lobby_users().len(), 1);

        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert!(session.cancel_token().is_cancelled());
        hub.wait_until("leave lobby sent", |hub| {
            hub.frames_from("4", EventType::LeaveLobby).len() == 1
        })
        .await;
    }

    #[tokio::test]
    async fn test_lobby_chat_reaches_game() {
        let hub = FakeHub::start().await;
        let (session, mut rx) = session(Arc::new(MemoryConsole::new()), lan_config(&hub));
        session.set_user(user(4, "alice"));
        session.set_character(character(40, "mage", 2));
        session.connect_lobby().await.unwrap();
        session.on_character_selected().await.unwrap();
        hub.wait_until("connected", |hub| hub.is_connected("4")).await;

        let chat = wire::compose(
            EventType::Chat,
            &MessageContent::new(Chat {
                user: "bob".to_string(),
                text: "hello".to_string(),
            }),
        )
        .unwrap();
        hub.push("4", chat);

        let bytes = next_packet(&mut rx).await;
        assert_eq!(bytes[1], PacketType::ReceiveMessage.opcode());
        assert_eq!(&bytes[4..], b"\x01\x00\x00\x00bob\0hello\0");
        session.close().await;
    }

    #[tokio::test]
    async fn test_lobby_loss_cancels_session() {
        let hub = FakeHub::start().await;
        let (session, _rx) = session(Arc::new(MemoryConsole::new()), lan_config(&hub));
        session.set_user(user(4, "alice"));
        session.set_character(character(40, "mage", 2));
        session.connect_lobby().await.unwrap();
        session.on_character_selected().await.unwrap();
        hub.wait_until("connected", |hub| hub.is_connected("4")).await;

        hub.kick_all();
        tokio::time::timeout(Duration::from_secs(5), session.cancel_token().cancelled())
            .await
            .unwrap();
    }
}
