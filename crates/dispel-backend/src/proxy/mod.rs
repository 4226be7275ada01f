//! How game traffic reaches the other players of a room.
//!
//! [`Proxy`] has three strategies: [`lan::LanProxy`] lets game clients talk
//! directly, [`p2p::P2pProxy`] tunnels through WebRTC data channels and
//! [`relay::RelayProxy`] through a central relay server.

pub mod lan;
pub mod p2p;
pub mod relay;

use std::{
    net::Ipv4Addr,
    sync::{Arc, Weak},
};

use dispel_core::{
    EventType, GameRoom, IpRingError, PacketError, Player, RoomError, WireError,
    packet::{PacketType, Writer},
    wire::{self, Room, RoomMember},
};
use dispel_relay::RelayError;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{BackendConfig, ProxyMode},
    console::{ConsoleError, LobbyRoom, NewGame},
    hosts::HostError,
    lobby::LobbyError,
    redirect::RedirectError,
    session::Session,
};

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("session is closed")]
    SessionClosed,

    #[error("not in a game room")]
    NoRoom,

    #[error("wrong password for room {0}")]
    WrongPassword(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("invalid player address '{0}'")]
    InvalidAddress(String),

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Lobby(#[from] LobbyError),

    #[error(transparent)]
    Redirect(#[from] RedirectError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    IpRing(#[from] IpRingError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("relay: {0}")]
    Relay(#[from] RelayError),
}

/// Room parameters sent by the game on the host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRoomParams {
    pub name: String,
    pub password: String,
    pub map_id: u32,
}

/// A room picked from the list on the guest path, before joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameData {
    pub room: LobbyRoom,
    pub players: Vec<Player>,
}

#[tonic::async_trait]
pub trait Proxy: Send + Sync {
    /// Address the game should use for the host of `room`.
    fn host_ip(&self, room: &LobbyRoom) -> Result<Ipv4Addr, ProxyError>;

    /// Register a new room hosted by this session. Returns the address
    /// presented to the game for the host.
    async fn create_room(&self, params: CreateRoomParams) -> Result<Ipv4Addr, ProxyError>;

    /// Announce that the hosted room is ready.
    async fn host_room(&self, game_id: &str) -> Result<(), ProxyError>;

    fn select_game(&self, game: GameData);

    async fn list_games(&self) -> Result<Vec<LobbyRoom>, ProxyError>;

    async fn get_game(&self, id: &str) -> Result<(LobbyRoom, Vec<Player>), ProxyError>;

    /// Join a room and return its members.
    async fn join_game(&self, id: &str, password: &str) -> Result<Vec<Player>, ProxyError>;

    /// Address the game should use for `player`.
    fn player_addr(&self, player: &Player) -> Result<Ipv4Addr, ProxyError>;

    /// Make `player` reachable and return its address.
    async fn join(&self, player: &Player) -> Result<Ipv4Addr, ProxyError>;

    /// React to a lobby frame.
    async fn handle(&self, frame: &[u8]) -> Result<(), ProxyError>;

    async fn close(&self);

    fn room(&self) -> Option<GameRoom>;
}

pub fn build(
    session: Weak<Session>,
    config: &BackendConfig,
    cancel: CancellationToken,
) -> Arc<dyn Proxy> {
    match config.mode {
        ProxyMode::Lan => Arc::new(lan::LanProxy::new(session, config.lan_ip)),
        ProxyMode::P2p => p2p::P2pProxy::new(session, config, cancel),
        ProxyMode::Relay => relay::RelayProxy::new(session, config, cancel),
    }
}

fn upgrade(session: &Weak<Session>) -> Result<Arc<Session>, ProxyError> {
    session.upgrade().ok_or(ProxyError::SessionClosed)
}

/// Register a room with the console and announce it in the lobby.
async fn register_room(
    session: &Session,
    params: CreateRoomParams,
    host_ip: Ipv4Addr,
) -> Result<GameRoom, ProxyError> {
    let host = session.player(host_ip).ok_or(ProxyError::SessionClosed)?;
    let lobby_room = session
        .console()
        .create_game(NewGame {
            user_id: host.user_id,
            name: params.name.clone(),
            password: params.password.clone(),
            map_id: params.map_id,
            host_ip,
        })
        .await?;

    session
        .send_event(
            EventType::CreateRoom,
            Room {
                name: params.name.clone(),
                password: params.password.clone(),
                map_id: params.map_id,
                host: host.clone(),
            },
        )
        .await?;

    tracing::info!(game_id = %lobby_room.id, map_id = params.map_id, "Room created");
    Ok(GameRoom::new(
        lobby_room.id,
        params.name,
        params.password,
        params.map_id,
        host,
    ))
}

/// Mark the room ready and announce it. Only the first call announces.
async fn ready_room(
    session: &Session,
    room: &RwLock<Option<GameRoom>>,
    game_id: &str,
) -> Result<(), ProxyError> {
    let ready = {
        let mut guard = room.write();
        let room = guard
            .as_mut()
            .filter(|room| room.id() == game_id)
            .ok_or(ProxyError::NoRoom)?;
        room.mark_ready().then(|| room.clone())
    };
    let Some(room) = ready else {
        return Ok(());
    };
    session
        .send_event(
            EventType::SetRoomReady,
            Room {
                name: room.name().to_string(),
                password: room.password().to_string(),
                map_id: room.map_id(),
                host: room.host_player().clone(),
            },
        )
        .await?;
    tracing::info!(game_id = %room.id(), "Room ready");
    Ok(())
}

/// Join `id` at the console and build the local view of the room.
async fn enter_room(
    session: &Session,
    id: &str,
    password: &str,
    self_ip: Ipv4Addr,
) -> Result<GameRoom, ProxyError> {
    let me = session.player(self_ip).ok_or(ProxyError::SessionClosed)?;
    let (lobby_room, _) = session.console().get_game(id).await?;
    if !lobby_room.password.is_empty() && lobby_room.password != password {
        return Err(ProxyError::WrongPassword(id.to_string()));
    }

    let players = session
        .console()
        .join_game(me.user_id, me.character_id, id, self_ip)
        .await?;

    let host = players
        .iter()
        .find(|p| p.user_id == lobby_room.host_user_id)
        .cloned()
        .unwrap_or_else(|| Player {
            user_id: lobby_room.host_user_id,
            ip_address: lobby_room.host_ip.to_string(),
            ..Player::default()
        });
    let mut room = GameRoom::new(
        lobby_room.id,
        lobby_room.name,
        lobby_room.password,
        lobby_room.map_id,
        host,
    );
    for player in players {
        room.add_player(player);
    }
    room.add_player(me);
    Ok(room)
}

/// Tell the lobby this session entered `room`.
async fn announce_join(session: &Session, room: &GameRoom, self_ip: Ipv4Addr) -> Result<(), ProxyError> {
    let me = session.player(self_ip).ok_or(ProxyError::SessionClosed)?;
    session
        .send_event(
            EventType::JoinRoom,
            RoomMember {
                member: me,
                room_name: room.id().to_string(),
            },
        )
        .await?;
    Ok(())
}

/// Membership change carried by a lobby frame.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Membership {
    Joined(Player),
    Left(Player),
    HostChanged(Player),
}

/// Decode room membership events addressed to `room_id`.
fn membership(frame: &[u8], room_id: &str) -> Result<Option<Membership>, ProxyError> {
    let event = match wire::decode_event(frame) {
        Ok(event) => event,
        Err(WireError::UnknownEvent(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(match event {
        EventType::JoinRoom | EventType::LeaveRoom => {
            let (_, message) = wire::decode::<RoomMember>(frame)?;
            if message.content.room_name != room_id {
                return Ok(None);
            }
            let member = message.content.member;
            Some(if event == EventType::JoinRoom {
                Membership::Joined(member)
            } else {
                Membership::Left(member)
            })
        }
        EventType::HostMigration => {
            let (_, message) = wire::decode::<wire::HostMigration>(frame)?;
            (message.content.game_id == room_id)
                .then_some(Membership::HostChanged(message.content.new_host))
        }
        _ => None,
    })
}

/// Apply a membership change, ignoring our own echoes.
fn apply_membership(room: &mut GameRoom, change: &Membership, self_id: i64) {
    match change {
        Membership::Joined(player) if player.user_id != self_id => {
            if room.add_player(player.clone()) {
                tracing::info!(game_id = %room.id(), user_id = player.user_id, "Player joined room");
            }
        }
        Membership::Left(player) if player.user_id != self_id => {
            match room.remove_player(player.user_id) {
                Ok(_) => tracing::info!(game_id = %room.id(), user_id = player.user_id, "Player left room"),
                Err(err) => tracing::debug!(game_id = %room.id(), error = %err, "Ignoring leave"),
            }
        }
        Membership::HostChanged(player) => {
            room.migrate_host(player.clone());
            tracing::info!(game_id = %room.id(), user_id = player.user_id, "Host migrated");
        }
        _ => {}
    }
}

/// Body of the 0x47 push telling the game who hosts now.
fn host_migration_payload(is_host: bool, host_ip: Ipv4Addr) -> Vec<u8> {
    let mut writer = Writer::new();
    writer.u32_le(u32::from(is_host)).ipv4(host_ip);
    writer.into_inner()
}

fn notify_host_migration(session: &Session, is_host: bool, host_ip: Ipv4Addr) {
    let payload = host_migration_payload(is_host, host_ip);
    if let Err(err) = session.send_packet(PacketType::HostMigration, &payload) {
        tracing::warn!(error = %err, "Could not notify game of host migration");
    }
}
