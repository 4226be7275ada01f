use std::sync::Arc;

use dispel_core::{
    PacketType, Player,
    packet::{REPLY_OK, Reader, Writer},
};

use super::CHANNEL_NAME;
use crate::{
    error::BackendError,
    proxy::{CreateRoomParams, GameData, Proxy},
    session::Session,
};

const ROOM_CREATED: [u8; 4] = [1, 0, 0, 0];
const ROOM_HOSTED: [u8; 4] = [2, 0, 0, 0];
/// Fixed state word leading a join reply.
const JOIN_STATE: u16 = 2;

/// `{class, address, name}` for every room member except `self_id`.
fn write_players(writer: &mut Writer, proxy: &dyn Proxy, players: &[Player], self_id: i64) {
    for player in players.iter().filter(|p| p.user_id != self_id) {
        match proxy.player_addr(player) {
            Ok(ip) => {
                writer
                    .u32_le(u32::from(player.class_type))
                    .ipv4(ip)
                    .cstring(&player.username);
            }
            Err(err) => {
                tracing::warn!(user_id = player.user_id, error = %err, "Skipping unreachable player");
            }
        }
    }
}

/// The game only knows room names. Map one to the console id.
async fn resolve_game_id(session: &Session, name: &str) -> String {
    match session.proxy().list_games().await {
        Ok(games) => games
            .into_iter()
            .find(|room| room.name == name)
            .map_or_else(|| name.to_string(), |room| room.id),
        Err(err) => {
            tracing::debug!(error = %err, "Could not resolve game id, using name");
            name.to_string()
        }
    }
}

/// 0x09
pub async fn list_games(session: &Arc<Session>) -> Result<(), BackendError> {
    let proxy = session.proxy();
    let games = match proxy.list_games().await {
        Ok(games) => games,
        Err(err) => {
            tracing::warn!(error = %err, "Could not list games");
            Vec::new()
        }
    };

    let mut entries = Writer::new();
    let mut count = 0u32;
    for room in &games {
        match proxy.host_ip(room) {
            Ok(ip) => {
                entries.ipv4(ip).cstring(&room.name).cstring(&room.password);
                count += 1;
            }
            Err(err) => {
                tracing::warn!(game_id = %room.id, error = %err, "Skipping game without host address");
            }
        }
    }

    let mut writer = Writer::new();
    writer.u32_le(count).bytes(&entries.into_inner());
    session.send_packet(PacketType::ListGames, &writer.into_inner())
}

/// 0x0B
pub fn list_channels(session: &Arc<Session>) -> Result<(), BackendError> {
    let mut writer = Writer::new();
    writer.cstring(CHANNEL_NAME);
    session.send_packet(PacketType::ListChannels, &writer.into_inner())
}

/// 0x15
pub fn ping(session: &Arc<Session>, _payload: &[u8]) -> Result<(), BackendError> {
    session.send_packet(PacketType::PingClockTime, &REPLY_OK)
}

/// 0x1C: state 0 registers the room, state 1 says the game is hosting it.
pub async fn create_game(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = Reader::new(payload);
    let state = reader.u32_le("state")?;
    let map_id = reader.u32_le("map id")?;
    let name = reader.cstring()?;
    let password = reader.optional_cstring()?.unwrap_or_default();
    let proxy = session.proxy();

    match state {
        0 => {
            let params = CreateRoomParams {
                name: name.clone(),
                password,
                map_id,
            };
            let reply = match proxy.create_room(params).await {
                Ok(ip) => {
                    tracing::info!(game = %name, %ip, map_id, "Game created");
                    ROOM_CREATED
                }
                Err(err) => {
                    tracing::warn!(game = %name, error = %err, "Could not create game");
                    ROOM_HOSTED
                }
            };
            session.send_packet(PacketType::CreateGame, &reply)
        }
        1 => {
            let game_id = proxy
                .room()
                .filter(|room| room.name() == name)
                .map_or_else(|| name.clone(), |room| room.id().to_string());
            if let Err(err) = proxy.host_room(&game_id).await {
                tracing::warn!(%game_id, error = %err, "Could not host game");
            }
            session.send_packet(PacketType::CreateGame, &ROOM_HOSTED)
        }
        other => {
            tracing::warn!(state = other, game = %name, "Unknown create game state");
            Ok(())
        }
    }
}

/// 0x22
pub async fn join_game(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = Reader::new(payload);
    let name = reader.cstring()?;
    let password = reader.optional_cstring()?.unwrap_or_default();

    let game_id = resolve_game_id(session, &name).await;
    let proxy = session.proxy();
    let players = match proxy.join_game(&game_id, &password).await {
        Ok(players) => players,
        Err(err) => {
            tracing::warn!(%game_id, error = %err, "Could not join game");
            return Ok(());
        }
    };

    let mut writer = Writer::new();
    writer.u16_le(JOIN_STATE);
    write_players(&mut writer, proxy.as_ref(), &players, session.user_id());
    tracing::info!(%game_id, players = players.len(), "Joined game");
    session.send_packet(PacketType::JoinGame, &writer.into_inner())
}

/// 0x45: preview a room before joining it.
pub async fn select_game(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = Reader::new(payload);
    let name = reader.cstring()?;

    let game_id = resolve_game_id(session, &name).await;
    let proxy = session.proxy();
    let (room, players) = match proxy.get_game(&game_id).await {
        Ok(game) => game,
        Err(err) => {
            tracing::warn!(%game_id, error = %err, "Could not select game");
            return Ok(());
        }
    };

    let mut writer = Writer::new();
    writer.u32_le(room.map_id);
    write_players(&mut writer, proxy.as_ref(), &players, session.user_id());
    proxy.select_game(GameData { room, players });
    session.send_packet(PacketType::SelectGame, &writer.into_inner())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dispel_core::{ClassType, packet};

    use super::*;
    use crate::{
        config::{BackendConfig, ProxyMode},
        console::{LobbyRoom, memory::MemoryConsole},
        handlers::testing::{call, drain},
        session::testing::{character, session, user},
    };

    fn retreat(password: &str) -> LobbyRoom {
        LobbyRoom {
            id: "g-17".to_string(),
            name: "retreat".to_string(),
            password: password.to_string(),
            map_id: 4,
            host_user_id: 1,
            host_ip: Ipv4Addr::new(10, 0, 0, 1),
        }
    }

    fn member(user_id: i64, username: &str, class_type: ClassType, ip: &str) -> Player {
        Player {
            user_id,
            username: username.to_string(),
            character_id: user_id * 10,
            class_type,
            ip_address: ip.to_string(),
        }
    }

    fn lan_session(
        console: MemoryConsole,
    ) -> (Arc<Session>, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let config = BackendConfig {
            mode: ProxyMode::Lan,
            lan_ip: Ipv4Addr::new(10, 0, 0, 3),
            ..BackendConfig::default()
        };
        let (session, rx) = session(Arc::new(console), config);
        session.set_user(user(3, "jp"));
        session.set_character(character(30, "warrior", 1));
        (session, rx)
    }

    #[tokio::test]
    async fn test_select_game_lists_other_players() {
        let console = MemoryConsole::new().with_game(
            retreat(""),
            vec![
                member(1, "host", ClassType::Knight, "10.0.0.1"),
                member(3, "jp", ClassType::Warrior, "10.0.0.3"),
            ],
        );
        let (session, mut rx) = lan_session(console);
        call(&session, PacketType::SelectGame, b"retreat\0").await.unwrap();

        let mut body = vec![4, 0, 0, 0, 0, 0, 0, 0, 10, 0, 0, 1];
        body.extend_from_slice(b"host\0");
        assert_eq!(
            drain(&mut rx),
            vec![packet::encode(PacketType::SelectGame.opcode(), &body).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_select_unknown_game_is_silent() {
        let (session, mut rx) = lan_session(MemoryConsole::new());
        call(&session, PacketType::SelectGame, b"nowhere\0").await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_with_wrong_password_is_silent() {
        let console = MemoryConsole::new().with_game(
            retreat("secret"),
            vec![member(1, "host", ClassType::Knight, "10.0.0.1")],
        );
        let (session, mut rx) = lan_session(console);
        call(&session, PacketType::JoinGame, b"retreat\0guess\0").await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(session.proxy().room().is_none());
    }

    #[tokio::test]
    async fn test_unknown_create_state_is_ignored() {
        let (session, mut rx) = lan_session(MemoryConsole::new());
        let mut payload = vec![7, 0, 0, 0, 1, 0, 0, 0];
        payload.extend_from_slice(b"room\0");
        call(&session, PacketType::CreateGame, &payload).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_resolve_game_id_by_name() {
        let (session, _rx) = lan_session(MemoryConsole::new().with_game(retreat(""), Vec::new()));
        assert_eq!(resolve_game_id(&session, "retreat").await, "g-17");
        assert_eq!(resolve_game_id(&session, "other").await, "other");
    }
}
