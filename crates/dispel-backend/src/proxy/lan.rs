use std::{net::Ipv4Addr, sync::Weak};

use dispel_core::{GameRoom, Player};
use parking_lot::{Mutex, RwLock};

use super::{
    CreateRoomParams, GameData, Proxy, ProxyError, announce_join, apply_membership, enter_room,
    membership, ready_room, register_room, upgrade,
};
use crate::{console::LobbyRoom, session::Session};

/// Players share a network: every address is used as-is.
pub struct LanProxy {
    session: Weak<Session>,
    lan_ip: Ipv4Addr,
    room: RwLock<Option<GameRoom>>,
    selected: Mutex<Option<GameData>>,
}

impl LanProxy {
    pub fn new(session: Weak<Session>, lan_ip: Ipv4Addr) -> Self {
        Self {
            session,
            lan_ip,
            room: RwLock::new(None),
            selected: Mutex::new(None),
        }
    }

    pub fn selected(&self) -> Option<GameData> {
        self.selected.lock().clone()
    }
}

#[tonic::async_trait]
impl Proxy for LanProxy {
    fn host_ip(&self, room: &LobbyRoom) -> Result<Ipv4Addr, ProxyError> {
        Ok(room.host_ip)
    }

    async fn create_room(&self, params: CreateRoomParams) -> Result<Ipv4Addr, ProxyError> {
        let session = upgrade(&self.session)?;
        let room = register_room(&session, params, self.lan_ip).await?;
        *self.room.write() = Some(room);
        Ok(self.lan_ip)
    }

    async fn host_room(&self, game_id: &str) -> Result<(), ProxyError> {
        let session = upgrade(&self.session)?;
        ready_room(&session, &self.room, game_id).await
    }

    fn select_game(&self, game: GameData) {
        *self.selected.lock() = Some(game);
    }

    async fn list_games(&self) -> Result<Vec<LobbyRoom>, ProxyError> {
        Ok(upgrade(&self.session)?.console().list_games().await?)
    }

    async fn get_game(&self, id: &str) -> Result<(LobbyRoom, Vec<Player>), ProxyError> {
        Ok(upgrade(&self.session)?.console().get_game(id).await?)
    }

    async fn join_game(&self, id: &str, password: &str) -> Result<Vec<Player>, ProxyError> {
        let session = upgrade(&self.session)?;
        let room = enter_room(&session, id, password, self.lan_ip).await?;
        announce_join(&session, &room, self.lan_ip).await?;
        let players = room.iter_players().cloned().collect();
        *self.room.write() = Some(room);
        Ok(players)
    }

    fn player_addr(&self, player: &Player) -> Result<Ipv4Addr, ProxyError> {
        player
            .ipv4()
            .ok_or_else(|| ProxyError::InvalidAddress(player.ip_address.clone()))
    }

    async fn join(&self, player: &Player) -> Result<Ipv4Addr, ProxyError> {
        self.player_addr(player)
    }

    async fn handle(&self, frame: &[u8]) -> Result<(), ProxyError> {
        let Some(room_id) = self.room.read().as_ref().map(|room| room.id().to_string()) else {
            return Ok(());
        };
        let Some(change) = membership(frame, &room_id)? else {
            return Ok(());
        };
        let self_id = upgrade(&self.session)?.user_id();
        if let Some(room) = self.room.write().as_mut() {
            apply_membership(room, &change, self_id);
        }
        Ok(())
    }

    async fn close(&self) {
        self.room.write().take();
        self.selected.lock().take();
    }

    fn room(&self) -> Option<GameRoom> {
        self.room.read().clone()
    }
}
