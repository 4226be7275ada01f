use crate::model::Player;

/// A named game session with a designated host.
///
/// The host is always a member; the remaining members are kept in join
/// order so the game client sees a stable player list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameRoom {
    id: String,
    name: String,
    password: String,
    map_id: u32,
    ready: bool,
    host: Player,
    other_players: Vec<Player>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Player not found in the room: {0}")]
    PlayerNotFound(i64),

    #[error("Room host can not leave without a migration")]
    HostCanNotLeave,
}

impl GameRoom {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        password: impl Into<String>,
        map_id: u32,
        host: Player,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            password: password.into(),
            map_id,
            ready: false,
            host,
            other_players: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Flip the room to ready. Returns `false` if it already was.
    pub fn mark_ready(&mut self) -> bool {
        if self.ready {
            false
        } else {
            self.ready = true;
            true
        }
    }

    pub fn host_player(&self) -> &Player {
        &self.host
    }

    pub fn is_host(&self, user_id: i64) -> bool {
        self.host.user_id == user_id
    }

    pub fn count_players(&self) -> usize {
        1 + self.other_players.len()
    }

    pub fn iter_players(&self) -> impl Iterator<Item = &Player> {
        std::iter::once(&self.host).chain(self.other_players.iter())
    }

    pub fn iter_other_players(&self) -> impl Iterator<Item = &Player> {
        self.other_players.iter()
    }

    pub fn has_player(&self, user_id: i64) -> bool {
        self.iter_players().any(|p| p.user_id == user_id)
    }

    pub fn player(&self, user_id: i64) -> Option<&Player> {
        self.iter_players().find(|p| p.user_id == user_id)
    }

    /// Add a member, replacing the stored record if the user is already in.
    /// Returns `true` when the user was not a member before.
    pub fn add_player(&mut self, player: Player) -> bool {
        if self.host.user_id == player.user_id {
            self.host = player;
            return false;
        }
        if let Some(existing) = self
            .other_players
            .iter_mut()
            .find(|p| p.user_id == player.user_id)
        {
            *existing = player;
            return false;
        }
        self.other_players.push(player);
        true
    }

    pub fn remove_player(&mut self, user_id: i64) -> Result<Player, RoomError> {
        if self.host.user_id == user_id {
            return Err(RoomError::HostCanNotLeave);
        }
        let position = self
            .other_players
            .iter()
            .position(|p| p.user_id == user_id)
            .ok_or(RoomError::PlayerNotFound(user_id))?;
        Ok(self.other_players.remove(position))
    }

    /// Hand the room over to `new_host` and drop the previous host.
    /// Returns the previous host, or `None` if `new_host` already hosts.
    pub fn migrate_host(&mut self, new_host: Player) -> Option<Player> {
        if self.host.user_id == new_host.user_id {
            self.host = new_host;
            return None;
        }
        self.other_players.retain(|p| p.user_id != new_host.user_id);
        Some(std::mem::replace(&mut self.host, new_host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassType;

    fn player(user_id: i64, name: &str) -> Player {
        Player {
            user_id,
            username: name.to_string(),
            character_id: user_id,
            class_type: ClassType::Knight,
            ip_address: format!("192.168.0.{user_id}"),
        }
    }

    fn create_test_room() -> GameRoom {
        GameRoom::new("retreat", "retreat", "", 3, player(1, "host"))
    }

    #[test]
    fn test_add_player_idempotent() {
        let mut room = create_test_room();
        assert!(room.add_player(player(2, "archer")));
        assert!(!room.add_player(player(2, "archer")));
        assert!(!room.add_player(player(1, "host")));
        assert_eq!(room.count_players(), 2);
    }

    #[test]
    fn test_ready_is_monotonic() {
        let mut room = create_test_room();
        assert!(!room.is_ready());
        assert!(room.mark_ready());
        assert!(!room.mark_ready());
        assert!(room.is_ready());
    }

    #[test]
    fn test_remove_player() {
        let mut room = create_test_room();
        room.add_player(player(2, "archer"));
        assert_eq!(room.remove_player(2).unwrap().username, "archer");
        assert_eq!(room.remove_player(2), Err(RoomError::PlayerNotFound(2)));
        assert_eq!(room.remove_player(1), Err(RoomError::HostCanNotLeave));
    }

    #[test]
    fn test_migrate_host_keeps_other_members() {
        let mut room = create_test_room();
        room.add_player(player(2, "archer"));
        room.add_player(player(3, "mage"));

        let previous = room.migrate_host(player(2, "archer")).unwrap();
        assert_eq!(previous.user_id, 1);
        assert!(room.is_host(2));
        assert!(room.has_player(3));
        assert!(!room.has_player(1));
        assert_eq!(room.count_players(), 2);
        assert!(room.iter_players().filter(|p| p.user_id == 2).count() == 1);

        assert_eq!(room.migrate_host(player(2, "archer")), None);
    }
}
