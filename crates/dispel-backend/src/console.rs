//! Client side of the console: accounts, characters, rooms and rankings.

use std::{future::Future, net::Ipv4Addr, time::Duration};

use dispel_core::{
    Character, ClassType, Player, User,
    model::{INVENTORY_LEN, SPELLS_LEN, STATS_LEN},
};
use dispel_proto::v1::{
    self as pb, character_service_client::CharacterServiceClient,
    game_service_client::GameServiceClient, ranking_service_client::RankingServiceClient,
    user_service_client::UserServiceClient,
};
use tonic::transport::{Channel, Endpoint};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("console call failed: {0}")]
    Rpc(String),

    #[error("console call timed out")]
    Timeout,

    #[error("invalid console endpoint: {0}")]
    Endpoint(String),
}

impl From<tonic::Status> for ConsoleError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => ConsoleError::NotFound(status.message().to_string()),
            code => ConsoleError::Rpc(format!("{code:?}: {}", status.message())),
        }
    }
}

/// A room as listed by the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyRoom {
    pub id: String,
    pub name: String,
    pub password: String,
    pub map_id: u32,
    pub host_user_id: i64,
    pub host_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGame {
    pub user_id: i64,
    pub name: String,
    pub password: String,
    pub map_id: u32,
    pub host_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RankingEntry {
    pub position: u32,
    pub points: u32,
    pub username: String,
    pub character: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ranking {
    pub current: Option<RankingEntry>,
    pub players: Vec<RankingEntry>,
}

#[tonic::async_trait]
pub trait Console: Send + Sync {
    async fn authenticate_user(&self, username: &str, password: &str) -> Result<User, ConsoleError>;
    async fn create_user(&self, username: &str, password: &str) -> Result<User, ConsoleError>;

    async fn list_characters(&self, user_id: i64) -> Result<Vec<Character>, ConsoleError>;
    async fn get_character(&self, user_id: i64, name: &str) -> Result<Character, ConsoleError>;
    async fn create_character(
        &self,
        user_id: i64,
        name: &str,
        stats: [u8; STATS_LEN],
    ) -> Result<Character, ConsoleError>;
    async fn delete_character(&self, user_id: i64, name: &str) -> Result<(), ConsoleError>;
    async fn put_stats(&self, user_id: i64, name: &str, stats: [u8; STATS_LEN]) -> Result<(), ConsoleError>;
    async fn put_spells(&self, user_id: i64, name: &str, spells: [u8; SPELLS_LEN]) -> Result<(), ConsoleError>;
    async fn put_inventory(
        &self,
        user_id: i64,
        name: &str,
        inventory: [u8; INVENTORY_LEN],
    ) -> Result<(), ConsoleError>;

    async fn list_games(&self) -> Result<Vec<LobbyRoom>, ConsoleError>;
    async fn get_game(&self, id: &str) -> Result<(LobbyRoom, Vec<Player>), ConsoleError>;
    async fn create_game(&self, game: NewGame) -> Result<LobbyRoom, ConsoleError>;
    async fn join_game(
        &self,
        user_id: i64,
        character_id: i64,
        game_id: &str,
        ip: Ipv4Addr,
    ) -> Result<Vec<Player>, ConsoleError>;

    async fn get_ranking(
        &self,
        user_id: i64,
        character: &str,
        class_type: u32,
        offset: u32,
    ) -> Result<Ranking, ConsoleError>;
}

/// Copy `src` into a fixed-size blob, zero padding or truncating.
pub fn fixed<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = src.len().min(N);
    out[..len].copy_from_slice(&src[..len]);
    out
}

fn user_from(user: Option<pb::User>, username: &str) -> Result<User, ConsoleError> {
    let user = user.ok_or_else(|| ConsoleError::NotFound(format!("user {username}")))?;
    Ok(User {
        id: user.user_id,
        username: user.username,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn character_from(character: pb::Character) -> Character {
    Character {
        id: character.character_id,
        name: character.character_name,
        stats: fixed(&character.stats),
        inventory: fixed(&character.inventory),
        spells: fixed(&character.spells),
    }
}

fn player_from(player: pb::Player) -> Player {
    let class_type = u8::try_from(player.class_type)
        .ok()
        .and_then(|c| ClassType::try_from(c).ok())
        .unwrap_or_default();
    Player {
        user_id: player.user_id,
        username: player.username,
        character_id: player.character_id,
        class_type,
        ip_address: player.ip_address,
    }
}

fn room_from(game: pb::Game) -> LobbyRoom {
    LobbyRoom {
        host_ip: game.host_ip_address.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
        id: game.game_id,
        name: game.name,
        password: game.password,
        map_id: game.map_id,
        host_user_id: game.host_user_id,
    }
}

fn entry_from(entry: pb::RankingPosition) -> RankingEntry {
    RankingEntry {
        position: entry.position,
        points: entry.points,
        username: entry.username,
        character: entry.character_name,
    }
}

/// [`Console`] over gRPC with a per-call deadline.
#[derive(Debug, Clone)]
pub struct GrpcConsole {
    users: UserServiceClient<Channel>,
    characters: CharacterServiceClient<Channel>,
    games: GameServiceClient<Channel>,
    rankings: RankingServiceClient<Channel>,
    timeout: Duration,
}

impl GrpcConsole {
    /// The channel connects on first use.
    pub fn connect_lazy(url: &str, timeout: Duration) -> Result<Self, ConsoleError> {
        let channel: Channel = Endpoint::from_shared(url.to_string())
            .map_err(|err| ConsoleError::Endpoint(err.to_string()))?
            .connect_timeout(timeout)
            .connect_lazy();
        Ok(Self {
            users: UserServiceClient::new(channel.clone()),
            characters: CharacterServiceClient::new(channel.clone()),
            games: GameServiceClient::new(channel.clone()),
            rankings: RankingServiceClient::new(channel),
            timeout,
        })
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    ) -> Result<T, ConsoleError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(status.into()),
            Err(_) => Err(ConsoleError::Timeout),
        }
    }
}

#[tonic::async_trait]
impl Console for GrpcConsole {
    async fn authenticate_user(&self, username: &str, password: &str) -> Result<User, ConsoleError> {
        let mut client = self.users.clone();
        let response = self
            .call(client.authenticate_user(pb::AuthenticateUserRequest {
                username: username.to_string(),
                password: password.to_string(),
            }))
            .await?;
        user_from(response.user, username)
    }

    async fn create_user(&self, username: &str, password: &str) -> Result<User, ConsoleError> {
        let mut client = self.users.clone();
        let response = self
            .call(client.create_user(pb::CreateUserRequest {
                username: username.to_string(),
                password: password.to_string(),
            }))
            .await?;
        user_from(response.user, username)
    }

    async fn list_characters(&self, user_id: i64) -> Result<Vec<Character>, ConsoleError> {
        let mut client = self.characters.clone();
        let response = self
            .call(client.list_characters(pb::ListCharactersRequest { user_id }))
            .await?;
        Ok(response.characters.into_iter().map(character_from).collect())
    }

    async fn get_character(&self, user_id: i64, name: &str) -> Result<Character, ConsoleError> {
        let mut client = self.characters.clone();
        let response = self
            .call(client.get_character(pb::GetCharacterRequest {
                user_id,
                character_name: name.to_string(),
            }))
            .await?;
        response
            .character
            .map(character_from)
            .ok_or_else(|| ConsoleError::NotFound(format!("character {name}")))
    }

    async fn create_character(
        &self,
        user_id: i64,
        name: &str,
        stats: [u8; STATS_LEN],
    ) -> Result<Character, ConsoleError> {
        let mut client = self.characters.clone();
        let response = self
            .call(client.create_character(pb::CreateCharacterRequest {
                user_id,
                character_name: name.to_string(),
                stats: stats.to_vec(),
            }))
            .await?;
        Ok(response
            .character
            .map_or_else(|| Character::new(0, name, stats), character_from))
    }

    async fn delete_character(&self, user_id: i64, name: &str) -> Result<(), ConsoleError> {
        let mut client = self.characters.clone();
        self.call(client.delete_character(pb::DeleteCharacterRequest {
            user_id,
            character_name: name.to_string(),
        }))
        .await?;
        Ok(())
    }

    async fn put_stats(&self, user_id: i64, name: &str, stats: [u8; STATS_LEN]) -> Result<(), ConsoleError> {
        let mut client = self.characters.clone();
        self.call(client.put_stats(pb::PutStatsRequest {
            user_id,
            character_name: name.to_string(),
            stats: stats.to_vec(),
        }))
        .await?;
        Ok(())
    }

    async fn put_spells(&self, user_id: i64, name: &str, spells: [u8; SPELLS_LEN]) -> Result<(), ConsoleError> {
        let mut client = self.characters.clone();
        self.call(client.put_spells(pb::PutSpellsRequest {
            user_id,
            character_name: name.to_string(),
            spells: spells.to_vec(),
        }))
        .await?;
        Ok(())
    }

    async fn put_inventory(
        &self,
        user_id: i64,
        name: &str,
        inventory: [u8; INVENTORY_LEN],
    ) -> Result<(), ConsoleError> {
        let mut client = self.characters.clone();
        self.call(client.put_inventory(pb::PutInventoryRequest {
            user_id,
            character_name: name.to_string(),
            inventory: inventory.to_vec(),
        }))
        .await?;
        Ok(())
    }

    async fn list_games(&self) -> Result<Vec<LobbyRoom>, ConsoleError> {
        let mut client = self.games.clone();
        let response = self
            .call(client.list_games(pb::ListGamesRequest {}))
            .await?;
        Ok(response.games.into_iter().map(room_from).collect())
    }

    async fn get_game(&self, id: &str) -> Result<(LobbyRoom, Vec<Player>), ConsoleError> {
        let mut client = self.games.clone();
        let response = self
            .call(client.get_game(pb::GetGameRequest {
                game_room_id: id.to_string(),
            }))
            .await?;
        let game = response
            .game
            .ok_or_else(|| ConsoleError::NotFound(format!("game {id}")))?;
        Ok((
            room_from(game),
            response.players.into_iter().map(player_from).collect(),
        ))
    }

    async fn create_game(&self, game: NewGame) -> Result<LobbyRoom, ConsoleError> {
        let mut client = self.games.clone();
        let response = self
            .call(client.create_game(pb::CreateGameRequest {
                user_id: game.user_id,
                game_name: game.name.clone(),
                password: game.password.clone(),
                map_id: game.map_id,
                host_ip_address: game.host_ip.to_string(),
            }))
            .await?;
        Ok(response.game.map_or_else(
            || LobbyRoom {
                id: game.name.clone(),
                name: game.name,
                password: game.password,
                map_id: game.map_id,
                host_user_id: game.user_id,
                host_ip: game.host_ip,
            },
            room_from,
        ))
    }

    async fn join_game(
        &self,
        user_id: i64,
        character_id: i64,
        game_id: &str,
        ip: Ipv4Addr,
    ) -> Result<Vec<Player>, ConsoleError> {
        let mut client = self.games.clone();
        let response = self
            .call(client.join_game(pb::JoinGameRequest {
                user_id,
                character_id,
                game_room_id: game_id.to_string(),
                ip_address: ip.to_string(),
            }))
            .await?;
        Ok(response.players.into_iter().map(player_from).collect())
    }

    async fn get_ranking(
        &self,
        user_id: i64,
        character: &str,
        class_type: u32,
        offset: u32,
    ) -> Result<Ranking, ConsoleError> {
        let mut client = self.rankings.clone();
        let response = self
            .call(client.get_ranking(pb::GetRankingRequest {
                user_id,
                character_name: character.to_string(),
                class_type,
                offset,
            }))
            .await?;
        Ok(Ranking {
            current: response.current_player.map(entry_from),
            players: response.players.into_iter().map(entry_from).collect(),
        })
    }
}
