//! WebRTC mesh between the players of a room.
//!
//! Every remote player gets a [`Peer`] and a loopback address from the
//! [`IpRing`]. The game talks to that address as if the player were on the
//! LAN, and [`crate::pipe::Pipe`]s carry the bytes over data channels.

mod peer;

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Weak},
    time::Duration,
};

use dispel_core::{
    EventType, GameRoom, IpRing, PeerMode, Player, WireError,
    wire::{self, HostMigration, RoomMember, RtcAnswer, RtcCandidate, RtcOffer},
};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use webrtc::api::{API, APIBuilder, setting_engine::SettingEngine};

pub use peer::{Peer, PeerOptions, Signal, Signaler};

use super::{
    CreateRoomParams, GameData, Proxy, ProxyError, announce_join, ready_room, enter_room,
    notify_host_migration, register_room, upgrade,
};
use crate::{config::BackendConfig, console::LobbyRoom, session::Session};

/// Sends signaling messages for one room through the session's lobby.
struct LobbySignaler {
    session: Weak<Session>,
    game_id: String,
}

#[tonic::async_trait]
impl Signaler for LobbySignaler {
    async fn signal(&self, to: &str, signal: Signal) -> Result<(), ProxyError> {
        let session = upgrade(&self.session)?;
        let game_id = self.game_id.clone();
        match signal {
            Signal::Offer(offer) => {
                session
                    .send_event_to(EventType::RtcOffer, RtcOffer { game_id, offer }, to)
                    .await?;
            }
            Signal::Answer(answer) => {
                session
                    .send_event_to(EventType::RtcAnswer, RtcAnswer { game_id, answer }, to)
                    .await?;
            }
            Signal::Candidate(candidate) => {
                session
                    .send_event_to(
                        EventType::RtcIceCandidate,
                        RtcCandidate { game_id, candidate },
                        to,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

pub struct P2pProxy {
    session: Weak<Session>,
    api: API,
    ring: Mutex<IpRing>,
    room: RwLock<Option<GameRoom>>,
    selected: Mutex<Option<GameData>>,
    peers: Mutex<HashMap<i64, Arc<Peer>>>,
    ice_servers: Vec<String>,
    game_tcp_port: u16,
    game_udp_port: u16,
    peer_connect_timeout: Duration,
    cancel: CancellationToken,
}

impl P2pProxy {
    pub fn new(session: Weak<Session>, config: &BackendConfig, cancel: CancellationToken) -> Arc<Self> {
        let mut settings = SettingEngine::default();
        settings.set_include_loopback_candidate(true);
        let api = APIBuilder::new().with_setting_engine(settings).build();

        Arc::new(Self {
            session,
            api,
            ring: Mutex::new(IpRing::with_ports(
                config.loopback_prefix,
                config.game_tcp_port,
                config.game_udp_port,
            )),
            room: RwLock::new(None),
            selected: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            ice_servers: config.ice_servers.clone(),
            game_tcp_port: config.game_tcp_port,
            game_udp_port: config.game_udp_port,
            peer_connect_timeout: config.peer_connect_timeout,
            cancel,
        })
    }

    pub fn peer(&self, user_id: i64) -> Option<Arc<Peer>> {
        self.peers.lock().get(&user_id).cloned()
    }

    fn room_id(&self) -> Option<String> {
        self.room.read().as_ref().map(|room| room.id().to_string())
    }

    fn ring_ip(&self, player: &Player) -> Result<Ipv4Addr, ProxyError> {
        Ok(self.ring.lock().assign(&player.id())?.ip)
    }

    /// Create the peer for `player`, or return the live one.
    async fn create_peer(
        &self,
        session: &Session,
        player: Player,
        joining: bool,
    ) -> Result<Arc<Peer>, ProxyError> {
        if let Some(existing) = self.peer(player.user_id).filter(|p| !p.is_terminated()) {
            return Ok(existing);
        }
        let (game_id, current_is_host, peer_is_host) = {
            let room = self.room.read();
            let room = room.as_ref().ok_or(ProxyError::NoRoom)?;
            (
                room.id().to_string(),
                room.is_host(session.user_id()),
                room.is_host(player.user_id),
            )
        };

        let addr = self.ring.lock().assign(&player.id())?;
        let signaler = Arc::new(LobbySignaler {
            session: self.session.clone(),
            game_id: game_id.clone(),
        });
        let user_id = player.user_id;
        let peer = Peer::create(
            &self.api,
            player,
            PeerOptions {
                game_id,
                mode: PeerMode::classify(current_is_host, peer_is_host, joining),
                addr,
                game_tcp_port: self.game_tcp_port,
                game_udp_port: self.game_udp_port,
                ice_servers: self.ice_servers.clone(),
            },
            signaler,
            &self.cancel,
        )
        .await?;

        let previous = self.peers.lock().insert(user_id, peer.clone());
        if let Some(previous) = previous {
            previous.terminate().await;
        }
        Ok(peer)
    }

    /// The numerically lower user id sends the offer.
    async fn maybe_initiate(&self, self_id: i64, peer: &Arc<Peer>) {
        if self_id >= peer.player().user_id {
            return;
        }
        if let Err(err) = peer.initiate().await {
            tracing::warn!(peer_id = peer.player().user_id, error = %err, "Offer failed");
        }
    }

    async fn remove_peer(&self, user_id: i64) {
        let peer = self.peers.lock().remove(&user_id);
        if let Some(peer) = peer {
            peer.terminate().await;
        }
        self.ring.lock().release(&user_id.to_string());
    }

    async fn on_join_room(&self, frame: &[u8], room_id: &str) -> Result<(), ProxyError> {
        let (_, message) = wire::decode::<RoomMember>(frame)?;
        let member = message.content.member;
        let session = upgrade(&self.session)?;
        let self_id = session.user_id();
        if message.content.room_name != room_id || member.user_id == self_id {
            return Ok(());
        }

        if let Some(room) = self.room.write().as_mut() {
            room.add_player(member.clone());
        }
        tracing::info!(game_id = %room_id, peer_id = member.user_id, "Player joining room");
        let peer = self.create_peer(&session, member, true).await?;
        self.maybe_initiate(self_id, &peer).await;
        Ok(())
    }

    async fn on_leave(&self, member: Player) -> Result<(), ProxyError> {
        let self_id = upgrade(&self.session)?.user_id();
        if member.user_id == self_id {
            return Ok(());
        }
        if let Some(room) = self.room.write().as_mut() {
            if room.remove_player(member.user_id).is_ok() {
                tracing::info!(game_id = %room.id(), peer_id = member.user_id, "Player left room");
            }
        }
        self.remove_peer(member.user_id).await;
        Ok(())
    }

    /// Find the peer a signaling message comes from.
    fn sender(&self, from: &str) -> Option<Arc<Peer>> {
        from.parse().ok().and_then(|id| self.peer(id))
    }

    async fn on_offer(&self, frame: &[u8], room_id: &str) -> Result<(), ProxyError> {
        let (_, message) = wire::decode::<RtcOffer>(frame)?;
        if message.content.game_id != room_id {
            return Ok(());
        }
        let Some(peer) = self.sender(&message.from) else {
            tracing::warn!(from = %message.from, "Refusing offer from unknown peer");
            return Ok(());
        };
        if let Err(err) = peer.on_signal(Signal::Offer(message.content.offer)).await {
            tracing::warn!(peer_id = peer.player().user_id, error = %err, "Could not answer offer");
        }
        Ok(())
    }

    async fn on_answer(&self, frame: &[u8], room_id: &str) -> Result<(), ProxyError> {
        let (_, message) = wire::decode::<RtcAnswer>(frame)?;
        if message.content.game_id != room_id {
            return Ok(());
        }
        let peer = self
            .sender(&message.from)
            .ok_or_else(|| ProxyError::NotFound(format!("peer {}", message.from)))?;
        if let Err(err) = peer.on_signal(Signal::Answer(message.content.answer)).await {
            tracing::warn!(peer_id = peer.player().user_id, error = %err, "Could not apply answer");
        }
        Ok(())
    }

    async fn on_candidate(&self, frame: &[u8], room_id: &str) -> Result<(), ProxyError> {
        let (_, message) = wire::decode::<RtcCandidate>(frame)?;
        if message.content.game_id != room_id {
            return Ok(());
        }
        let Some(peer) = self.sender(&message.from) else {
            tracing::debug!(from = %message.from, "Candidate for unknown peer");
            return Ok(());
        };
        if let Err(err) = peer.on_signal(Signal::Candidate(message.content.candidate)).await {
            tracing::debug!(peer_id = peer.player().user_id, error = %err, "Candidate rejected");
        }
        Ok(())
    }

    async fn on_host_migration(&self, frame: &[u8], room_id: &str) -> Result<(), ProxyError> {
        let (_, message) = wire::decode::<HostMigration>(frame)?;
        if message.content.game_id != room_id {
            return Ok(());
        }
        let session = upgrade(&self.session)?;
        let new_host = message.content.new_host;
        let self_id = session.user_id();

        let previous = self
            .room
            .write()
            .as_mut()
            .and_then(|room| room.migrate_host(new_host.clone()));
        if let Some(previous) = previous.filter(|p| p.user_id != self_id) {
            self.remove_peer(previous.user_id).await;
        }

        let is_host = new_host.user_id == self_id;
        let host_ip = if is_host {
            for peer in self.peers.lock().values() {
                peer.set_mode(PeerMode::CurrentUserIsHost);
            }
            Ipv4Addr::LOCALHOST
        } else {
            if let Some(peer) = self.peer(new_host.user_id) {
                peer.set_mode(PeerMode::OtherUserIsHost);
            }
            self.ring_ip(&new_host)?
        };
        tracing::info!(game_id = %room_id, new_host = new_host.user_id, is_host, "Host migrated");
        notify_host_migration(&session, is_host, host_ip);
        Ok(())
    }
}

#[tonic::async_trait]
impl Proxy for P2pProxy {
    fn host_ip(&self, room: &LobbyRoom) -> Result<Ipv4Addr, ProxyError> {
        let session = upgrade(&self.session)?;
        if room.host_user_id == session.user_id() {
            return Ok(Ipv4Addr::LOCALHOST);
        }
        Ok(self.ring.lock().assign(&room.host_user_id.to_string())?.ip)
    }

    async fn create_room(&self, params: CreateRoomParams) -> Result<Ipv4Addr, ProxyError> {
        let session = upgrade(&self.session)?;
        let room = register_room(&session, params, Ipv4Addr::LOCALHOST).await?;
        *self.room.write() = Some(room);
        Ok(Ipv4Addr::LOCALHOST)
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
        let self_id = session.user_id();
        let room = enter_room(&session, id, password, Ipv4Addr::LOCALHOST).await?;
        let host_id = room.host_player().user_id;
        let others: Vec<Player> = room
            .iter_players()
            .filter(|p| p.user_id != self_id)
            .cloned()
            .collect();
        let players = room.iter_players().cloned().collect();
        *self.room.write() = Some(room.clone());
        self.selected.lock().take();

        let mut peers = Vec::with_capacity(others.len());
        for player in others {
            peers.push(self.create_peer(&session, player, false).await?);
        }
        announce_join(&session, &room, Ipv4Addr::LOCALHOST).await?;
        for peer in &peers {
            self.maybe_initiate(self_id, peer).await;
        }

        if let Some(host) = peers.iter().find(|p| p.player().user_id == host_id) {
            if !host.wait_connected(self.peer_connect_timeout).await {
                tracing::warn!(game_id = %id, peer_id = host_id, "Host peer did not connect in time");
            }
        }
        Ok(players)
    }

    fn player_addr(&self, player: &Player) -> Result<Ipv4Addr, ProxyError> {
        let session = upgrade(&self.session)?;
        if player.user_id == session.user_id() {
            return Ok(Ipv4Addr::LOCALHOST);
        }
        self.ring_ip(player)
    }

    async fn join(&self, player: &Player) -> Result<Ipv4Addr, ProxyError> {
        self.player_addr(player)
    }

    async fn handle(&self, frame: &[u8]) -> Result<(), ProxyError> {
        let event = match wire::decode_event(frame) {
            Ok(event) => event,
            Err(WireError::UnknownEvent(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if event == EventType::LeaveLobby {
            let (_, message) = wire::decode::<Player>(frame)?;
            return self.on_leave(message.content).await;
        }
        let Some(room_id) = self.room_id() else {
            return Ok(());
        };
        match event {
            EventType::JoinRoom => self.on_join_room(frame, &room_id).await,
            EventType::LeaveRoom => {
                let (_, message) = wire::decode::<RoomMember>(frame)?;
                if message.content.room_name != room_id {
                    return Ok(());
                }
                self.on_leave(message.content.member).await
            }
            EventType::RtcOffer => self.on_offer(frame, &room_id).await,
            EventType::RtcAnswer => self.on_answer(frame, &room_id).await,
            EventType::RtcIceCandidate => self.on_candidate(frame, &room_id).await,
            EventType::HostMigration => self.on_host_migration(frame, &room_id).await,
            _ => Ok(()),
        }
    }

    async fn close(&self) {
        let peers: Vec<Arc<Peer>> = self.peers.lock().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.terminate().await;
        }
        {
            let mut ring = self.ring.lock();
            *ring = IpRing::with_ports(ring.prefix(), self.game_tcp_port, self.game_udp_port);
        }
        self.room.write().take();
        self.selected.lock().take();
        tracing::debug!("P2P proxy closed");
    }

    fn room(&self) -> Option<GameRoom> {
        self.room.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use dispel_core::{
        Character, MessageContent, User,
        model::{CLASS_TYPE_OFFSET, STATS_LEN},
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream, UdpSocket},
        sync::mpsc,
    };

    use super::*;
    use crate::{
        config::ProxyMode,
        console::{Console, memory::MemoryConsole},
        lobby::hub::FakeHub,
    };

    struct Member {
        session: Arc<Session>,
        packets: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    async fn member(
        id: i64,
        console: &Arc<MemoryConsole>,
        config: &Arc<BackendConfig>,
        cancel: &CancellationToken,
    ) -> Member {
        let (tx, packets) = mpsc::unbounded_channel();
        let session = Session::new(console.clone() as Arc<dyn Console>, config.clone(), tx, cancel);
        session.set_user(User {
            id,
            username: format!("user{id}"),
            version: "test".to_string(),
        });
        let mut stats = [0u8; STATS_LEN];
        stats[CLASS_TYPE_OFFSET] = 1;
        session.set_character(Character::new(id * 10, format!("hero{id}"), stats));
        session.connect_lobby().await.unwrap();
        session.on_character_selected().await.unwrap();
        Member { session, packets }
    }

    async fn config(hub: &FakeHub, connect_timeout: Duration) -> (Arc<BackendConfig>, TcpListener, UdpSocket) {
        let game_tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let game_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = BackendConfig {
            lobby_url: hub.url(),
            mode: ProxyMode::P2p,
            game_tcp_port: game_tcp.local_addr().unwrap().port(),
            game_udp_port: game_udp.local_addr().unwrap().port(),
            peer_connect_timeout: connect_timeout,
            ..BackendConfig::default()
        };
        (Arc::new(config), game_tcp, game_udp)
    }

    #[tokio::test]
    async fn test_guest_reaches_host_game_through_data_channel() {
        let hub = FakeHub::start().await;
        let (config, host_game, _host_udp) = config(&hub, Duration::from_secs(15)).await;
        let console = Arc::new(MemoryConsole::new());
        let cancel = CancellationToken::new();

        let host = member(1, &console, &config, &cancel).await;
        let guest = member(2, &console, &config, &cancel).await;

        host.session
            .proxy()
            .create_room(CreateRoomParams {
                name: "retreat".to_string(),
                password: String::new(),
                map_id: 2,
            })
            .await
            .unwrap();
        host.session.proxy().host_room("retreat").await.unwrap();

        let players = guest.session.proxy().join_game("retreat", "").await.unwrap();
        assert_eq!(players.len(), 2);
        let room = guest.session.proxy().room().unwrap();
        assert!(room.is_host(1));

        let host_ip = guest
            .session
            .proxy()
            .host_ip(&console.get_game("retreat").await.unwrap().0)
            .unwrap();
        assert_eq!(host_ip, Ipv4Addr::new(127, 0, 1, 2));

        let tcp_port = config.game_tcp_port;
        let mut guest_game = None;
        for _ in 0..200 {
            if let Ok(stream) = TcpStream::connect(SocketAddr::from((host_ip, tcp_port))).await {
                guest_game = Some(stream);
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let mut guest_game = guest_game.expect("guest fake host listens");
        let (mut host_conn, _) = tokio::time::timeout(Duration::from_secs(15), host_game.accept())
            .await
            .unwrap()
            .unwrap();

        guest_game.write_all(b"knock").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(15), host_conn.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"knock");

        host.session.close().await;
        guest.session.close().await;
        drop((host.packets, guest.packets));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_host_migration_notifies_game_and_drops_old_host() {
        let hub = FakeHub::start().await;
        let (config, _game_tcp, _game_udp) = config(&hub, Duration::from_millis(200)).await;
        let console = Arc::new(MemoryConsole::new().with_game(
            LobbyRoom {
                id: "retreat".to_string(),
                name: "retreat".to_string(),
                password: String::new(),
                map_id: 1,
                host_user_id: 7,
                host_ip: Ipv4Addr::new(10, 0, 0, 7),
            },
            Vec::new(),
        ));
        let cancel = CancellationToken::new();
        let mut guest = member(3, &console, &config, &cancel).await;

        // The host never answers: joining gives up waiting after the timeout.
        let players = guest.session.proxy().join_game("retreat", "").await.unwrap();
        assert_eq!(players.len(), 2);
        assert!(guest.session.proxy().room().unwrap().is_host(7));

        let migration = wire::compose(
            EventType::HostMigration,
            &MessageContent::new(HostMigration {
                game_id: "retreat".to_string(),
                new_host: guest.session.player(Ipv4Addr::LOCALHOST).unwrap(),
            })
            .with_from("7"),
        )
        .unwrap();
        guest.session.proxy().handle(&migration).await.unwrap();

        let room = guest.session.proxy().room().unwrap();
        assert!(room.is_host(3));
        assert!(!room.has_player(7));

        let packet = tokio::time::timeout(Duration::from_secs(5), guest.packets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet[1], dispel_core::PacketType::HostMigration.opcode());
        assert!(packet.ends_with(&[1, 0, 0, 0, 127, 0, 0, 1]));

        guest.session.close().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_signals_from_unknown_peers_are_not_fatal() {
        let hub = FakeHub::start().await;
        let (config, _game_tcp, _game_udp) = config(&hub, Duration::from_millis(200)).await;
        let console = Arc::new(MemoryConsole::new());
        let cancel = CancellationToken::new();
        let host = member(1, &console, &config, &cancel).await;
        host.session
            .proxy()
            .create_room(CreateRoomParams {
                name: "retreat".to_string(),
                password: String::new(),
                map_id: 2,
            })
            .await
            .unwrap();

        let offer = wire::compose(
            EventType::RtcOffer,
            &MessageContent::new(RtcOffer {
                game_id: "retreat".to_string(),
                offer: wire::SessionDescription::default(),
            })
            .with_from("99"),
        )
        .unwrap();
        host.session.proxy().handle(&offer).await.unwrap();

        let answer = wire::compose(
            EventType::RtcAnswer,
            &MessageContent::new(RtcAnswer {
                game_id: "retreat".to_string(),
                answer: wire::SessionDescription::default(),
            })
            .with_from("99"),
        )
        .unwrap();
        assert!(matches!(
            host.session.proxy().handle(&answer).await,
            Err(ProxyError::NotFound(_))
        ));

        let candidate = wire::compose(
            EventType::RtcIceCandidate,
            &MessageContent::new(RtcCandidate {
                game_id: "retreat".to_string(),
                candidate: wire::IceCandidate::default(),
            })
            .with_from("99"),
        )
        .unwrap();
        host.session.proxy().handle(&candidate).await.unwrap();

        host.session.close().await;
        cancel.cancel();
    }
}
