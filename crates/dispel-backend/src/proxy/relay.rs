//! Game traffic through the central relay server.
//!
//! The session keeps one relay stream per room. Remote players appear to the
//! game as fake hosts on the loopback prefix: guests listen for the game on
//! the host's address, the host dials its own game for every guest that
//! sends data.

use std::{
    net::Ipv4Addr,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use dispel_core::{GameRoom, Player};
use dispel_relay::{Proto, RelayFrame, RelayStream};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    CreateRoomParams, GameData, Membership, Proxy, ProxyError, announce_join, apply_membership,
    enter_room, membership, notify_host_migration, ready_room, register_room, upgrade,
};
use crate::{
    config::BackendConfig,
    console::LobbyRoom,
    hosts::{FakeHost, HostKind, HostManager},
    redirect::{PacketSink, RedirectError},
    session::Session,
};

/// Wraps everything the game sends to one remote player in relay frames.
struct RelaySink {
    outbox: mpsc::UnboundedSender<RelayFrame>,
    from: i64,
    to: i64,
    proto: Proto,
}

#[tonic::async_trait]
impl PacketSink for RelaySink {
    async fn deliver(&self, payload: Bytes) -> Result<(), RedirectError> {
        self.outbox
            .send(RelayFrame::Data {
                from: self.from,
                to: self.to,
                proto: self.proto,
                payload: payload.to_vec(),
            })
            .map_err(|_| RedirectError::Closed)
    }
}

struct RelayLink {
    outbox: mpsc::UnboundedSender<RelayFrame>,
    stop: CancellationToken,
}

pub struct RelayProxy {
    me: Weak<RelayProxy>,
    session: Weak<Session>,
    relay_addr: Option<String>,
    hosts: HostManager,
    room: RwLock<Option<GameRoom>>,
    selected: Mutex<Option<GameData>>,
    link: Mutex<Option<RelayLink>>,
    cancel: CancellationToken,
}

impl RelayProxy {
    pub fn new(session: Weak<Session>, config: &BackendConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session,
            relay_addr: config.relay_addr.clone(),
            hosts: HostManager::new(
                config.loopback_prefix,
                config.game_tcp_port,
                config.game_udp_port,
            ),
            room: RwLock::new(None),
            selected: Mutex::new(None),
            link: Mutex::new(None),
            cancel,
        })
    }

    pub fn hosts(&self) -> &HostManager {
        &self.hosts
    }

    fn self_id(&self) -> Result<i64, ProxyError> {
        Ok(upgrade(&self.session)?.user_id())
    }

    fn is_hosting(&self, self_id: i64) -> bool {
        self.room
            .read()
            .as_ref()
            .is_some_and(|room| room.is_host(self_id))
    }

    fn outbox(&self) -> Result<mpsc::UnboundedSender<RelayFrame>, ProxyError> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.outbox.clone())
            .ok_or(ProxyError::NoRoom)
    }

    /// Open the relay stream for `room` and start its reader and writer.
    async fn connect(&self, room: &str, user_id: i64, host: bool) -> Result<(), ProxyError> {
        let addr = self
            .relay_addr
            .as_deref()
            .ok_or(ProxyError::NotConfigured("relay address"))?;
        let (mut sink, stream) = dispel_relay::connect(addr).await?.split();
        sink.send(RelayFrame::Join {
            room: room.to_string(),
            user_id,
            host,
        })
        .await?;

        let (outbox, rx) = mpsc::unbounded_channel();
        let stop = self.cancel.child_token();
        let span = tracing::Span::current();
        tokio::spawn(write_relay(sink, rx, stop.clone()).instrument(span.clone()));
        tokio::spawn(read_relay(self.me.clone(), stream, stop.clone()).instrument(span));

        let previous = self.link.lock().replace(RelayLink { outbox, stop });
        if let Some(previous) = previous {
            previous.stop.cancel();
        }
        tracing::info!(game_id = %room, host, "Connected to relay");
        Ok(())
    }

    async fn start_fake(&self, peer: i64, kind: HostKind) -> Result<Arc<FakeHost>, ProxyError> {
        let outbox = self.outbox()?;
        let from = self.self_id()?;
        let sink = |proto: Proto| -> Arc<dyn PacketSink> {
            Arc::new(RelaySink {
                outbox: outbox.clone(),
                from,
                to: peer,
                proto,
            })
        };
        let peer_id = peer.to_string();
        let host = match kind {
            HostKind::Listen => {
                self.hosts
                    .start_host(&peer_id, sink(Proto::Tcp), sink(Proto::Udp), &self.cancel)
                    .await?
            }
            HostKind::Dial => {
                self.hosts
                    .start_guest(&peer_id, sink(Proto::Tcp), sink(Proto::Udp), &self.cancel)
                    .await?
            }
        };
        Ok(host)
    }

    async fn on_frame(&self, frame: RelayFrame) {
        match frame {
            RelayFrame::Data {
                from,
                proto,
                payload,
                ..
            } => self.on_data(from, proto, payload).await,
            RelayFrame::Joined { user_id, host } => {
                tracing::debug!(peer_id = user_id, host, "Relay member present");
            }
            RelayFrame::Leave { user_id } => {
                if self.hosts.stop_host(&user_id.to_string()) {
                    tracing::info!(peer_id = user_id, "Relay member left");
                }
            }
            RelayFrame::HostMigration { room, new_host } => {
                if let Err(err) = self.on_host_migration(new_host).await {
                    tracing::warn!(game_id = %room, error = %err, "Relay host migration failed");
                }
            }
            RelayFrame::Join { .. } => {}
        }
    }

    async fn on_data(&self, from: i64, proto: Proto, payload: Vec<u8>) {
        let host = match self.hosts.get(&from.to_string()).filter(|h| h.is_alive()) {
            Some(host) => host,
            None => {
                let Ok(self_id) = self.self_id() else {
                    return;
                };
                if !self.is_hosting(self_id) {
                    tracing::debug!(peer_id = from, "Data from a member we do not track");
                    return;
                }
                match self.start_fake(from, HostKind::Dial).await {
                    Ok(host) => host,
                    Err(err) => {
                        tracing::warn!(peer_id = from, error = %err, "Could not start fake guest");
                        return;
                    }
                }
            }
        };
        match host.write(proto, Bytes::from(payload)) {
            Ok(()) | Err(RedirectError::NotConnected) => {}
            Err(err) => tracing::debug!(peer_id = from, error = %err, "Dropped relay payload"),
        }
    }

    async fn on_host_migration(&self, new_host_id: i64) -> Result<(), ProxyError> {
        let session = upgrade(&self.session)?;
        let self_id = session.user_id();
        let previous = {
            let mut guard = self.room.write();
            let room = guard.as_mut().ok_or(ProxyError::NoRoom)?;
            let new_host = room.player(new_host_id).cloned().unwrap_or_else(|| Player {
                user_id: new_host_id,
                ..Player::default()
            });
            room.migrate_host(new_host)
        };
        if let Some(previous) = previous {
            self.hosts.stop_host(&previous.id());
        }

        let is_host = new_host_id == self_id;
        let host_ip = if is_host {
            // Guests are dialed again on their next packet.
            self.hosts.stop_all();
            Ipv4Addr::LOCALHOST
        } else {
            self.start_fake(new_host_id, HostKind::Listen).await?.ip()
        };
        tracing::info!(new_host = new_host_id, is_host, "Relay host migrated");
        notify_host_migration(&session, is_host, host_ip);
        Ok(())
    }
}

async fn write_relay(
    mut sink: SplitSink<RelayStream, RelayFrame>,
    mut outbox: mpsc::UnboundedReceiver<RelayFrame>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = stop.cancelled() => break,
            frame = outbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = sink.send(frame).await {
            tracing::warn!(error = %err, "Relay write failed");
            stop.cancel();
            return;
        }
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(error = %err, "Relay close failed");
    }
}

async fn read_relay(
    proxy: Weak<RelayProxy>,
    mut stream: SplitStream<RelayStream>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = stop.cancelled() => return,
            frame = stream.next() => frame,
        };
        let Some(proxy) = proxy.upgrade() else {
            return;
        };
        match frame {
            Some(Ok(frame)) => proxy.on_frame(frame).await,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "Relay read failed");
                break;
            }
            None => {
                tracing::info!("Relay closed the stream");
                break;
            }
        }
    }
    stop.cancel();
    if let Some(proxy) = proxy.upgrade() {
        proxy.hosts.stop_all();
    }
}

#[tonic::async_trait]
impl Proxy for RelayProxy {
    fn host_ip(&self, room: &LobbyRoom) -> Result<Ipv4Addr, ProxyError> {
        if room.host_user_id == self.self_id()? {
            return Ok(Ipv4Addr::LOCALHOST);
        }
        Ok(self.hosts.assign_ip(&room.host_user_id.to_string())?.ip)
    }

    async fn create_room(&self, params: CreateRoomParams) -> Result<Ipv4Addr, ProxyError> {
        let session = upgrade(&self.session)?;
        let room = register_room(&session, params, Ipv4Addr::LOCALHOST).await?;
        let room_id = room.id().to_string();
        *self.room.write() = Some(room);
        self.connect(&room_id, session.user_id(), true).await?;
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
        let room = enter_room(&session, id, password, Ipv4Addr::LOCALHOST).await?;
        let host_id = room.host_player().user_id;
        let players = room.iter_players().cloned().collect();
        *self.room.write() = Some(room.clone());
        self.selected.lock().take();

        self.connect(id, session.user_id(), false).await?;
        let host = self.start_fake(host_id, HostKind::Listen).await?;
        tracing::info!(game_id = %id, host_ip = %host.ip(), "Listening for the game on the host address");
        announce_join(&session, &room, Ipv4Addr::LOCALHOST).await?;
        Ok(players)
    }

    fn player_addr(&self, player: &Player) -> Result<Ipv4Addr, ProxyError> {
        if player.user_id == self.self_id()? {
            return Ok(Ipv4Addr::LOCALHOST);
        }
        Ok(self.hosts.assign_ip(&player.id())?.ip)
    }

    async fn join(&self, player: &Player) -> Result<Ipv4Addr, ProxyError> {
        self.player_addr(player)
    }

    /// Tracks room membership. Hosting changes come from the relay.
    async fn handle(&self, frame: &[u8]) -> Result<(), ProxyError> {
        let Some(room_id) = self.room.read().as_ref().map(|room| room.id().to_string()) else {
            return Ok(());
        };
        let change = match membership(frame, &room_id)? {
            None | Some(Membership::HostChanged(_)) => return Ok(()),
            Some(change) => change,
        };
        let self_id = self.self_id()?;
        if let Some(room) = self.room.write().as_mut() {
            apply_membership(room, &change, self_id);
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(link) = self.link.lock().take() {
            link.stop.cancel();
        }
        self.hosts.stop_all();
        self.room.write().take();
        self.selected.lock().take();
    }

    fn room(&self) -> Option<GameRoom> {
        self.room.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use dispel_core::{
        Character, User, ipring::DEFAULT_HOST_PREFIX, model::CLASS_TYPE_OFFSET, model::STATS_LEN,
    };
    use dispel_relay::RelayServer;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream, UdpSocket},
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
        stats[CLASS_TYPE_OFFSET] = 2;
        session.set_character(Character::new(id * 10, format!("hero{id}"), stats));
        session.connect_lobby().await.unwrap();
        session.on_character_selected().await.unwrap();
        Member { session, packets }
    }

    struct World {
        hub: FakeHub,
        relay: Arc<RelayServer>,
        config: Arc<BackendConfig>,
        game_tcp: TcpListener,
        _game_udp: UdpSocket,
        console: Arc<MemoryConsole>,
        cancel: CancellationToken,
    }

    async fn world() -> World {
        let hub = FakeHub::start().await;
        let relay = Arc::new(RelayServer::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(relay.clone().serve(listener, cancel.clone()));

        let game_tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let game_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = BackendConfig {
            lobby_url: hub.url(),
            mode: ProxyMode::Relay,
            relay_addr: Some(relay_addr.to_string()),
            loopback_prefix: DEFAULT_HOST_PREFIX,
            game_tcp_port: game_tcp.local_addr().unwrap().port(),
            game_udp_port: game_udp.local_addr().unwrap().port(),
            ..BackendConfig::default()
        };
        World {
            hub,
            relay,
            config: Arc::new(config),
            game_tcp,
            _game_udp: game_udp,
            console: Arc::new(MemoryConsole::new()),
            cancel,
        }
    }

    async fn wait_members(relay: &RelayServer, count: usize) {
        for _ in 0..200 {
            if relay.member_count("retreat") == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("relay never reached {count} members");
    }

    async fn host_retreat(member: &Member) {
        member
            .session
            .proxy()
            .create_room(CreateRoomParams {
                name: "retreat".to_string(),
                password: "pw".to_string(),
                map_id: 4,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_guest_game_traffic_reaches_host_game() {
        let world = world().await;
        let host = member(1, &world.console, &world.config, &world.cancel).await;
        let guest = member(2, &world.console, &world.config, &world.cancel).await;

        host_retreat(&host).await;
        wait_members(&world.relay, 1).await;

        assert!(matches!(
            guest.session.proxy().join_game("retreat", "wrong").await,
            Err(ProxyError::WrongPassword(_))
        ));
        let players = guest.session.proxy().join_game("retreat", "pw").await.unwrap();
        assert_eq!(players.len(), 2);
        wait_members(&world.relay, 2).await;

        let host_ip = guest
            .session
            .proxy()
            .host_ip(&world.console.get_game("retreat").await.unwrap().0)
            .unwrap();
        assert_eq!(host_ip, Ipv4Addr::new(127, 0, 0, 2));

        let mut guest_game =
            TcpStream::connect(SocketAddr::from((host_ip, world.config.game_tcp_port)))
                .await
                .unwrap();
        guest_game.write_all(b"knock").await.unwrap();

        let (mut host_conn, _) =
            tokio::time::timeout(Duration::from_secs(5), world.game_tcp.accept())
                .await
                .unwrap()
                .unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), host_conn.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"knock");

        host_conn.write_all(b"enter").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), guest_game.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"enter");

        host.session.close().await;
        guest.session.close().await;
        world.cancel.cancel();
        drop(world.hub);
    }

    #[tokio::test]
    async fn test_host_leaving_promotes_guest() {
        let world = world().await;
        let host = member(1, &world.console, &world.config, &world.cancel).await;
        let mut guest = member(2, &world.console, &world.config, &world.cancel).await;

        host_retreat(&host).await;
        wait_members(&world.relay, 1).await;
        guest.session.proxy().join_game("retreat", "pw").await.unwrap();
        wait_members(&world.relay, 2).await;

        host.session.close().await;

        let packet = tokio::time::timeout(Duration::from_secs(5), guest.packets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet[1], dispel_core::PacketType::HostMigration.opcode());
        assert!(packet.ends_with(&[1, 0, 0, 0, 127, 0, 0, 1]));
        assert!(guest.session.proxy().room().unwrap().is_host(2));
        assert_eq!(world.relay.host_of("retreat"), Some(2));

        guest.session.close().await;
        world.cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_relay_address() {
        let world = world().await;
        let config = Arc::new(BackendConfig {
            relay_addr: None,
            ..(*world.config).clone()
        });
        let host = member(1, &world.console, &config, &world.cancel).await;
        assert!(matches!(
            host.session
                .proxy()
                .create_room(CreateRoomParams {
                    name: "retreat".to_string(),
                    password: String::new(),
                    map_id: 4,
                })
                .await,
            Err(ProxyError::NotConfigured(_))
        ));
        host.session.close().await;
        world.cancel.cancel();
    }
}
