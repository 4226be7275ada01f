//! Fake hosts: loopback endpoints impersonating remote players.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use dispel_core::{
    IpRingError, PeerAddr, PeerMode,
    ipring::{FIRST_OCTET, LAST_OCTET},
};
use dispel_relay::Proto;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::redirect::{self, PacketSink, Redirect, RedirectError};

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    IpRing(#[from] IpRingError),

    #[error(transparent)]
    Redirect(#[from] RedirectError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    /// The remote player hosts: the game connects to us.
    Listen,
    /// The remote player is a guest of our game: we connect to the game.
    Dial,
}

pub struct FakeHost {
    kind: HostKind,
    peer_id: String,
    addr: PeerAddr,
    tcp: Arc<dyn Redirect>,
    udp: Arc<dyn Redirect>,
    stop: CancellationToken,
}

impl FakeHost {
    pub fn kind(&self) -> HostKind {
        self.kind
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.addr.ip
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn is_alive(&self) -> bool {
        !self.stop.is_cancelled()
    }

    pub fn write(&self, proto: Proto, payload: Bytes) -> Result<(), RedirectError> {
        match proto {
            Proto::Tcp => self.tcp.write(payload),
            Proto::Udp => self.udp.write(payload),
        }
    }

    fn shutdown(&self) {
        self.stop.cancel();
        self.tcp.close();
        self.udp.close();
    }
}

#[derive(Default)]
struct HostMaps {
    by_peer: HashMap<String, Arc<FakeHost>>,
    by_ip: HashMap<Ipv4Addr, Arc<FakeHost>>,
    ips: HashMap<String, Ipv4Addr>,
}

/// Owns every fake host of one session.
pub struct HostManager {
    prefix: [u8; 3],
    game_tcp_port: u16,
    game_udp_port: u16,
    maps: Mutex<HostMaps>,
}

impl HostManager {
    pub fn new(prefix: [u8; 3], game_tcp_port: u16, game_udp_port: u16) -> Self {
        Self {
            prefix,
            game_tcp_port,
            game_udp_port,
            maps: Mutex::new(HostMaps::default()),
        }
    }

    /// Loopback address for `peer_id`: the one already assigned, or the
    /// lowest free one in the prefix.
    pub fn assign_ip(&self, peer_id: &str) -> Result<PeerAddr, IpRingError> {
        let mut maps = self.maps.lock();
        if let Some(&ip) = maps.ips.get(peer_id) {
            return Ok(self.peer_addr(ip));
        }
        let [a, b, c] = self.prefix;
        let ip = (FIRST_OCTET..=LAST_OCTET)
            .map(|octet| Ipv4Addr::new(a, b, c, octet))
            .find(|ip| !maps.ips.values().any(|used| used == ip))
            .ok_or(IpRingError::Exhausted(self.prefix))?;
        maps.ips.insert(peer_id.to_string(), ip);
        Ok(self.peer_addr(ip))
    }

    pub fn ip_of(&self, peer_id: &str) -> Option<Ipv4Addr> {
        self.maps.lock().ips.get(peer_id).copied()
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<FakeHost>> {
        self.maps.lock().by_peer.get(peer_id).cloned()
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<Arc<FakeHost>> {
        self.maps.lock().by_ip.get(&ip).cloned()
    }

    /// Listen for the game on the peer's loopback address. Used when the
    /// remote player hosts.
    pub async fn start_host(
        &self,
        peer_id: &str,
        tcp_sink: Arc<dyn PacketSink>,
        udp_sink: Arc<dyn PacketSink>,
        parent: &CancellationToken,
    ) -> Result<Arc<FakeHost>, HostError> {
        self.start(
            HostKind::Listen,
            PeerMode::OtherUserIsHost,
            peer_id,
            tcp_sink,
            udp_sink,
            parent,
        )
        .await
    }

    /// Dial the local game on behalf of a remote guest. Used when this
    /// session hosts.
    pub async fn start_guest(
        &self,
        peer_id: &str,
        tcp_sink: Arc<dyn PacketSink>,
        udp_sink: Arc<dyn PacketSink>,
        parent: &CancellationToken,
    ) -> Result<Arc<FakeHost>, HostError> {
        self.start(
            HostKind::Dial,
            PeerMode::CurrentUserIsHost,
            peer_id,
            tcp_sink,
            udp_sink,
            parent,
        )
        .await
    }

    async fn start(
        &self,
        kind: HostKind,
        mode: PeerMode,
        peer_id: &str,
        tcp_sink: Arc<dyn PacketSink>,
        udp_sink: Arc<dyn PacketSink>,
        parent: &CancellationToken,
    ) -> Result<Arc<FakeHost>, HostError> {
        if let Some(host) = self.get(peer_id).filter(|host| host.is_alive()) {
            return Ok(host);
        }

        let addr = self.assign_ip(peer_id)?;
        let tcp = redirect::build_tcp(mode.tcp(addr, self.game_tcp_port)).await?;
        let udp = match redirect::build_udp(mode.udp(addr, self.game_udp_port)).await {
            Ok(udp) => udp,
            Err(err) => {
                tcp.close();
                return Err(err.into());
            }
        };

        let host = Arc::new(FakeHost {
            kind,
            peer_id: peer_id.to_string(),
            addr,
            tcp,
            udp,
            stop: parent.child_token(),
        });

        let mut group = JoinSet::new();
        for (redirect, sink) in [(host.tcp.clone(), tcp_sink), (host.udp.clone(), udp_sink)] {
            let stop = host.stop.clone();
            group.spawn(async move { redirect.run(stop, sink).await });
        }
        let supervised = host.clone();
        tokio::spawn(
            async move {
                let result = group.join_next().await;
                supervised.shutdown();
                match result {
                    Some(Ok(Err(err))) => {
                        tracing::warn!(peer_id = %supervised.peer_id, error = %err, "Fake host failed");
                    }
                    _ => tracing::debug!(peer_id = %supervised.peer_id, "Fake host stopped"),
                }
            }
            .instrument(tracing::Span::current()),
        );

        let previous = {
            let mut maps = self.maps.lock();
            maps.by_ip.insert(addr.ip, host.clone());
            maps.by_peer.insert(peer_id.to_string(), host.clone())
        };
        if let Some(previous) = previous {
            previous.shutdown();
        }

        tracing::info!(peer_id, ip = %addr.ip, ?kind, "Fake host started");
        Ok(host)
    }

    /// Stop the fake host of `peer_id` and free its address.
    pub fn stop_host(&self, peer_id: &str) -> bool {
        let host = {
            let mut maps = self.maps.lock();
            if let Some(ip) = maps.ips.remove(peer_id) {
                maps.by_ip.remove(&ip);
            }
            maps.by_peer.remove(peer_id)
        };
        match host {
            Some(host) => {
                host.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let hosts: Vec<Arc<FakeHost>> = {
            let mut maps = self.maps.lock();
            maps.ips.clear();
            maps.by_ip.clear();
            maps.by_peer.drain().map(|(_, host)| host).collect()
        };
        for host in hosts {
            host.shutdown();
        }
    }

    fn peer_addr(&self, ip: Ipv4Addr) -> PeerAddr {
        PeerAddr {
            ip,
            tcp_port: self.game_tcp_port,
            udp_port: self.game_udp_port,
        }
    }
}
