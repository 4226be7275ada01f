//! Which local sockets stand in for a remote peer, depending on who hosts.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::ipring::PeerAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerMode {
    /// This session hosts the game and the peer is a guest.
    CurrentUserIsHost,
    /// The peer hosts the game.
    OtherUserIsHost,
    /// The peer is a fellow guest that joined before us.
    OtherUserHasJoined,
    /// The peer is a guest joining a game already in progress.
    OtherUserIsJoining,
    #[default]
    None,
}

impl PeerMode {
    /// Initial mode of a peer.
    pub fn classify(current_user_is_host: bool, peer_is_host: bool, peer_is_joining: bool) -> Self {
        match (current_user_is_host, peer_is_host, peer_is_joining) {
            (true, _, _) => PeerMode::CurrentUserIsHost,
            (false, true, _) => PeerMode::OtherUserIsHost,
            (false, false, true) => PeerMode::OtherUserIsJoining,
            (false, false, false) => PeerMode::OtherUserHasJoined,
        }
    }

    pub fn tcp(self, addr: PeerAddr, game_tcp_port: u16) -> RedirectKind {
        match self {
            PeerMode::CurrentUserIsHost => {
                RedirectKind::Dial(SocketAddrV4::new(Ipv4Addr::LOCALHOST, game_tcp_port))
            }
            PeerMode::OtherUserIsHost => {
                RedirectKind::Listen(SocketAddrV4::new(addr.ip, addr.tcp_port))
            }
            PeerMode::OtherUserHasJoined | PeerMode::OtherUserIsJoining | PeerMode::None => {
                RedirectKind::Noop
            }
        }
    }

    pub fn udp(self, addr: PeerAddr, game_udp_port: u16) -> RedirectKind {
        match self {
            PeerMode::CurrentUserIsHost | PeerMode::OtherUserIsJoining => {
                RedirectKind::Dial(SocketAddrV4::new(Ipv4Addr::LOCALHOST, game_udp_port))
            }
            PeerMode::OtherUserIsHost | PeerMode::OtherUserHasJoined => {
                RedirectKind::Listen(SocketAddrV4::new(addr.ip, addr.udp_port))
            }
            PeerMode::None => RedirectKind::Noop,
        }
    }
}

/// Socket shape for one transport of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectKind {
    Listen(SocketAddrV4),
    Dial(SocketAddrV4),
    Noop,
}
