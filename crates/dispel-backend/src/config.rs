use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Parser, ValueEnum};
use dispel_core::ipring::{DEFAULT_HOST_PREFIX, DEFAULT_P2P_PREFIX, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProxyMode {
    /// Players share a LAN and talk to each other directly.
    Lan,
    /// WebRTC data channels between backends.
    #[default]
    P2p,
    /// Game traffic goes through a central relay server.
    Relay,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--relay-addr is required in relay mode")]
    MissingRelayAddr,

    #[error("invalid /24 prefix '{0}', expected three octets such as 127.0.1")]
    InvalidPrefix(String),
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Backend agent for Dispel multiplayer")]
pub struct Args {
    /// Address the game client connects to.
    #[arg(long, env = "DISPEL_BIND", default_value = "127.0.0.1:6112")]
    pub bind: SocketAddr,

    /// Console gRPC endpoint.
    #[arg(long, env = "DISPEL_CONSOLE_URL", default_value = "http://127.0.0.1:61455")]
    pub console_url: String,

    /// Signaling server WebSocket endpoint.
    #[arg(long, env = "DISPEL_LOBBY_URL", default_value = "ws://127.0.0.1:61455/lobby/ws")]
    pub lobby_url: String,

    #[arg(long, env = "DISPEL_MODE", value_enum, default_value_t = ProxyMode::P2p)]
    pub mode: ProxyMode,

    /// Address announced to other players in LAN mode.
    #[arg(long, env = "DISPEL_LAN_IP", default_value_t = Ipv4Addr::LOCALHOST)]
    pub lan_ip: Ipv4Addr,

    #[arg(long, env = "DISPEL_RELAY_ADDR")]
    pub relay_addr: Option<String>,

    /// STUN/TURN server URL, may be repeated.
    #[arg(long = "ice-server", env = "DISPEL_ICE_SERVERS", value_delimiter = ',')]
    pub ice_servers: Vec<String>,

    /// First three octets of the loopback range handed out to remote peers.
    #[arg(long, env = "DISPEL_LOOPBACK_PREFIX", value_parser = parse_prefix)]
    pub loopback_prefix: Option<[u8; 3]>,

    #[arg(long, default_value_t = DEFAULT_TCP_PORT)]
    pub game_tcp_port: u16,

    #[arg(long, default_value_t = DEFAULT_UDP_PORT)]
    pub game_udp_port: u16,

    #[arg(long, default_value_t = 5)]
    pub console_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub peer_connect_timeout_secs: u64,
}

fn parse_prefix(value: &str) -> Result<[u8; 3], ConfigError> {
    let octets: Vec<u8> = value
        .trim_end_matches('.')
        .split('.')
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| ConfigError::InvalidPrefix(value.to_string()))?;
    <[u8; 3]>::try_from(octets).map_err(|_| ConfigError::InvalidPrefix(value.to_string()))
}

/// Settings consumed by the backend library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub bind: SocketAddr,
    pub console_url: String,
    pub lobby_url: String,
    pub mode: ProxyMode,
    pub lan_ip: Ipv4Addr,
    pub relay_addr: Option<String>,
    pub ice_servers: Vec<String>,
    pub loopback_prefix: [u8; 3],
    pub game_tcp_port: u16,
    pub game_udp_port: u16,
    pub console_timeout: Duration,
    pub peer_connect_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 6112)),
            console_url: "http://127.0.0.1:61455".to_string(),
            lobby_url: "ws://127.0.0.1:61455/lobby/ws".to_string(),
            mode: ProxyMode::P2p,
            lan_ip: Ipv4Addr::LOCALHOST,
            relay_addr: None,
            ice_servers: Vec::new(),
            loopback_prefix: DEFAULT_P2P_PREFIX,
            game_tcp_port: DEFAULT_TCP_PORT,
            game_udp_port: DEFAULT_UDP_PORT,
            console_timeout: Duration::from_secs(5),
            peer_connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TryFrom<Args> for BackendConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.mode == ProxyMode::Relay && args.relay_addr.is_none() {
            return Err(ConfigError::MissingRelayAddr);
        }
        let default_prefix = match args.mode {
            ProxyMode::Relay => DEFAULT_HOST_PREFIX,
            ProxyMode::Lan | ProxyMode::P2p => DEFAULT_P2P_PREFIX,
        };
        Ok(Self {
            bind: args.bind,
            console_url: args.console_url,
            lobby_url: args.lobby_url,
            mode: args.mode,
            lan_ip: args.lan_ip,
            relay_addr: args.relay_addr,
            ice_servers: args.ice_servers,
            loopback_prefix: args.loopback_prefix.unwrap_or(default_prefix),
            game_tcp_port: args.game_tcp_port,
            game_udp_port: args.game_udp_port,
            console_timeout: Duration::from_secs(args.console_timeout_secs),
            peer_connect_timeout: Duration::from_secs(args.peer_connect_timeout_secs),
        })
    }
}
