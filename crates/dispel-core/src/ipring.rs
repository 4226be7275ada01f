//! Loopback address allocation for remote peers.
//!
//! Every remote peer is presented to the game client as a distinct LAN
//! neighbour on `<prefix>.N`. The ring hands out the last octet in
//! `FIRST_OCTET..=LAST_OCTET`, continuing after the most recent assignment
//! and wrapping around, so a freshly released address is not reused at once.

use std::collections::HashMap;
use std::net::Ipv4Addr;

pub const FIRST_OCTET: u8 = 2;
pub const LAST_OCTET: u8 = 254;

pub const DEFAULT_P2P_PREFIX: [u8; 3] = [127, 0, 1];
pub const DEFAULT_HOST_PREFIX: [u8; 3] = [127, 0, 0];

pub const DEFAULT_TCP_PORT: u16 = 6114;
pub const DEFAULT_UDP_PORT: u16 = 6113;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IpRingError {
    #[error("no free address left in {}.{}.{}.0/24", .0[0], .0[1], .0[2])]
    Exhausted([u8; 3]),
}

/// Where a remote peer lives from the game client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub ip: Ipv4Addr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

#[derive(Debug, Clone)]
pub struct IpRing {
    prefix: [u8; 3],
    tcp_port: u16,
    udp_port: u16,
    cursor: u8,
    assigned: HashMap<String, u8>,
}

impl IpRing {
    pub fn new(prefix: [u8; 3]) -> Self {
        Self::with_ports(prefix, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT)
    }

    pub fn with_ports(prefix: [u8; 3], tcp_port: u16, udp_port: u16) -> Self {
        Self {
            prefix,
            tcp_port,
            udp_port,
            cursor: LAST_OCTET,
            assigned: HashMap::new(),
        }
    }

    pub fn prefix(&self) -> [u8; 3] {
        self.prefix
    }

    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerAddr> {
        self.assigned.get(peer_id).map(|&octet| self.addr(octet))
    }

    /// Address of `peer_id`, allocating one on first use.
    pub fn assign(&mut self, peer_id: &str) -> Result<PeerAddr, IpRingError> {
        if let Some(addr) = self.get(peer_id) {
            return Ok(addr);
        }

        let capacity = usize::from(LAST_OCTET - FIRST_OCTET) + 1;
        if self.assigned.len() >= capacity {
            return Err(IpRingError::Exhausted(self.prefix));
        }

        let mut candidate = self.cursor;
        loop {
            candidate = if candidate >= LAST_OCTET {
                FIRST_OCTET
            } else {
                candidate + 1
            };
            if !self.assigned.values().any(|&used| used == candidate) {
                break;
            }
        }

        self.cursor = candidate;
        self.assigned.insert(peer_id.to_string(), candidate);
        Ok(self.addr(candidate))
    }

    pub fn release(&mut self, peer_id: &str) -> Option<PeerAddr> {
        self.assigned
            .remove(peer_id)
            .map(|octet| self.addr(octet))
    }

    fn addr(&self, octet: u8) -> PeerAddr {
        let [a, b, c] = self.prefix;
        PeerAddr {
            ip: Ipv4Addr::new(a, b, c, octet),
            tcp_port: self.tcp_port,
            udp_port: self.udp_port,
        }
    }
}

impl Default for IpRing {
    fn default() -> Self {
        Self::new(DEFAULT_P2P_PREFIX)
    }
}
