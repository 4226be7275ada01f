//! Protocol and room model shared by the dispel backend and relay.

pub mod ipring;
pub mod model;
pub mod packet;
pub mod role;
pub mod room;
pub mod wire;

pub use ipring::{IpRing, IpRingError, PeerAddr};
pub use model::{Character, ClassType, Player, User};
pub use packet::{Packet, PacketBuffer, PacketError, PacketType};
pub use role::{PeerMode, RedirectKind};
pub use room::{GameRoom, RoomError};
pub use wire::{EventType, MessageContent, WireError};
