//! Central relay for dispel backends that cannot reach each other directly.
//!
//! Backends open one TCP stream per game, announce themselves with
//! [`RelayFrame::Join`] and exchange game packets as [`RelayFrame::Data`].

pub mod protocol;
pub mod server;

pub use protocol::{Proto, RelayCodec, RelayError, RelayFrame, RelayStream, connect};
pub use server::RelayServer;
