//! Per-player backend for the legacy Dispel client.
//!
//! The game connects to a local TCP port. [`manager::SessionManager`] turns
//! every connection into a [`session::Session`], whose opcode
//! [`handlers`] talk to the console over gRPC, to the lobby over a
//! WebSocket and to other players through a [`proxy::Proxy`].

pub mod config;
pub mod console;
pub mod error;
pub mod handlers;
pub mod hosts;
pub mod lobby;
pub mod manager;
pub mod pipe;
pub mod proxy;
pub mod redirect;
pub mod session;

pub use config::{Args, BackendConfig, ProxyMode};
pub use error::BackendError;
pub use manager::SessionManager;
