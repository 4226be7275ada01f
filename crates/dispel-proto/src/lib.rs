//! Dispel console protocol library
//!
//! Generated protobuf types and gRPC clients for the `console.v1` services:
//! accounts, characters, the game-room registry and rankings.
//!
//! # Features
//! - `client`: generate the unary gRPC clients

#[allow(clippy::pedantic)]
pub mod v1 {
    #[cfg(feature = "client")]
    tonic::include_proto!("console.v1");

    #[cfg(not(feature = "client"))]
    include!(concat!(env!("OUT_DIR"), "/console.v1.rs"));
}
