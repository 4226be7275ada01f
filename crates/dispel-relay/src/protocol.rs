//! Relay stream framing.
//!
//! Each frame is a postcard-encoded [`RelayFrame`] behind a big-endian `u32`
//! length prefix.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

/// Largest frame accepted on a relay stream. Game packets never exceed 64 KiB.
pub const MAX_FRAME_LEN: usize = 128 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("expected a Join frame first")]
    NotJoined,

    #[error("relay stream closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Proto {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// First frame of every connection.
    Join {
        room: String,
        user_id: i64,
        host: bool,
    },
    /// A member is present in the room. Sent for every existing member to
    /// a newcomer and for the newcomer to everyone else.
    Joined { user_id: i64, host: bool },
    Data {
        from: i64,
        to: i64,
        proto: Proto,
        payload: Vec<u8>,
    },
    Leave { user_id: i64 },
    HostMigration { room: String, new_host: i64 },
}

/// [`LengthDelimitedCodec`] carrying [`RelayFrame`]s.
#[derive(Debug)]
pub struct RelayCodec {
    inner: LengthDelimitedCodec,
}

impl RelayCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RelayCodec {
    type Item = RelayFrame;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(postcard::from_bytes(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<RelayFrame> for RelayCodec {
    type Error = RelayError;

    fn encode(&mut self, item: RelayFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = postcard::to_allocvec(&item)?;
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

pub type RelayStream = Framed<TcpStream, RelayCodec>;

pub async fn connect(addr: impl ToSocketAddrs) -> Result<RelayStream, RelayError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, RelayCodec::new()))
}
