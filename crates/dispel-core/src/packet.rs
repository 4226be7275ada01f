//! Game-client packet framing.
//!
//! Every packet the legacy client exchanges with the backend is
//! `0xFF | opcode | u16 LE length | payload`, where `length` counts the
//! 4-byte header as well. Several packets may arrive in a single TCP read.

use std::net::Ipv4Addr;

pub const MARKER: u8 = 0xFF;
pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - HEADER_LEN;
/// Upper bound of packets extracted from one read buffer.
pub const MAX_SPLIT: usize = 10;

/// First raw byte sent by the client when it opens the connection.
pub const PING_BYTE: u8 = 0x01;
pub const AUTH_KEY: [u8; 8] = *b"68XIPSID";
pub const CLIENT_VERSION: u32 = 3;
pub const HANDSHAKE_ACCEPTED: [u8; 5] = *b"ENET\0";

pub const REPLY_OK: [u8; 4] = [1, 0, 0, 0];
pub const REPLY_FAILED: [u8; 4] = [0, 0, 0, 0];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("payload of {0} bytes does not fit in a packet")]
    TooLarge(usize),

    #[error("packet is shorter than its header")]
    Truncated,

    #[error("packet does not start with the 0xFF marker (got {0:#04x})")]
    BadMarker(u8),

    #[error("declared length {declared} does not match {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unexpected end of payload while reading {0}")]
    UnexpectedEnd(&'static str),

    #[error("string is not null-terminated")]
    MissingTerminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    AuthorizationHandshake = 0x06,
    ListGames = 0x09,
    ListChannels = 0x0B,
    SelectedChannel = 0x0C,
    SendLobbyMessage = 0x0E,
    ReceiveMessage = 0x0F,
    PingClockTime = 0x15,
    CreateGame = 0x1C,
    ClientHostAndUsername = 0x1E,
    JoinGame = 0x22,
    ClientAuthentication = 0x29,
    CreateNewAccount = 0x2A,
    UpdateCharacterInventory = 0x2C,
    GetCharacters = 0x3C,
    DeleteCharacter = 0x3D,
    GetCharacterInventory = 0x44,
    SelectGame = 0x45,
    ShowRanking = 0x46,
    HostMigration = 0x47,
    GetCharacterSpells = 0x48,
    UpdateCharacterSpells = 0x49,
    SelectCharacter = 0x4C,
    CreateCharacter = 0x5C,
    UpdateCharacterStats = 0x6C,
}

impl PacketType {
    pub const ALL: [PacketType; 24] = [
        PacketType::AuthorizationHandshake,
        PacketType::ListGames,
        PacketType::ListChannels,
        PacketType::SelectedChannel,
        PacketType::SendLobbyMessage,
        PacketType::ReceiveMessage,
        PacketType::PingClockTime,
        PacketType::CreateGame,
        PacketType::ClientHostAndUsername,
        PacketType::JoinGame,
        PacketType::ClientAuthentication,
        PacketType::CreateNewAccount,
        PacketType::UpdateCharacterInventory,
        PacketType::GetCharacters,
        PacketType::DeleteCharacter,
        PacketType::GetCharacterInventory,
        PacketType::SelectGame,
        PacketType::ShowRanking,
        PacketType::HostMigration,
        PacketType::GetCharacterSpells,
        PacketType::UpdateCharacterSpells,
        PacketType::SelectCharacter,
        PacketType::CreateCharacter,
        PacketType::UpdateCharacterStats,
    ];

    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Opcodes a client may send before it has authenticated.
    pub fn requires_login(self) -> bool {
        !matches!(
            self,
            PacketType::CreateNewAccount
                | PacketType::ClientAuthentication
                | PacketType::ClientHostAndUsername
                | PacketType::AuthorizationHandshake
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        PacketType::ALL
            .into_iter()
            .find(|ty| ty.opcode() == value)
            .ok_or(value)
    }
}

/// A borrowed view of one framed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    opcode: u8,
    payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        if bytes[0] != MARKER {
            return Err(PacketError::BadMarker(bytes[0]));
        }
        let declared = usize::from(u16::from_le_bytes([bytes[2], bytes[3]]));
        if declared != bytes.len() {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            opcode: bytes[1],
            payload: &bytes[HEADER_LEN..],
        })
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::try_from(self.opcode).ok()
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

/// Frame `payload` under `opcode`.
pub fn encode(opcode: u8, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let length = u16::try_from(payload.len() + HEADER_LEN)
        .map_err(|_| PacketError::TooLarge(payload.len()))?;

    let mut buf = Vec::with_capacity(usize::from(length));
    buf.push(MARKER);
    buf.push(opcode);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a read buffer into the packets it contains.
///
/// Parsing stops at the first byte that is not the marker, at a declared
/// length that does not fit in the remaining bytes, or after [`MAX_SPLIT`]
/// packets. A buffer shorter than a header is returned as-is, which is how
/// the single ping byte of the handshake is delivered.
pub fn split(buf: &[u8]) -> Vec<&[u8]> {
    if buf.len() < HEADER_LEN {
        return vec![buf];
    }

    let mut packets = Vec::new();
    let mut offset = 0;
    while packets.len() < MAX_SPLIT && buf.len() - offset >= HEADER_LEN {
        let rest = &buf[offset..];
        if rest[0] != MARKER {
            break;
        }
        let length = usize::from(u16::from_le_bytes([rest[2], rest[3]]));
        if length < HEADER_LEN || length > rest.len() {
            break;
        }
        packets.push(&rest[..length]);
        offset += length;
    }
    packets
}

/// Accumulates stream reads and yields whole packets.
///
/// A trailing partial packet stays buffered until the rest arrives. Bytes
/// that can never start a packet are discarded.
#[derive(Debug, Default, Clone)]
pub struct PacketBuffer {
    buf: Vec<u8>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Drained {
    pub packets: Vec<Vec<u8>>,
    pub discarded: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, data: &[u8]) -> Drained {
        self.buf.extend_from_slice(data);

        let mut drained = Drained::default();
        loop {
            if self.buf.len() < HEADER_LEN {
                if self.buf.first().is_some_and(|&b| b != MARKER) {
                    drained.discarded += self.buf.len();
                    self.buf.clear();
                }
                break;
            }

            let packets = split(&self.buf);
            let consumed: usize = packets.iter().map(|p| p.len()).sum();
            drained
                .packets
                .extend(packets.into_iter().map(<[u8]>::to_vec));
            self.buf.drain(..consumed);

            if consumed > 0 {
                continue;
            }
            if self.buf.len() >= HEADER_LEN {
                let declared = usize::from(u16::from_le_bytes([self.buf[2], self.buf[3]]));
                if self.buf[0] != MARKER || declared < HEADER_LEN {
                    drained.discarded += self.buf.len();
                    self.buf.clear();
                }
            }
            break;
        }
        drained
    }
}

/// Sequential little-endian reader over a packet payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], PacketError> {
        if self.remaining() < n {
            return Err(PacketError::UnexpectedEnd(what));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N, what)?);
        Ok(out)
    }

    pub fn u16_le(&mut self, what: &'static str) -> Result<u16, PacketError> {
        Ok(u16::from_le_bytes(self.array(what)?))
    }

    pub fn u32_le(&mut self, what: &'static str) -> Result<u32, PacketError> {
        Ok(u32::from_le_bytes(self.array(what)?))
    }

    /// Read a null-terminated ASCII string, consuming the terminator.
    pub fn cstring(&mut self) -> Result<String, PacketError> {
        let rest = &self.buf[self.pos..];
        let Some(end) = rest.iter().position(|&b| b == 0) else {
            return Err(PacketError::MissingTerminator);
        };
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(value)
    }

    /// Like [`Reader::cstring`], but an exhausted payload yields `None`.
    pub fn optional_cstring(&mut self) -> Result<Option<String>, PacketError> {
        if self.is_empty() {
            return Ok(None);
        }
        self.cstring().map(Some)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Builder for little-endian response payloads.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u16_le(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32_le(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn cstring(&mut self, value: &str) -> &mut Self {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn ipv4(&mut self, value: Ipv4Addr) -> &mut Self {
        self.buf.extend_from_slice(&value.octets());
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
