//! Lobby wire codec.
//!
//! Every WebSocket frame exchanged with the signaling server is a one-byte
//! event tag followed by a serialized [`MessageContent`]. The tag numbering
//! is shared with the signaling server and every other backend.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::model::Player;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    Hello = 1,
    Welcome = 2,
    LobbyUsers = 3,
    JoinLobby = 4,
    JoinedLobby = 5,
    LeaveLobby = 6,
    Chat = 7,
    CreateRoom = 8,
    SetRoomReady = 9,
    JoinRoom = 10,
    LeaveRoom = 11,
    RtcOffer = 12,
    RtcAnswer = 13,
    RtcIceCandidate = 14,
    HostMigration = 15,
}

impl EventType {
    pub const ALL: [EventType; 15] = [
        EventType::Hello,
        EventType::Welcome,
        EventType::LobbyUsers,
        EventType::JoinLobby,
        EventType::JoinedLobby,
        EventType::LeaveLobby,
        EventType::Chat,
        EventType::CreateRoom,
        EventType::SetRoomReady,
        EventType::JoinRoom,
        EventType::LeaveRoom,
        EventType::RtcOffer,
        EventType::RtcAnswer,
        EventType::RtcIceCandidate,
        EventType::HostMigration,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for EventType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        EventType::ALL
            .into_iter()
            .find(|event| event.tag() == value)
            .ok_or(WireError::UnknownEvent(value))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unknown event tag {0}")]
    UnknownEvent(u8),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Tag of a raw frame, `0` for an empty one.
pub fn parse_event_type(frame: &[u8]) -> u8 {
    frame.first().copied().unwrap_or(0)
}

/// Envelope around every typed lobby message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent<T> {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub content: T,
}

impl<T> MessageContent<T> {
    pub fn new(content: T) -> Self {
        Self {
            from: String::new(),
            to: String::new(),
            content,
        }
    }

    #[must_use]
    pub fn with_to(mut self, recipient: impl Into<String>) -> Self {
        self.to = recipient.into();
        self
    }

    #[must_use]
    pub fn with_from(mut self, sender: impl Into<String>) -> Self {
        self.from = sender.into();
        self
    }
}

/// Pluggable serializer for frame bodies.
pub trait Format {
    fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError>;
    fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError>;
}

/// JSON bodies, the format spoken by the signaling server.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Format for Json {
    fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postcard;

impl Format for Postcard {
    fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
        Ok(postcard::to_allocvec(value)?)
    }

    fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

pub fn compose<T: Serialize>(
    event: EventType,
    message: &MessageContent<T>,
) -> Result<Vec<u8>, WireError> {
    compose_with::<Json, T>(event, message)
}

pub fn compose_with<F: Format, T: Serialize>(
    event: EventType,
    message: &MessageContent<T>,
) -> Result<Vec<u8>, WireError> {
    let body = F::to_vec(message)?;
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.push(event.tag());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// A frame that consists of the tag only, such as `Welcome`.
pub fn bare(event: EventType) -> Vec<u8> {
    vec![event.tag()]
}

pub fn decode<T: DeserializeOwned>(
    frame: &[u8],
) -> Result<(EventType, MessageContent<T>), WireError> {
    decode_with::<Json, T>(frame)
}

pub fn decode_with<F: Format, T: DeserializeOwned>(
    frame: &[u8],
) -> Result<(EventType, MessageContent<T>), WireError> {
    let event = decode_event(frame)?;
    let message = F::from_slice(&frame[1..])?;
    Ok((event, message))
}

pub fn decode_event(frame: &[u8]) -> Result<EventType, WireError> {
    match frame.first() {
        Some(&tag) => EventType::try_from(tag),
        None => Err(WireError::Empty),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LobbyUsers {
    pub players: Vec<Player>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chat {
    pub user: String,
    pub text: String,
}

/// Room announcement for `CreateRoom` and `SetRoomReady`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Room {
    pub name: String,
    pub password: String,
    #[serde(rename = "mapID")]
    pub map_id: u32,
    pub host: Player,
}

/// Membership change for `JoinRoom` and `LeaveRoom`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomMember {
    pub member: Player,
    pub room_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    #[default]
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtcOffer {
    #[serde(rename = "gameID")]
    pub game_id: String,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtcAnswer {
    #[serde(rename = "gameID")]
    pub game_id: String,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtcCandidate {
    #[serde(rename = "gameID")]
    pub game_id: String,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostMigration {
    #[serde(rename = "gameID")]
    pub game_id: String,
    pub new_host: Player,
}
