use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

pub const STATS_LEN: usize = 56;
pub const INVENTORY_LEN: usize = 207;
pub const SPELLS_LEN: usize = 43;
/// Position of the class byte inside the opaque stats blob.
pub const CLASS_TYPE_OFFSET: usize = 52;

/// Account identity as returned by the console after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum ClassType {
    #[default]
    Knight = 0,
    Warrior = 1,
    Archer = 2,
    Mage = 3,
}

impl TryFrom<u8> for ClassType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ClassType::Knight),
            1 => Ok(ClassType::Warrior),
            2 => Ok(ClassType::Archer),
            3 => Ok(ClassType::Mage),
            other => Err(other),
        }
    }
}

impl From<ClassType> for u8 {
    fn from(value: ClassType) -> Self {
        value as u8
    }
}

impl From<ClassType> for u32 {
    fn from(value: ClassType) -> Self {
        u32::from(value as u8)
    }
}

/// A character with its opaque client-side blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub id: i64,
    pub name: String,
    pub stats: [u8; STATS_LEN],
    pub inventory: [u8; INVENTORY_LEN],
    pub spells: [u8; SPELLS_LEN],
}

impl Character {
    pub fn new(id: i64, name: impl Into<String>, stats: [u8; STATS_LEN]) -> Self {
        Self {
            id,
            name: name.into(),
            stats,
            inventory: [0; INVENTORY_LEN],
            spells: [0; SPELLS_LEN],
        }
    }

    /// The class stored in the stats blob, or the raw byte if it is unknown.
    pub fn class_type(&self) -> Result<ClassType, u8> {
        ClassType::try_from(self.stats[CLASS_TYPE_OFFSET])
    }
}

/// A lobby member as exchanged with the signaling server and the console.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Player {
    #[serde(rename = "userID")]
    pub user_id: i64,
    pub username: String,
    #[serde(rename = "characterID")]
    pub character_id: i64,
    pub class_type: ClassType,
    pub ip_address: String,
}

impl Player {
    /// Peer identifier used by the lobby `from`/`to` fields.
    pub fn id(&self) -> String {
        self.user_id.to_string()
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ip_address.parse().ok()
    }
}
