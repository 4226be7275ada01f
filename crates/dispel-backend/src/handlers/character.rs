use std::sync::Arc;

use dispel_core::{
    Character, PacketType,
    model::{INVENTORY_LEN, SPELLS_LEN, STATS_LEN},
    packet::{REPLY_FAILED, REPLY_OK, Reader, Writer},
};

use crate::{
    console::{ConsoleError, RankingEntry},
    error::BackendError,
    session::{MESSAGE_SYSTEM, Session},
};

/// Spell slots the client expects to be non-zero.
const SPELL_SLOTS: usize = 41;

/// Reader positioned after the `username\0` the client prefixes every
/// character request with. The username is ignored, the session's user wins.
fn after_username(payload: &[u8]) -> Result<Reader<'_>, BackendError> {
    let mut reader = Reader::new(payload);
    reader.cstring()?;
    Ok(reader)
}

fn character_list(characters: &[Character]) -> Vec<u8> {
    if characters.is_empty() {
        return REPLY_FAILED.to_vec();
    }
    let mut writer = Writer::new();
    writer
        .bytes(&REPLY_OK)
        .u32_le(u32::try_from(characters.len()).unwrap_or(u32::MAX));
    for character in characters {
        writer.cstring(&character.name);
    }
    writer.into_inner()
}

/// Refresh the cached character if it is the one that changed.
fn update_cached(session: &Session, name: &str, apply: impl FnOnce(&mut Character)) {
    if let Some(mut character) = session.character().filter(|c| c.name == name) {
        apply(&mut character);
        session.set_character(character);
    }
}

/// 0x3C
pub async fn get_characters(session: &Arc<Session>, _payload: &[u8]) -> Result<(), BackendError> {
    let characters = match session.console().list_characters(session.user_id()).await {
        Ok(characters) => characters,
        Err(err) => {
            tracing::warn!(error = %err, "Could not list characters");
            Vec::new()
        }
    };
    session.send_packet(PacketType::GetCharacters, &character_list(&characters))
}

/// 0x3D: delete, then answer with what is left.
pub async fn delete_character(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let name = after_username(payload)?.cstring()?;
    let user_id = session.user_id();
    match session.console().delete_character(user_id, &name).await {
        Ok(()) => tracing::info!(character = %name, "Character deleted"),
        Err(err) => tracing::warn!(character = %name, error = %err, "Could not delete character"),
    }

    let characters = session
        .console()
        .list_characters(user_id)
        .await
        .unwrap_or_default();
    session.send_packet(PacketType::DeleteCharacter, &character_list(&characters))
}

/// 0x44: the first packet after picking a character. Sends the inventory
/// and joins the lobby.
pub async fn get_inventory(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let name = after_username(payload)?.cstring()?;
    let character = match session.console().get_character(session.user_id(), &name).await {
        Ok(character) => character,
        Err(ConsoleError::NotFound(_)) => {
            tracing::debug!(character = %name, "No inventory for unknown character");
            return Ok(());
        }
        Err(err) => {
            tracing::warn!(character = %name, error = %err, "Inventory fetch failed");
            return session.send_message(MESSAGE_SYSTEM, "system", "Inventory fetch failed");
        }
    };

    session.send_packet(PacketType::GetCharacterInventory, &character.inventory)?;
    session.set_character(character);
    session.on_character_selected().await
}

/// 0x2C
pub async fn update_inventory(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = after_username(payload)?;
    let name = reader.cstring()?;
    let inventory = reader.array::<INVENTORY_LEN>("inventory")?;

    session
        .console()
        .put_inventory(session.user_id(), &name, inventory)
        .await?;
    update_cached(session, &name, |c| c.inventory = inventory);
    Ok(())
}

/// 0x48
pub async fn get_spells(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let name = after_username(payload)?.cstring()?;
    let character = match session.console().get_character(session.user_id(), &name).await {
        Ok(character) => character,
        Err(err) => {
            tracing::warn!(character = %name, error = %err, "Could not fetch spells");
            return Ok(());
        }
    };

    let mut spells = character.spells;
    for slot in spells.iter_mut().take(SPELL_SLOTS) {
        if *slot == 0 {
            *slot = 1;
        }
    }
    session.send_packet(PacketType::GetCharacterSpells, &spells)
}

/// 0x49
pub async fn update_spells(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = after_username(payload)?;
    let name = reader.cstring()?;
    let spells = reader.array::<SPELLS_LEN>("spells")?;

    session
        .console()
        .put_spells(session.user_id(), &name, spells)
        .await?;
    update_cached(session, &name, |c| c.spells = spells);
    session.send_packet(PacketType::UpdateCharacterSpells, &REPLY_OK)
}

/// 0x4C
pub async fn select_character(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let name = after_username(payload)?.cstring()?;
    let character = match session.console().get_character(session.user_id(), &name).await {
        Ok(character) => character,
        Err(err) => {
            tracing::info!(character = %name, error = %err, "Character selection failed");
            return session.send_packet(PacketType::SelectCharacter, &REPLY_FAILED);
        }
    };

    let mut writer = Writer::new();
    writer.bytes(&REPLY_OK).bytes(&character.stats);
    session.send_packet(PacketType::SelectCharacter, &writer.into_inner())?;

    tracing::info!(character_id = character.id, character = %name, "Character selected");
    session.set_character(character);
    session.on_character_selected().await
}

/// 0x5C
pub async fn create_character(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = Reader::new(payload);
    let stats = reader.array::<STATS_LEN>("stats")?;
    reader.cstring()?;
    let name = reader.cstring()?;

    let reply = match session
        .console()
        .create_character(session.user_id(), &name, stats)
        .await
    {
        Ok(character) => {
            tracing::info!(character_id = character.id, character = %name, "Character created");
            REPLY_OK
        }
        Err(err) => {
            tracing::info!(character = %name, error = %err, "Character creation failed");
            REPLY_FAILED
        }
    };
    session.send_packet(PacketType::CreateCharacter, &reply)
}

/// 0x6C
pub async fn update_stats(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = Reader::new(payload);
    let stats = reader.array::<STATS_LEN>("stats")?;
    reader.cstring()?;
    let name = reader.cstring()?;

    match session.console().put_stats(session.user_id(), &name, stats).await {
        Ok(()) => {
            update_cached(session, &name, |c| c.stats = stats);
            session.send_packet(PacketType::UpdateCharacterStats, &[])
        }
        Err(err) => {
            tracing::warn!(character = %name, error = %err, "Could not save stats");
            Ok(())
        }
    }
}

fn write_entry(writer: &mut Writer, entry: &RankingEntry) {
    writer
        .u32_le(entry.position)
        .u32_le(entry.points)
        .cstring(&entry.username)
        .cstring(&entry.character);
}

/// 0x46: the caller's own position followed by one page of the table.
pub async fn show_ranking(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = Reader::new(payload);
    let class_type = reader.u32_le("class type")?;
    let offset = reader.u32_le("offset")?;
    reader.cstring()?;
    let character = reader.cstring()?;

    let ranking = match session
        .console()
        .get_ranking(session.user_id(), &character, class_type, offset)
        .await
    {
        Ok(ranking) => ranking,
        Err(err) => {
            tracing::warn!(class_type, offset, error = %err, "Could not fetch ranking");
            return Ok(());
        }
    };

    let mut writer = Writer::new();
    write_entry(&mut writer, &ranking.current.unwrap_or_default());
    writer.u32_le(u32::try_from(ranking.players.len()).unwrap_or(u32::MAX));
    for entry in &ranking.players {
        write_entry(&mut writer, entry);
    }
    session.send_packet(PacketType::ShowRanking, &writer.into_inner())
}
