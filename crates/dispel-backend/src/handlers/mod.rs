//! Game-client opcode handlers.
//!
//! Every handler parses its payload, calls the console or the proxy and
//! queues its reply on the session. Console failures turn into the fixed
//! negative reply of the opcode; they never reach the client as errors.

mod account;
mod character;
mod chat;
mod game;

use std::sync::Arc;

use dispel_core::{Packet, PacketType};

use crate::{error::BackendError, session::Session};

/// Name of the only channel the backend offers.
pub const CHANNEL_NAME: &str = "DISPEL";

/// Run the handler for one packet.
///
/// Unknown opcodes and malformed payloads are logged and skipped. Errors
/// returned here are the ones the session has to act on.
pub async fn dispatch(session: &Arc<Session>, packet: Packet<'_>) -> Result<(), BackendError> {
    let Some(ty) = packet.packet_type() else {
        tracing::warn!(opcode = packet.opcode(), "Unknown opcode");
        return Ok(());
    };
    if ty.requires_login() && !session.is_logged_in() {
        return Err(BackendError::UserNotLoggedIn);
    }
    tracing::debug!(opcode = ty.opcode(), ?ty, len = packet.payload().len(), "Packet");

    let payload = packet.payload();
    let result = match ty {
        PacketType::AuthorizationHandshake => account::handshake(session, payload),
        PacketType::ClientHostAndUsername => account::host_and_username(session, payload),
        PacketType::ClientAuthentication => account::authenticate(session, payload).await,
        PacketType::CreateNewAccount => account::create_account(session, payload).await,

        PacketType::ListGames => game::list_games(session).await,
        PacketType::ListChannels => game::list_channels(session),
        PacketType::SelectedChannel => Ok(()),
        PacketType::PingClockTime => game::ping(session, payload),
        PacketType::CreateGame => game::create_game(session, payload).await,
        PacketType::JoinGame => game::join_game(session, payload).await,
        PacketType::SelectGame => game::select_game(session, payload).await,

        PacketType::SendLobbyMessage => chat::send_lobby_message(session, payload).await,

        PacketType::GetCharacters => character::get_characters(session, payload).await,
        PacketType::DeleteCharacter => character::delete_character(session, payload).await,
        PacketType::SelectCharacter => character::select_character(session, payload).await,
        PacketType::CreateCharacter => character::create_character(session, payload).await,
        PacketType::GetCharacterInventory => character::get_inventory(session, payload).await,
        PacketType::UpdateCharacterInventory => character::update_inventory(session, payload).await,
        PacketType::GetCharacterSpells => character::get_spells(session, payload).await,
        PacketType::UpdateCharacterSpells => character::update_spells(session, payload).await,
        PacketType::UpdateCharacterStats => character::update_stats(session, payload).await,
        PacketType::ShowRanking => character::show_ranking(session, payload).await,

        PacketType::ReceiveMessage | PacketType::HostMigration => {
            tracing::debug!(opcode = ty.opcode(), "Ignoring server-only opcode");
            Ok(())
        }
    };

    match result {
        Err(BackendError::PacketMalformed(err)) => {
            tracing::warn!(opcode = ty.opcode(), error = %err, "Malformed packet");
            Ok(())
        }
        other => other,
    }
}
