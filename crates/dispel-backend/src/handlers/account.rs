use std::sync::Arc;

use dispel_core::{
    PacketType,
    packet::{AUTH_KEY, CLIENT_VERSION, HANDSHAKE_ACCEPTED, REPLY_FAILED, REPLY_OK, Reader},
};

use crate::{error::BackendError, session::Session};

/// 0x06: check the client key and version.
pub fn handshake(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = Reader::new(payload);
    let parsed = reader
        .array::<8>("auth key")
        .and_then(|key| Ok((key, reader.u32_le("client version")?)));

    match parsed {
        Ok((key, version)) if key == AUTH_KEY && version == CLIENT_VERSION => {
            session.send_packet(PacketType::AuthorizationHandshake, &HANDSHAKE_ACCEPTED)
        }
        Ok((key, version)) => {
            session.send_packet(PacketType::AuthorizationHandshake, &REPLY_FAILED)?;
            let reason = if key == AUTH_KEY {
                format!("unsupported client version {version}")
            } else {
                format!("bad auth key \"{}\"", key.escape_ascii())
            };
            Err(BackendError::ProtocolViolation(reason))
        }
        Err(err) => {
            session.send_packet(PacketType::AuthorizationHandshake, &REPLY_FAILED)?;
            Err(BackendError::ProtocolViolation(format!("short handshake: {err}")))
        }
    }
}

/// 0x1E: the client announces its host name, nothing to check.
pub fn host_and_username(session: &Arc<Session>, _payload: &[u8]) -> Result<(), BackendError> {
    session.send_packet(PacketType::ClientHostAndUsername, &REPLY_OK)
}

/// 0x29: log in and open the lobby connection.
pub async fn authenticate(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = Reader::new(payload);
    reader.u32_le("auth flags")?;
    let password = reader.cstring()?;
    let username = reader.cstring()?;

    let user = match session.console().authenticate_user(&username, &password).await {
        Ok(user) => user,
        Err(err) => {
            tracing::info!(%username, error = %err, "Login rejected");
            return session.send_packet(PacketType::ClientAuthentication, &REPLY_FAILED);
        }
    };

    tracing::info!(user_id = user.id, %username, "User logged in");
    session.set_user(user);
    session.send_packet(PacketType::ClientAuthentication, &REPLY_OK)?;
    session.connect_lobby().await
}

/// 0x2A: register a new account.
pub async fn create_account(session: &Arc<Session>, payload: &[u8]) -> Result<(), BackendError> {
    let mut reader = Reader::new(payload);
    reader.u32_le("cd key")?;
    let password = reader.cstring()?;
    let username = reader.cstring()?;

    let reply = match session.console().create_user(&username, &password).await {
        Ok(user) => {
            tracing::info!(user_id = user.id, %username, "Account created");
            REPLY_OK
        }
        Err(err) => {
            tracing::info!(%username, error = %err, "Account creation failed");
            REPLY_FAILED
        }
    };
    session.send_packet(PacketType::CreateNewAccount, &reply)
}
