//! Accepts game clients and owns their sessions.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use dispel_core::{
    Packet, PacketBuffer, PacketType,
    packet::PING_BYTE,
};
use parking_lot::RwLock;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::BackendConfig,
    console::Console,
    error::BackendError,
    handlers,
    session::{MESSAGE_SYSTEM, Session},
};

const READ_BUFFER: usize = 4096;
/// How long queued packets may take to reach a closing client.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// Packets the client must send, in order, right after the ping byte.
const HANDSHAKE: [PacketType; 2] = [
    PacketType::ClientHostAndUsername,
    PacketType::AuthorizationHandshake,
];

pub const SHUTDOWN_MESSAGE: &str = "server closing";

pub struct SessionManager {
    console: Arc<dyn Console>,
    config: Arc<BackendConfig>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(console: Arc<dyn Console>, config: BackendConfig) -> Arc<Self> {
        Arc::new(Self {
            console,
            config: Arc::new(config),
            sessions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Bind the game-facing socket.
    pub async fn start(&self) -> Result<TcpListener, BackendError> {
        let listener = TcpListener::bind(self.config.bind).await?;
        tracing::info!(addr = %listener.local_addr()?, mode = ?self.config.mode, "Backend listening");
        Ok(listener)
    }

    /// Accept clients until [`SessionManager::shutdown`] is called.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) -> Result<(), BackendError> {
        loop {
            let (stream, peer) = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let manager = self.clone();
            tokio::spawn(async move {
                manager.handle_client(stream, peer).await;
            });
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %err, "Could not disable nagle");
        }
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(self.console.clone(), self.config.clone(), tx, &self.cancel);
        let span = session.span().clone();
        self.sessions.write().insert(session.id(), session.clone());
        tracing::info!(parent: &span, %peer, "Game client connected");

        let mut flush = tokio::spawn(write_packets(writer, rx).instrument(span.clone()));

        match serve(&session, reader).instrument(span.clone()).await {
            Ok(()) | Err(BackendError::Cancelled) => {}
            Err(err) => tracing::warn!(parent: &span, error = %err, "Session ended with error"),
        }

        self.close_session(&session).await;
        drop(session);
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut flush).await.is_err() {
            flush.abort();
        }
        tracing::info!(parent: &span, %peer, "Game client disconnected");
    }

    /// Close the session's proxy and lobby and forget it.
    pub async fn close_session(&self, session: &Session) {
        session.close().await;
        self.sessions.write().remove(&session.id());
    }

    /// Tell every client the server is going away, then close everything.
    pub async fn shutdown(&self) {
        let sessions = self.sessions();
        tracing::info!(sessions = sessions.len(), "Shutting down backend");
        for session in &sessions {
            if let Err(err) = session.send_message(MESSAGE_SYSTEM, "system", SHUTDOWN_MESSAGE) {
                tracing::debug!(session_id = %session.id(), error = %err, "Could not send shutdown message");
            }
        }
        self.cancel.cancel();
        for session in &sessions {
            self.close_session(session).await;
        }
    }
}

async fn write_packets(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            tracing::debug!(error = %err, "Game client write failed");
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        tracing::debug!(error = %err, "Game client shutdown failed");
    }
}

/// Read the ping byte, enforce the handshake, then dispatch until the client
/// leaves or a handler fails fatally.
async fn serve(session: &Arc<Session>, mut reader: OwnedReadHalf) -> Result<(), BackendError> {
    let cancel = session.cancel_token().clone();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut packets = PacketBuffer::new();
    let mut handshake = HANDSHAKE.iter();
    let mut pinged = false;

    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => return Err(BackendError::Cancelled),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        let mut data = &buf[..n];
        if !pinged {
            if data[0] != PING_BYTE {
                return Err(BackendError::ProtocolViolation(format!(
                    "expected ping byte, got {:#04x}",
                    data[0]
                )));
            }
            pinged = true;
            data = &data[1..];
        }

        let drained = packets.push(data);
        if drained.discarded > 0 {
            tracing::warn!(bytes = drained.discarded, "Discarded unframed bytes");
        }
        for bytes in drained.packets {
            let packet = match Packet::parse(&bytes) {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::warn!(error = %err, "Dropping bad frame");
                    continue;
                }
            };
            if let Some(expected) = handshake.next() {
                if packet.opcode() != expected.opcode() {
                    return Err(BackendError::ProtocolViolation(format!(
                        "expected {expected:?} during handshake, got opcode {:#04x}",
                        packet.opcode()
                    )));
                }
            }
            match handlers::dispatch(session, packet).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => tracing::warn!(opcode = packet.opcode(), error = %err, "Handler failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dispel_core::packet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        config::ProxyMode,
        console::memory::MemoryConsole,
    };

    async fn start() -> (Arc<SessionManager>, SocketAddr, tokio::task::JoinHandle<Result<(), BackendError>>) {
        let config = BackendConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            mode: ProxyMode::Lan,
            lan_ip: Ipv4Addr::LOCALHOST,
            ..BackendConfig::default()
        };
        let manager = SessionManager::new(Arc::new(MemoryConsole::new()), config);
        let listener = manager.start().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(manager.clone().listen(listener));
        (manager, addr, task)
    }

    async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    async fn wait_for_sessions(manager: &SessionManager, count: usize) {
        for _ in 0..200 {
            if manager.session_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} sessions, have {}", manager.session_count());
    }

    fn handshake_bytes(key: &[u8; 8]) -> Vec<u8> {
        let mut bytes = vec![PING_BYTE];
        bytes.extend(packet::encode(PacketType::ClientHostAndUsername.opcode(), b"pc\0jp\0").unwrap());
        let mut auth = key.to_vec();
        auth.extend_from_slice(&[3, 0, 0, 0]);
        bytes.extend(packet::encode(PacketType::AuthorizationHandshake.opcode(), &auth).unwrap());
        bytes
    }

    #[tokio::test]
    async fn test_handshake_over_tcp() {
        let (manager, addr, _task) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&handshake_bytes(b"68XIPSID")).await.unwrap();

        assert_eq!(read_exact(&mut client, 8).await, [0xFF, 0x1E, 0x08, 0x00, 1, 0, 0, 0]);
        assert_eq!(
            read_exact(&mut client, 9).await,
            [0xFF, 0x06, 0x09, 0x00, b'E', b'N', b'E', b'T', 0]
        );
        assert_eq!(manager.session_count(), 1);

        drop(client);
        wait_for_sessions(&manager, 0).await;
    }

    #[tokio::test]
    async fn test_bad_key_closes_session() {
        let (manager, addr, _task) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&handshake_bytes(b"00000000")).await.unwrap();

        read_exact(&mut client, 8).await;
        assert_eq!(read_exact(&mut client, 8).await, [255, 6, 8, 0, 0, 0, 0, 0]);
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        wait_for_sessions(&manager, 0).await;
    }

    #[tokio::test]
    async fn test_missing_ping_is_rejected() {
        let (manager, addr, _task) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&packet::encode(PacketType::ListChannels.opcode(), &[]).unwrap())
            .await
            .unwrap();
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        wait_for_sessions(&manager, 0).await;
    }

    #[tokio::test]
    async fn test_out_of_order_handshake_is_rejected() {
        let (manager, addr, _task) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut bytes = vec![PING_BYTE];
        bytes.extend(packet::encode(PacketType::AuthorizationHandshake.opcode(), b"68XIPSID\x03\0\0\0").unwrap());
        client.write_all(&bytes).await.unwrap();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        wait_for_sessions(&manager, 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_notifies_clients() {
        let (manager, addr, task) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&handshake_bytes(b"68XIPSID")).await.unwrap();
        read_exact(&mut client, 17).await;

        manager.shutdown().await;
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rest[1], PacketType::ReceiveMessage.opcode());
        assert!(rest.ends_with(b"server closing\0"));

        task.await.unwrap().unwrap();
        wait_for_sessions(&manager, 0).await;
    }
}
