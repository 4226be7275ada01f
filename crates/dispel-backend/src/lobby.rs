//! WebSocket client for the signaling server.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dispel_core::{
    EventType, MessageContent, User, WireError,
    wire::{self, parse_event_type},
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Serialize;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message, client::IntoClientRequest, http::HeaderValue},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::BackendError;

/// Room every backend joins on the signaling server.
pub const LOBBY_ROOM: &str = "DISPEL";
pub const SUBPROTOCOL: &str = "signalserver";
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(thiserror::Error, Debug)]
pub enum LobbyError {
    #[error("websocket: {0}")]
    Transport(Box<tungstenite::Error>),

    #[error("signaling server did not answer within 5s")]
    DialTimeout,

    #[error("lobby write did not complete within 3s")]
    WriteTimeout,

    #[error("signaling server rejected the handshake")]
    HandshakeRejected,

    #[error("lobby connection closed")]
    Closed,

    #[error("not connected to the lobby")]
    NotConnected,

    #[error("lobby is already being observed")]
    AlreadyObserved,

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl From<tungstenite::Error> for LobbyError {
    fn from(err: tungstenite::Error) -> Self {
        LobbyError::Transport(Box::new(err))
    }
}

/// Receives every lobby frame, in arrival order.
#[tonic::async_trait]
pub trait LobbyHandler: Send + Sync {
    async fn handle(&self, frame: &[u8]) -> Result<(), BackendError>;
}

/// Append the lobby query parameters to the signaling URL.
pub fn lobby_url(base: &str, user_id: i64) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}userID={user_id}&roomName={LOBBY_ROOM}")
}

pub struct LobbyClient {
    self_id: String,
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    stream: parking_lot::Mutex<Option<SplitStream<WsStream>>>,
    closed: CancellationToken,
}

impl LobbyClient {
    /// Dial the signaling server and complete the Hello/Welcome exchange.
    pub async fn connect(url: &str, user: &User) -> Result<Self, LobbyError> {
        let mut request = lobby_url(url, user.id).into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (ws, _) = tokio::time::timeout(DIAL_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| LobbyError::DialTimeout)??;
        let (mut sink, mut stream) = ws.split();

        let self_id = user.id.to_string();
        let hello = wire::compose(
            EventType::Hello,
            &MessageContent::new(user.clone()).with_from(self_id.clone()),
        )?;
        sink.send(Message::binary(hello)).await?;

        let welcome = tokio::time::timeout(DIAL_TIMEOUT, async {
            loop {
                match stream.next().await {
                    Some(Ok(msg @ (Message::Binary(_) | Message::Text(_)))) => {
                        return Ok(msg.into_data());
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(LobbyError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        })
        .await
        .map_err(|_| LobbyError::DialTimeout)??;

        if welcome.as_ref() != wire::bare(EventType::Welcome).as_slice() {
            tracing::warn!(frame_len = welcome.len(), "Unexpected welcome frame");
            return Err(LobbyError::HandshakeRejected);
        }

        tracing::info!(user_id = user.id, "Joined lobby websocket");
        Ok(Self {
            self_id,
            sink: tokio::sync::Mutex::new(sink),
            stream: parking_lot::Mutex::new(Some(stream)),
            closed: CancellationToken::new(),
        })
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub async fn send_raw(&self, frame: Vec<u8>) -> Result<(), LobbyError> {
        if self.closed.is_cancelled() {
            return Err(LobbyError::Closed);
        }
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::binary(frame)))
            .await
            .map_err(|_| LobbyError::WriteTimeout)??;
        Ok(())
    }

    pub async fn send_event<T: Serialize + Send>(
        &self,
        event: EventType,
        content: T,
    ) -> Result<(), LobbyError> {
        let message = MessageContent::new(content).with_from(self.self_id.clone());
        self.send_raw(wire::compose(event, &message)?).await
    }

    pub async fn send_event_to<T: Serialize + Send>(
        &self,
        event: EventType,
        content: T,
        to: &str,
    ) -> Result<(), LobbyError> {
        let message = MessageContent::new(content)
            .with_from(self.self_id.clone())
            .with_to(to);
        self.send_raw(wire::compose(event, &message)?).await
    }

    /// Start reading the socket.
    ///
    /// A reader task pushes frames into a channel and a dispatcher task hands
    /// each frame to `handlers` in order. The returned handle resolves when
    /// the socket ends or `cancel` fires. Handler errors are logged only.
    pub fn observe(
        &self,
        cancel: CancellationToken,
        handlers: Vec<Arc<dyn LobbyHandler>>,
        span: tracing::Span,
    ) -> Result<JoinHandle<Result<(), LobbyError>>, LobbyError> {
        let mut stream = self.stream.lock().take().ok_or(LobbyError::AlreadyObserved)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let closed = self.closed.clone();

        let reader = tokio::spawn(
            async move {
                loop {
                    let message = tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = closed.cancelled() => return Ok(()),
                        message = stream.next() => message,
                    };
                    match message {
                        Some(Ok(msg @ (Message::Binary(_) | Message::Text(_)))) => {
                            if tx.send(msg.into_data()).is_err() {
                                return Ok(());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Err(LobbyError::Closed),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
            }
            .instrument(span.clone()),
        );

        Ok(tokio::spawn(
            async move {
                while let Some(frame) = rx.recv().await {
                    for handler in &handlers {
                        if let Err(err) = handler.handle(&frame).await {
                            tracing::warn!(
                                event = parse_event_type(&frame),
                                error = %err,
                                "Lobby handler failed"
                            );
                        }
                    }
                }
                reader.await.unwrap_or(Err(LobbyError::Closed))
            }
            .instrument(span),
        ))
    }

    /// Send a close frame. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(WRITE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(error = %err, "Lobby close failed"),
            Err(_) => tracing::debug!("Lobby close timed out"),
        }
    }
}

#[cfg(test)]
pub mod hub {
    //! In-process signaling server for tests.
    //!
    //! Frames with a `to` field go to that user only, everything else is
    //! broadcast to every connected user including the sender. The hub
    //! stamps `from` with the sender's id.

    use std::{collections::HashMap, net::SocketAddr};

    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{
        accept_hdr_async,
        tungstenite::handshake::server::{ErrorResponse, Request, Response},
    };

    use super::*;

    #[derive(Default)]
    struct HubState {
        clients: HashMap<String, mpsc::UnboundedSender<Message>>,
        frames: Vec<(String, Vec<u8>)>,
    }

    pub struct FakeHub {
        addr: SocketAddr,
        state: Arc<Mutex<HubState>>,
        cancel: CancellationToken,
    }

    impl FakeHub {
        pub async fn start() -> Self {
            Self::start_with_welcome(wire::bare(EventType::Welcome)).await
        }

        /// A hub that answers Hello with `welcome` instead of the real frame.
        pub async fn start_with_welcome(welcome: Vec<u8>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let state = Arc::new(Mutex::new(HubState::default()));
            let cancel = CancellationToken::new();

            let accept_state = state.clone();
            let accept_cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let stream = tokio::select! {
                        () = accept_cancel.cancelled() => return,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(_) => return,
                        },
                    };
                    tokio::spawn(serve(
                        stream,
                        accept_state.clone(),
                        welcome.clone(),
                        accept_cancel.child_token(),
                    ));
                }
            });

            Self { addr, state, cancel }
        }

        pub fn url(&self) -> String {
            format!("ws://{}/lobby/ws", self.addr)
        }

        pub fn frames(&self) -> Vec<(String, Vec<u8>)> {
            self.state.lock().frames.clone()
        }

        /// Frames received from `user` with the given tag.
        pub fn frames_from(&self, user: &str, event: EventType) -> Vec<Vec<u8>> {
            self.state
                .lock()
                .frames
                .iter()
                .filter(|(from, frame)| from == user && parse_event_type(frame) == event.tag())
                .map(|(_, frame)| frame.clone())
                .collect()
        }

        pub fn is_connected(&self, user: &str) -> bool {
            self.state.lock().clients.contains_key(user)
        }

        /// Push a raw frame to one user.
        pub fn push(&self, user: &str, frame: Vec<u8>) {
            if let Some(tx) = self.state.lock().clients.get(user) {
                let _ = tx.send(Message::binary(frame));
            }
        }

        /// Drop every connection by closing it from the server side.
        pub fn kick_all(&self) {
            for tx in self.state.lock().clients.values() {
                let _ = tx.send(Message::Close(None));
            }
        }

        pub async fn wait_until(&self, what: &str, check: impl Fn(&FakeHub) -> bool) {
            for _ in 0..200 {
                if check(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("hub condition never became true: {what}");
        }
    }

    impl Drop for FakeHub {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn stamp(user: &str, frame: &[u8]) -> (Vec<u8>, String) {
        let Some((&tag, body)) = frame.split_first() else {
            return (frame.to_vec(), String::new());
        };
        let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body) else {
            return (frame.to_vec(), String::new());
        };
        let to = value
            .get("to")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        value["from"] = serde_json::Value::String(user.to_string());
        let mut out = vec![tag];
        out.extend(serde_json::to_vec(&value).unwrap());
        (out, to)
    }

    async fn serve(
        stream: TcpStream,
        state: Arc<Mutex<HubState>>,
        welcome: Vec<u8>,
        cancel: CancellationToken,
    ) {
        let mut user = String::new();
        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            user = request
                .uri()
                .query()
                .unwrap_or_default()
                .split('&')
                .find_map(|pair| pair.strip_prefix("userID="))
                .unwrap_or_default()
                .to_string();
            if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol").cloned() {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", protocol);
            }
            Ok(response)
        };
        let Ok(ws) = accept_hdr_async(stream, callback).await else {
            return;
        };
        let (mut sink, mut source) = ws.split();

        match source.next().await {
            Some(Ok(Message::Binary(hello))) if parse_event_type(&hello) == EventType::Hello.tag() => {}
            _ => return,
        }
        if sink.send(Message::binary(welcome)).await.is_err() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        state.lock().clients.insert(user.clone(), tx);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                message = source.next() => message,
            };
            let Some(Ok(message)) = message else { break };
            let frame = match message {
                Message::Binary(frame) => frame.to_vec(),
                Message::Close(_) => break,
                _ => continue,
            };
            let (stamped, to) = stamp(&user, &frame);
            let mut guard = state.lock();
            guard.frames.push((user.clone(), frame));
            if to.is_empty() {
                for tx in guard.clients.values() {
                    let _ = tx.send(Message::binary(stamped.clone()));
                }
            } else if let Some(tx) = guard.clients.get(&to) {
                let _ = tx.send(Message::binary(stamped));
            }
        }

        state.lock().clients.remove(&user);
        writer.abort();
    }
}
