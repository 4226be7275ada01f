use std::{
    net::{SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use super::{PacketSink, Redirect, RedirectError, first_of, pump_tcp};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Accepts game connections on a fake host address.
///
/// Writes go to the most recently accepted connection. `run` returns once
/// every accepted connection has ended.
pub struct ListenerTcp {
    addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    current: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closed: CancellationToken,
}

impl ListenerTcp {
    pub async fn bind(addr: SocketAddrV4) -> Result<Self, RedirectError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            addr: listener.local_addr()?,
            listener: Mutex::new(Some(listener)),
            current: Mutex::new(None),
            closed: CancellationToken::new(),
        })
    }
}

#[tonic::async_trait]
impl Redirect for ListenerTcp {
    async fn run(
        &self,
        cancel: CancellationToken,
        sink: Arc<dyn PacketSink>,
    ) -> Result<(), RedirectError> {
        let listener = self.listener.lock().take().ok_or(RedirectError::Closed)?;
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = self.closed.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!(local = %self.addr, %peer, "Game connected to fake host");
                    let (tx, rx) = mpsc::unbounded_channel();
                    *self.current.lock() = Some(tx);
                    connections.spawn(pump_tcp(stream, rx, sink.clone()));
                }
                Some(joined) = connections.join_next() => {
                    {
                        let mut current = self.current.lock();
                        if current.as_ref().is_some_and(mpsc::UnboundedSender::is_closed) {
                            current.take();
                        }
                    }
                    joined.unwrap_or(Err(RedirectError::Closed))?;
                    if connections.is_empty() {
                        tracing::debug!(local = %self.addr, "Game left fake host");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn write(&self, payload: Bytes) -> Result<(), RedirectError> {
        self.current
            .lock()
            .as_ref()
            .ok_or(RedirectError::NotConnected)?
            .send(payload)
            .map_err(|_| RedirectError::Closed)
    }

    fn close(&self) {
        self.closed.cancel();
        self.current.lock().take();
        self.listener.lock().take();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

/// Connects to the game client's own listener.
///
/// Writes issued before the connection is up are queued.
pub struct DialerTcp {
    addr: SocketAddrV4,
    outbox: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    closed: CancellationToken,
}

impl DialerTcp {
    pub fn new(addr: SocketAddrV4) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            addr,
            outbox: Mutex::new(Some(tx)),
            pending: Mutex::new(Some(rx)),
            closed: CancellationToken::new(),
        }
    }
}

#[tonic::async_trait]
impl Redirect for DialerTcp {
    async fn run(
        &self,
        cancel: CancellationToken,
        sink: Arc<dyn PacketSink>,
    ) -> Result<(), RedirectError> {
        let outbox = self.pending.lock().take().ok_or(RedirectError::Closed)?;
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| RedirectError::DialTimeout(self.addr))??;
        tracing::debug!(remote = %self.addr, "Dialed game client");

        let mut tasks = JoinSet::new();
        tasks.spawn(pump_tcp(stream, outbox, sink));
        first_of(&cancel, &self.closed, tasks).await
    }

    fn write(&self, payload: Bytes) -> Result<(), RedirectError> {
        self.outbox
            .lock()
            .as_ref()
            .ok_or(RedirectError::Closed)?
            .send(payload)
            .map_err(|_| RedirectError::Closed)
    }

    fn close(&self) {
        self.closed.cancel();
        self.outbox.lock().take();
        self.pending.lock().take();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
