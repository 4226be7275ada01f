//! Local sockets that stand in for a remote peer.
//!
//! A redirect owns one TCP or UDP endpoint on the game client's side and
//! moves bytes between it and a [`PacketSink`] (a data channel, a relay
//! stream). Writes never block: they are queued on a channel drained by a
//! writer task.

mod noop;
mod tcp;
mod udp;

use std::{
    net::{SocketAddr, SocketAddrV4},
    sync::Arc,
};

use bytes::Bytes;
use dispel_core::RedirectKind;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

pub use noop::Noop;
pub use tcp::{DialerTcp, ListenerTcp};
pub use udp::{DialerUdp, ListenerUdp};

const READ_BUFFER: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum RedirectError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out dialing {0}")]
    DialTimeout(SocketAddrV4),

    #[error("redirect closed")]
    Closed,

    #[error("no game connection to write to")]
    NotConnected,

    #[error("sink rejected payload: {0}")]
    Sink(String),
}

/// Destination for everything a redirect reads from its socket.
#[tonic::async_trait]
pub trait PacketSink: Send + Sync {
    async fn deliver(&self, payload: Bytes) -> Result<(), RedirectError>;
}

#[tonic::async_trait]
pub trait Redirect: Send + Sync {
    /// Pump the socket into `sink` until cancelled, closed, or the remote
    /// side hangs up. The first error of any sub-task ends the run.
    async fn run(
        &self,
        cancel: CancellationToken,
        sink: Arc<dyn PacketSink>,
    ) -> Result<(), RedirectError>;

    /// Queue `payload` for the socket.
    fn write(&self, payload: Bytes) -> Result<(), RedirectError>;

    fn close(&self);

    /// Bound address for listeners.
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub async fn build_tcp(kind: RedirectKind) -> Result<Arc<dyn Redirect>, RedirectError> {
    Ok(match kind {
        RedirectKind::Listen(addr) => Arc::new(ListenerTcp::bind(addr).await?),
        RedirectKind::Dial(addr) => Arc::new(DialerTcp::new(addr)),
        RedirectKind::Noop => Arc::new(Noop::new()),
    })
}

pub async fn build_udp(kind: RedirectKind) -> Result<Arc<dyn Redirect>, RedirectError> {
    Ok(match kind {
        RedirectKind::Listen(addr) => Arc::new(ListenerUdp::bind(addr).await?),
        RedirectKind::Dial(addr) => Arc::new(DialerUdp::new(addr)),
        RedirectKind::Noop => Arc::new(Noop::new()),
    })
}

async fn copy_to_sink<R: AsyncRead + Unpin>(
    mut read: R,
    sink: &dyn PacketSink,
) -> Result<(), RedirectError> {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.deliver(Bytes::copy_from_slice(&buf[..n])).await?;
    }
}

async fn drain_to<W: AsyncWrite + Unpin>(
    mut outbox: mpsc::UnboundedReceiver<Bytes>,
    mut write: W,
) -> Result<(), RedirectError> {
    while let Some(payload) = outbox.recv().await {
        write.write_all(&payload).await?;
    }
    Ok(())
}

/// Move bytes both ways over one TCP connection until either side stops.
async fn pump_tcp(
    stream: TcpStream,
    outbox: mpsc::UnboundedReceiver<Bytes>,
    sink: Arc<dyn PacketSink>,
) -> Result<(), RedirectError> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    tokio::select! {
        result = copy_to_sink(read, sink.as_ref()) => result,
        result = drain_to(outbox, write) => result,
    }
}

/// Wait for the first task of `tasks` to finish, or for cancellation.
/// Dropping the set aborts the remaining tasks.
async fn first_of(
    cancel: &CancellationToken,
    closed: &CancellationToken,
    mut tasks: JoinSet<Result<(), RedirectError>>,
) -> Result<(), RedirectError> {
    tokio::select! {
        () = cancel.cancelled() => Ok(()),
        () = closed.cancelled() => Ok(()),
        Some(joined) = tasks.join_next() => joined.unwrap_or(Err(RedirectError::Closed)),
    }
}


#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[tokio::test]
    async fn test_build_follows_kind() {
        let listen = RedirectKind::Listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let tcp = build_tcp(listen).await.unwrap();
        assert!(tcp.local_addr().is_some());
        let udp = build_udp(listen).await.unwrap();
        assert!(udp.local_addr().is_some());

        let dial = RedirectKind::Dial(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        assert!(build_tcp(dial).await.unwrap().local_addr().is_none());
        assert!(build_udp(RedirectKind::Noop).await.unwrap().local_addr().is_none());
    }
}
