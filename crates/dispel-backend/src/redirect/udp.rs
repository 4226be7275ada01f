use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

use super::{PacketSink, READ_BUFFER, Redirect, RedirectError, first_of};

/// ICMP port-unreachable shows up as a refused read or write on a UDP
/// socket. The game may simply not be listening yet.
fn transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
    )
}

type SharedPeer = Arc<Mutex<Option<SocketAddr>>>;

/// Deliver datagrams to `sink`. A listener records the first source in `peer`.
async fn receive(
    socket: Arc<UdpSocket>,
    peer: Option<SharedPeer>,
    sink: Arc<dyn PacketSink>,
) -> Result<(), RedirectError> {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let (n, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) if transient(&err) => continue,
            Err(err) => return Err(err.into()),
        };
        if let Some(peer) = &peer {
            peer.lock().get_or_insert(source);
        }
        sink.deliver(Bytes::copy_from_slice(&buf[..n])).await?;
    }
}

/// Drain `outbox` into the socket. Without a `peer` the socket is connected.
async fn send(
    socket: Arc<UdpSocket>,
    peer: Option<SharedPeer>,
    mut outbox: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), RedirectError> {
    while let Some(payload) = outbox.recv().await {
        let sent = match &peer {
            Some(peer) => {
                let Some(destination) = *peer.lock() else {
                    tracing::trace!("Dropping datagram, game has not sent anything yet");
                    continue;
                };
                socket.send_to(&payload, destination).await
            }
            None => socket.send(&payload).await,
        };
        if let Err(err) = sent {
            if !transient(&err) {
                return Err(err.into());
            }
        }
    }
    Ok(())
}

struct Outbox {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl Outbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    fn send(&self, payload: Bytes) -> Result<(), RedirectError> {
        self.tx
            .lock()
            .as_ref()
            .ok_or(RedirectError::Closed)?
            .send(payload)
            .map_err(|_| RedirectError::Closed)
    }

    fn take(&self) -> Result<mpsc::UnboundedReceiver<Bytes>, RedirectError> {
        self.rx.lock().take().ok_or(RedirectError::Closed)
    }

    fn close(&self) {
        self.tx.lock().take();
        self.rx.lock().take();
    }
}

/// Receives datagrams on a fake host address.
///
/// The source of the first datagram becomes the destination of every write.
pub struct ListenerUdp {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    peer: SharedPeer,
    outbox: Outbox,
    closed: CancellationToken,
}

impl ListenerUdp {
    pub async fn bind(addr: SocketAddrV4) -> Result<Self, RedirectError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            addr: socket.local_addr()?,
            socket: Arc::new(socket),
            peer: Arc::new(Mutex::new(None)),
            outbox: Outbox::new(),
            closed: CancellationToken::new(),
        })
    }
}

#[tonic::async_trait]
impl Redirect for ListenerUdp {
    async fn run(
        &self,
        cancel: CancellationToken,
        sink: Arc<dyn PacketSink>,
    ) -> Result<(), RedirectError> {
        let outbox = self.outbox.take()?;
        let mut tasks = JoinSet::new();

        tasks.spawn(receive(self.socket.clone(), Some(self.peer.clone()), sink));
        tasks.spawn(send(self.socket.clone(), Some(self.peer.clone()), outbox));

        first_of(&cancel, &self.closed, tasks).await
    }

    fn write(&self, payload: Bytes) -> Result<(), RedirectError> {
        self.outbox.send(payload)
    }

    fn close(&self) {
        self.closed.cancel();
        self.outbox.close();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

/// Sends datagrams to the game client's own UDP port.
pub struct DialerUdp {
    addr: SocketAddrV4,
    outbox: Outbox,
    closed: CancellationToken,
}

impl DialerUdp {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            outbox: Outbox::new(),
            closed: CancellationToken::new(),
        }
    }
}

#[tonic::async_trait]
impl Redirect for DialerUdp {
    async fn run(
        &self,
        cancel: CancellationToken,
        sink: Arc<dyn PacketSink>,
    ) -> Result<(), RedirectError> {
        let outbox = self.outbox.take()?;
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).await?;
        socket.connect(self.addr).await?;
        let socket = Arc::new(socket);
        let mut tasks = JoinSet::new();
        tasks.spawn(receive(socket.clone(), None, sink));
        tasks.spawn(send(socket, None, outbox));

        first_of(&cancel, &self.closed, tasks).await
    }

    fn write(&self, payload: Bytes) -> Result<(), RedirectError> {
        self.outbox.send(payload)
    }

    fn close(&self) {
        self.closed.cancel();
        self.outbox.close();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::redirect::testing::{ChannelSink, recv};

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[tokio::test]
    async fn test_listener_replies_to_first_source() {
        let redirect = Arc::new(ListenerUdp::bind(loopback(0)).await.unwrap());
        let addr = redirect.local_addr().unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let redirect = redirect.clone();
            let cancel = cancel.clone();
            async move { redirect.run(cancel, sink).await }
        });

        let first = UdpSocket::bind(loopback(0)).await.unwrap();
        let second = UdpSocket::bind(loopback(0)).await.unwrap();
        first.send_to(b"one", addr).await.unwrap();
        assert_eq!(&recv(&mut rx).await[..], b"one");
        second.send_to(b"two", addr).await.unwrap();
        assert_eq!(&recv(&mut rx).await[..], b"two");

        redirect.write(Bytes::from_static(b"back")).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), first.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"back");
        assert_eq!(from, addr);

        cancel.cancel();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dialer_exchanges_datagrams() {
        let game = UdpSocket::bind(loopback(0)).await.unwrap();
        let SocketAddr::V4(addr) = game.local_addr().unwrap() else {
            unreachable!()
        };

        let redirect = Arc::new(DialerUdp::new(addr));
        redirect.write(Bytes::from_static(b"hello")).unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let run = tokio::spawn({
            let redirect = redirect.clone();
            async move { redirect.run(CancellationToken::new(), sink).await }
        });

        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), game.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");

        game.send_to(b"world", from).await.unwrap();
        assert_eq!(&recv(&mut rx).await[..], b"world");

        redirect.close();
        redirect.close();
        assert!(run.await.unwrap().is_ok());
        assert!(matches!(
            redirect.write(Bytes::from_static(b"late")),
            Err(RedirectError::Closed)
        ));
    }
}
