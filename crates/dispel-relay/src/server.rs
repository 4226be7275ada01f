use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

use crate::protocol::{Proto, RelayCodec, RelayError, RelayFrame};

/// Frames queued per member before the relay starts dropping for it.
const MEMBER_QUEUE: usize = 1024;

struct Member {
    tx: mpsc::Sender<RelayFrame>,
    joined_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct RelayRoom {
    host: Option<i64>,
    members: HashMap<i64, Member>,
}

impl RelayRoom {
    /// Earliest-joined remaining member.
    fn elect_host(&self) -> Option<i64> {
        self.members
            .iter()
            .min_by_key(|(_, m)| (m.joined_at, m.seq))
            .map(|(id, _)| *id)
    }

    fn broadcast(&self, frame: &RelayFrame) {
        for (id, member) in &self.members {
            if member.tx.try_send(frame.clone()).is_err() {
                tracing::warn!(user_id = id, "Relay queue full, dropping frame");
            }
        }
    }
}

/// Groups connections by room name and forwards `Data` frames between them.
#[derive(Default)]
pub struct RelayServer {
    rooms: RwLock<HashMap<String, RelayRoom>>,
    seq: parking_lot::Mutex<u64>,
}

impl RelayServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        tracing::info!(addr = ?listener.local_addr()?, "Relay listening");
        loop {
            let (stream, peer) = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let server = self.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream, peer, cancel).await {
                    tracing::warn!(%peer, error = %err, "Relay connection failed");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, RelayCodec::new());

        let (room, user_id, host) = match framed.next().await {
            Some(Ok(RelayFrame::Join {
                room,
                user_id,
                host,
            })) => (room, user_id, host),
            Some(Ok(_)) => return Err(RelayError::NotJoined),
            Some(Err(err)) => return Err(err),
            None => return Ok(()),
        };

        let (tx, mut rx) = mpsc::channel(MEMBER_QUEUE);
        let is_host = self.join(&room, user_id, host, tx);
        tracing::info!(%peer, %room, user_id, host = is_host, "Relay member joined");

        let (mut sink, mut stream) = framed.split();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                sink.send(frame).await?;
            }
            Ok::<_, RelayError>(())
        });

        let result = loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(RelayFrame::Data {
                    to, proto, payload, ..
                })) => self.forward(&room, user_id, to, proto, payload),
                Some(Ok(RelayFrame::Leave { .. })) | None => break Ok(()),
                Some(Ok(other)) => {
                    tracing::debug!(%room, user_id, frame = ?other, "Ignoring client frame");
                }
                Some(Err(err)) => break Err(err),
            }
        };

        self.leave(&room, user_id);
        writer.abort();
        tracing::info!(%room, user_id, "Relay member left");
        result
    }

    /// Register a member and announce it. Returns whether it hosts the room.
    fn join(&self, room: &str, user_id: i64, host: bool, tx: mpsc::Sender<RelayFrame>) -> bool {
        let seq = {
            let mut seq = self.seq.lock();
            *seq += 1;
            *seq
        };

        let mut rooms = self.rooms.write();
        let entry = rooms.entry(room.to_string()).or_default();
        if entry.members.remove(&user_id).is_some() && entry.host == Some(user_id) {
            entry.host = None;
        }

        let is_host = entry.host.is_none() && (host || entry.members.is_empty());
        if is_host {
            entry.host = Some(user_id);
        }

        for &id in entry.members.keys() {
            let existing = RelayFrame::Joined {
                user_id: id,
                host: entry.host == Some(id),
            };
            if tx.try_send(existing).is_err() {
                tracing::warn!(user_id, "Relay queue full during join");
            }
        }
        entry.broadcast(&RelayFrame::Joined {
            user_id,
            host: is_host,
        });
        entry.members.insert(
            user_id,
            Member {
                tx,
                joined_at: Utc::now(),
                seq,
            },
        );
        is_host
    }

    fn forward(
        &self,
        room: &str,
        from: i64,
        to: i64,
        proto: Proto,
        payload: Vec<u8>,
    ) {
        let rooms = self.rooms.read();
        let Some(target) = rooms.get(room).and_then(|r| r.members.get(&to)) else {
            tracing::debug!(%room, from, to, "Dropping frame for unknown member");
            return;
        };
        let frame = RelayFrame::Data {
            from,
            to,
            proto,
            payload,
        };
        if target.tx.try_send(frame).is_err() {
            tracing::warn!(%room, from, to, "Relay queue full, dropping frame");
        }
    }

    fn leave(&self, room: &str, user_id: i64) {
        let mut rooms = self.rooms.write();
        let Some(entry) = rooms.get_mut(room) else {
            return;
        };
        if entry.members.remove(&user_id).is_none() {
            return;
        }

        entry.broadcast(&RelayFrame::Leave { user_id });

        if entry.host == Some(user_id) {
            entry.host = entry.elect_host();
            if let Some(new_host) = entry.host {
                tracing::info!(%room, new_host, "Relay host migrated");
                entry.broadcast(&RelayFrame::HostMigration {
                    room: room.to_string(),
                    new_host,
                });
            }
        }

        if entry.members.is_empty() {
            rooms.remove(room);
        }
    }

    pub fn host_of(&self, room: &str) -> Option<i64> {
        self.rooms.read().get(room).and_then(|r| r.host)
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.read().get(room).map_or(0, |r| r.members.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{RelayStream, connect};

    async fn start() -> (Arc<RelayServer>, SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(RelayServer::new());
        let cancel = CancellationToken::new();
        tokio::spawn(server.clone().serve(listener, cancel.clone()));
        (server, addr, cancel)
    }

    async fn join(server: &RelayServer, addr: SocketAddr, user_id: i64, host: bool) -> RelayStream {
        let before = server.member_count("retreat");
        let mut stream = connect(addr).await.unwrap();
        stream
            .send(RelayFrame::Join {
                room: "retreat".to_string(),
                user_id,
                host,
            })
            .await
            .unwrap();
        while server.member_count("retreat") == before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stream
    }

    async fn next(stream: &mut RelayStream) -> RelayFrame {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwards_data_between_members() {
        let (server, addr, cancel) = start().await;
        let mut host = join(&server, addr, 1, true).await;
        let mut guest = join(&server, addr, 2, false).await;

        assert_eq!(
            next(&mut guest).await,
            RelayFrame::Joined {
                user_id: 1,
                host: true
            }
        );
        assert_eq!(
            next(&mut host).await,
            RelayFrame::Joined {
                user_id: 2,
                host: false
            }
        );

        guest
            .send(RelayFrame::Data {
                from: 99,
                to: 1,
                proto: Proto::Tcp,
                payload: b"hello".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(
            next(&mut host).await,
            RelayFrame::Data {
                from: 2,
                to: 1,
                proto: Proto::Tcp,
                payload: b"hello".to_vec(),
            }
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_host_disconnect_elects_earliest_member() {
        let (server, addr, cancel) = start().await;
        let host = join(&server, addr, 1, true).await;
        let mut second = join(&server, addr, 2, false).await;
        next(&mut second).await;
        let mut third = join(&server, addr, 3, false).await;
        next(&mut third).await;
        next(&mut third).await;
        next(&mut second).await;

        drop(host);

        assert_eq!(next(&mut second).await, RelayFrame::Leave { user_id: 1 });
        assert_eq!(
            next(&mut second).await,
            RelayFrame::HostMigration {
                room: "retreat".to_string(),
                new_host: 2
            }
        );
        assert_eq!(next(&mut third).await, RelayFrame::Leave { user_id: 1 });
        assert_eq!(
            next(&mut third).await,
            RelayFrame::HostMigration {
                room: "retreat".to_string(),
                new_host: 2
            }
        );
        assert_eq!(server.host_of("retreat"), Some(2));
        assert_eq!(server.member_count("retreat"), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_first_frame_must_be_join() {
        let (server, addr, cancel) = start().await;
        let mut stream = connect(addr).await.unwrap();
        stream
            .send(RelayFrame::Leave { user_id: 1 })
            .await
            .unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap();
        assert!(closed.is_none() || matches!(closed, Some(Err(_))));
        assert_eq!(server.member_count("retreat"), 0);
        cancel.cancel();
    }
}
