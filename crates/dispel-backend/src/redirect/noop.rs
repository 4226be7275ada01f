use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{PacketSink, Redirect, RedirectError};

/// Stands in for a transport the peer role does not use. Writes are dropped.
#[derive(Default)]
pub struct Noop {
    closed: CancellationToken,
}

impl Noop {
    pub fn new() -> Self {
        Self::default()
    }
}

#[tonic::async_trait]
impl Redirect for Noop {
    async fn run(
        &self,
        cancel: CancellationToken,
        _sink: Arc<dyn PacketSink>,
    ) -> Result<(), RedirectError> {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = self.closed.cancelled() => {}
        }
        Ok(())
    }

    fn write(&self, _payload: Bytes) -> Result<(), RedirectError> {
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
