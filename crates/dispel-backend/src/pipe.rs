//! Bridge between one WebRTC data channel and one redirect.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use webrtc::data_channel::{
    RTCDataChannel, data_channel_message::DataChannelMessage,
    data_channel_state::RTCDataChannelState,
};

use crate::redirect::{PacketSink, Redirect, RedirectError};

type FailureHook = Box<dyn FnOnce(RedirectError) + Send>;

/// Sends everything read from the game over the data channel.
struct DataChannelSink {
    dc: Weak<RTCDataChannel>,
}

#[tonic::async_trait]
impl PacketSink for DataChannelSink {
    async fn deliver(&self, payload: Bytes) -> Result<(), RedirectError> {
        let dc = self.dc.upgrade().ok_or(RedirectError::Closed)?;
        dc.send(&payload)
            .await
            .map(|_| ())
            .map_err(|err| RedirectError::Sink(err.to_string()))
    }
}

pub struct Pipe {
    label: String,
    redirect: Arc<dyn Redirect>,
    cancel: CancellationToken,
    started: AtomicBool,
    on_failure: Mutex<Option<FailureHook>>,
}

impl Pipe {
    /// Wire `dc` to `redirect`. The redirect starts running once the channel
    /// is open and stops when the channel closes or `parent` is cancelled.
    /// `on_failure` runs if the redirect ends with an error.
    pub fn start(
        dc: &Arc<RTCDataChannel>,
        redirect: Arc<dyn Redirect>,
        parent: &CancellationToken,
        on_failure: impl FnOnce(RedirectError) + Send + 'static,
    ) -> Arc<Self> {
        let pipe = Arc::new(Self {
            label: dc.label().to_string(),
            redirect,
            cancel: parent.child_token(),
            started: AtomicBool::new(false),
            on_failure: Mutex::new(Some(Box::new(on_failure))),
        });
        let span = tracing::Span::current();

        let weak_pipe = Arc::downgrade(&pipe);
        let weak_dc = Arc::downgrade(dc);
        let open_span = span.clone();
        dc.on_open(Box::new(move || {
            if let Some(pipe) = weak_pipe.upgrade() {
                pipe.run(weak_dc.clone(), open_span.clone());
            }
            Box::pin(async {})
        }));

        let weak_pipe = Arc::downgrade(&pipe);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if let Some(pipe) = weak_pipe.upgrade() {
                match pipe.redirect.write(msg.data) {
                    Ok(()) | Err(RedirectError::NotConnected) => {}
                    Err(err) => tracing::debug!(label = %pipe.label, error = %err, "Dropped payload"),
                }
            }
            Box::pin(async {})
        }));

        let weak_pipe = Arc::downgrade(&pipe);
        dc.on_close(Box::new(move || {
            if let Some(pipe) = weak_pipe.upgrade() {
                tracing::debug!(label = %pipe.label, "Data channel closed");
                pipe.close();
            }
            Box::pin(async {})
        }));

        if dc.ready_state() == RTCDataChannelState::Open {
            pipe.run(Arc::downgrade(dc), span);
        }
        pipe
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn run(self: &Arc<Self>, dc: Weak<RTCDataChannel>, span: tracing::Span) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let pipe = self.clone();
        tokio::spawn(
            async move {
                let sink = Arc::new(DataChannelSink { dc });
                let result = pipe.redirect.run(pipe.cancel.clone(), sink).await;
                pipe.close();
                if let Err(err) = result {
                    tracing::warn!(label = %pipe.label, error = %err, "Pipe redirect failed");
                    if let Some(hook) = pipe.on_failure.lock().take() {
                        hook(err);
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Stop the redirect. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
        self.redirect.close();
    }
}
