//! One WebRTC connection to a remote player.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dispel_core::{PeerAddr, PeerMode, Player, RedirectKind, wire};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use webrtc::{
    api::API,
    data_channel::{RTCDataChannel, data_channel_init::RTCDataChannelInit},
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
};

use crate::{pipe::Pipe, proxy::ProxyError, redirect};

/// Signaling message for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(wire::SessionDescription),
    Answer(wire::SessionDescription),
    Candidate(wire::IceCandidate),
}

/// Delivers signaling messages to a remote peer.
#[tonic::async_trait]
pub trait Signaler: Send + Sync {
    async fn signal(&self, to: &str, signal: Signal) -> Result<(), ProxyError>;
}

pub fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    urls.iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect()
}

/// Label of the data channel carrying `proto` for `game_id`.
pub fn channel_label(game_id: &str, proto: &str) -> String {
    format!("{game_id}/{proto}")
}

fn to_wire(description: &RTCSessionDescription) -> wire::SessionDescription {
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    let kind = match description.sdp_type {
        RTCSdpType::Answer => wire::SdpType::Answer,
        RTCSdpType::Pranswer => wire::SdpType::Pranswer,
        RTCSdpType::Rollback => wire::SdpType::Rollback,
        _ => wire::SdpType::Offer,
    };
    wire::SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    }
}

fn from_wire_candidate(candidate: wire::IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

pub struct PeerOptions {
    pub game_id: String,
    pub mode: PeerMode,
    pub addr: PeerAddr,
    pub game_tcp_port: u16,
    pub game_udp_port: u16,
    pub ice_servers: Vec<String>,
}

pub struct Peer {
    player: Player,
    game_id: String,
    addr: PeerAddr,
    mode: Mutex<PeerMode>,
    game_tcp_port: u16,
    game_udp_port: u16,
    pc: Arc<RTCPeerConnection>,
    signaler: Arc<dyn Signaler>,
    offered: AtomicBool,
    /// Candidates received before the remote description. `None` once it is set.
    pending: Mutex<Option<Vec<RTCIceCandidateInit>>>,
    pipes: Mutex<Vec<Arc<Pipe>>>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl Peer {
    pub async fn create(
        api: &API,
        player: Player,
        options: PeerOptions,
        signaler: Arc<dyn Signaler>,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, ProxyError> {
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: ice_servers(&options.ice_servers),
                ..Default::default()
            })
            .await?;

        let peer = Arc::new(Self {
            player,
            game_id: options.game_id,
            addr: options.addr,
            mode: Mutex::new(options.mode),
            game_tcp_port: options.game_tcp_port,
            game_udp_port: options.game_udp_port,
            pc: Arc::new(pc),
            signaler,
            offered: AtomicBool::new(false),
            pending: Mutex::new(Some(Vec::new())),
            pipes: Mutex::new(Vec::new()),
            connected: watch::channel(false).0,
            cancel: parent.child_token(),
        });
        peer.register_callbacks();

        tracing::info!(
            peer_id = peer.player.user_id,
            ip = %peer.addr.ip,
            mode = ?options.mode,
            "Peer created"
        );
        Ok(peer)
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn id(&self) -> String {
        self.player.id()
    }

    pub fn addr(&self) -> PeerAddr {
        self.addr
    }

    pub fn mode(&self) -> PeerMode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: PeerMode) {
        *self.mode.lock() = mode;
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the connection is established. Returns `false` on timeout
    /// or termination.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.subscribe();
        tokio::select! {
            () = self.cancel.cancelled() => false,
            result = tokio::time::timeout(timeout, connected.wait_for(|c| *c)) => {
                matches!(result, Ok(Ok(_)))
            }
        }
    }

    fn register_callbacks(self: &Arc<Self>) {
        let span = tracing::Span::current();

        let weak = Arc::downgrade(self);
        let ice_span = span.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                Box::pin(
                    async move {
                        let (Some(peer), Some(candidate)) = (weak.upgrade(), candidate) else {
                            return;
                        };
                        let init = match candidate.to_json() {
                            Ok(init) => init,
                            Err(err) => {
                                tracing::debug!(error = %err, "Could not serialize candidate");
                                return;
                            }
                        };
                        let signal = Signal::Candidate(wire::IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        });
                        if let Err(err) = peer.signaler.signal(&peer.id(), signal).await {
                            tracing::debug!(peer_id = peer.player.user_id, error = %err, "Candidate not sent");
                        }
                    }
                    .instrument(ice_span.clone()),
                )
            }));

        let weak = Arc::downgrade(self);
        let state_span = span.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                if let Some(peer) = weak.upgrade() {
                    state_span.in_scope(|| {
                        tracing::debug!(peer_id = peer.player.user_id, %state, "Peer connection state");
                    });
                    match state {
                        RTCPeerConnectionState::Connected => {
                            peer.connected.send_replace(true);
                        }
                        RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed => {
                            peer.connected.send_replace(false);
                            Peer::spawn_terminate(&weak, state_span.clone());
                        }
                        _ => {}
                    }
                }
                Box::pin(async {})
            }));

        let weak = Arc::downgrade(self);
        let channel_span = span;
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                Box::pin(
                    async move {
                        if let Some(peer) = weak.upgrade() {
                            if let Err(err) = peer.attach(&dc).await {
                                tracing::warn!(label = %dc.label(), error = %err, "Could not attach data channel");
                            }
                        }
                    }
                    .instrument(channel_span.clone()),
                )
            }));
    }

    /// Terminate from inside a connection callback without blocking it.
    fn spawn_terminate(weak: &Weak<Peer>, span: tracing::Span) {
        if let Some(peer) = weak.upgrade() {
            if peer.is_terminated() {
                return;
            }
            tokio::spawn(async move { peer.terminate().await }.instrument(span));
        }
    }

    /// Pipe `dc` into the redirect matching its label and our role.
    async fn attach(self: &Arc<Self>, dc: &Arc<RTCDataChannel>) -> Result<(), ProxyError> {
        let mode = self.mode();
        let kind = if dc.label() == channel_label(&self.game_id, "tcp") {
            mode.tcp(self.addr, self.game_tcp_port)
        } else if dc.label() == channel_label(&self.game_id, "udp") {
            mode.udp(self.addr, self.game_udp_port)
        } else {
            return Err(ProxyError::NotFound(format!("channel {}", dc.label())));
        };

        let redirect = if dc.label().ends_with("/tcp") {
            redirect::build_tcp(kind).await?
        } else {
            redirect::build_udp(kind).await?
        };
        if kind == RedirectKind::Noop {
            tracing::debug!(label = %dc.label(), "No redirect for this role");
        }

        let weak = Arc::downgrade(self);
        let span = tracing::Span::current();
        let pipe = Pipe::start(dc, redirect, &self.cancel, move |_| {
            Peer::spawn_terminate(&weak, span);
        });
        self.pipes.lock().push(pipe);
        Ok(())
    }

    /// Open our data channels and send the offer. Only the first call has
    /// any effect.
    pub async fn initiate(self: &Arc<Self>) -> Result<(), ProxyError> {
        if self.offered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tcp = self
            .pc
            .create_data_channel(
                &channel_label(&self.game_id, "tcp"),
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        let udp = self
            .pc
            .create_data_channel(
                &channel_label(&self.game_id, "udp"),
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await?;
        self.attach(&tcp).await?;
        self.attach(&udp).await?;

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        tracing::debug!(peer_id = self.player.user_id, "Sending offer");
        self.signaler
            .signal(&self.id(), Signal::Offer(to_wire(&offer)))
            .await
    }

    pub async fn on_signal(&self, signal: Signal) -> Result<(), ProxyError> {
        match signal {
            Signal::Offer(offer) => self.accept_offer(offer.sdp).await,
            Signal::Answer(answer) => self.accept_answer(answer.sdp).await,
            Signal::Candidate(candidate) => self.add_candidate(candidate).await,
        }
    }

    async fn accept_offer(&self, sdp: String) -> Result<(), ProxyError> {
        self.pc
            .set_remote_description(RTCSessionDescription::offer(sdp)?)
            .await?;
        self.flush_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        tracing::debug!(peer_id = self.player.user_id, "Sending answer");
        self.signaler
            .signal(&self.id(), Signal::Answer(to_wire(&answer)))
            .await
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), ProxyError> {
        self.pc
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        self.flush_candidates().await;
        Ok(())
    }

    async fn add_candidate(&self, candidate: wire::IceCandidate) -> Result<(), ProxyError> {
        let init = from_wire_candidate(candidate);
        let init = {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                Some(buffer) => {
                    buffer.push(init);
                    return Ok(());
                }
                None => init,
            }
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn flush_candidates(&self) {
        let buffered = self.pending.lock().take().unwrap_or_default();
        for candidate in buffered {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                tracing::debug!(peer_id = self.player.user_id, error = %err, "Buffered candidate rejected");
            }
        }
    }

    /// Close the pipes and the connection. Safe to call more than once.
    pub async fn terminate(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let pipes: Vec<Arc<Pipe>> = self.pipes.lock().drain(..).collect();
        for pipe in pipes {
            pipe.close();
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(peer_id = self.player.user_id, error = %err, "Closing peer connection");
        }
        tracing::info!(peer_id = self.player.user_id, "Peer terminated");
    }
}
