//! Peer Session: one peer connection, its control channel and its transfer
//! channels, negotiated through a [`Signaling`] collaborator.
//!
//! ```text
//!   Idle ──connect()──► Connecting ──ICE ok──► Connected
//!                          │                      │  ▲
//!                          │ timeout/failed       │  │ reconnect()
//!                          ▼                      ▼  │
//!                        Closed ◄──failed──── Disconnected
//! ```
//!
//! Every callback registered on the peer connection or its channels holds a
//! weak reference and checks the session's [`SignalOfStop`] first, so once
//! `disconnect()` has run nothing fires anymore. A closed session cannot be
//! reused.

use super::channel::{Channel, ChannelError, ChannelEvent, ChannelFrame};
use super::negotiation::{Negotiator, OfferAction, PeerIdentity};
use super::rtc;
use super::signaling::{Signaling, SignalingError, SignalingPayload};
use crate::core::config::{EVENT_CHANNEL_CAPACITY, MESSAGE_PROTOCOL, SessionConfig, TRANSFER_PROTOCOL};
use crate::utils::sos::SignalOfStop;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl SessionState {
    /// A closed session never leaves that state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    State(SessionState),
    MessageChannelReady,
    MessageChannelClosed,
    /// JSON application message from the control channel.
    Message(serde_json::Value),
    /// A channel opened by the remote side is ready.
    ChannelOpened(Channel),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("connection timed out")]
    Timeout,
    #[error("connection failed")]
    Failed,
    #[error("connection lost")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session is closed")]
    Closed,
    #[error("message channel is not ready")]
    NoMessageChannel,
    #[error("no local description")]
    NoLocalDescription,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SessionInner {
    local: PeerIdentity,
    remote: PeerIdentity,
    config: SessionConfig,
    low_threshold: usize,
    pc: Arc<RTCPeerConnection>,
    signaling: Arc<dyn Signaling>,
    negotiator: Mutex<Negotiator>,
    channels: Mutex<HashMap<String, Channel>>,
    message_channel: Mutex<Option<Channel>>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    sos: SignalOfStop,
}

#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

fn upgrade(weak: &Weak<SessionInner>) -> Option<PeerSession> {
    weak.upgrade().map(|inner| PeerSession { inner })
}

impl PeerSession {
    /// Create the peer connection. Nothing is exchanged until `listen()`
    /// and `connect()` are called.
    pub async fn new(
        local: PeerIdentity,
        remote: PeerIdentity,
        signaling: Arc<dyn Signaling>,
        config: SessionConfig,
        low_threshold: usize,
    ) -> Result<Self, SessionError> {
        let api = rtc::create_api(&config)?;
        let pc = Arc::new(api.new_peer_connection(rtc::rtc_configuration(&config)).await?);
        let negotiator = Negotiator::new(&local, &remote);
        info!(
            event = "session_created",
            local = %local.id,
            remote = %remote.id,
            polite = negotiator.polite()
        );

        let (state, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session = Self {
            inner: Arc::new(SessionInner {
                local,
                remote,
                config,
                low_threshold,
                pc,
                signaling,
                negotiator: Mutex::new(negotiator),
                channels: Mutex::new(HashMap::new()),
                message_channel: Mutex::new(None),
                state,
                events,
                sos: SignalOfStop::new(),
            }),
        };
        session.register_handlers();
        Ok(session)
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.inner.local
    }

    pub fn remote(&self) -> &PeerIdentity {
        &self.inner.remote
    }

    pub fn is_polite(&self) -> bool {
        lock(&self.inner.negotiator).polite()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn message_channel_ready(&self) -> bool {
        lock(&self.inner.message_channel)
            .as_ref()
            .is_some_and(Channel::is_open)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.inner.sos.cancelled() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, new: SessionState) {
        if self.inner.sos.cancelled() && new != SessionState::Closed {
            return;
        }
        let changed = self.inner.state.send_if_modified(|s| {
            if *s == new || *s == SessionState::Closed {
                false
            } else {
                *s = new;
                true
            }
        });
        if changed {
            info!(event = "session_state", remote = %self.inner.remote.id, state = ?new);
            self.emit(SessionEvent::State(new));
        }
    }

    async fn signal(&self, payload: SignalingPayload) -> Result<(), SessionError> {
        self.inner
            .signaling
            .send(&self.inner.remote.id, payload)
            .await?;
        Ok(())
    }

    // ── Peer connection callbacks ────────────────────────────────────────

    fn register_handlers(&self) {
        let pc = &self.inner.pc;

        let weak = Arc::downgrade(&self.inner);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let (Some(candidate), Some(session)) = (candidate, upgrade(&weak)) else {
                    return;
                };
                if session.inner.sos.cancelled() {
                    return;
                }
                match candidate.to_json() {
                    Ok(candidate) => {
                        if let Err(e) = session
                            .signal(SignalingPayload::Candidate { candidate })
                            .await
                        {
                            warn!(event = "ice_candidate_send_failure", error = %e);
                        }
                    }
                    Err(e) => warn!(event = "ice_candidate_encode_failure", error = %e),
                }
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = upgrade(&weak) else { return };
                if session.inner.sos.cancelled() {
                    return;
                }
                match s {
                    RTCPeerConnectionState::Connected => session.set_state(SessionState::Connected),
                    RTCPeerConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", "Transient disconnect, ICE may recover");
                        session.set_state(SessionState::Disconnected);
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        error!(event = "webrtc_failed", state = %s);
                        // Closing the peer connection from inside its own callback is unsafe.
                        tokio::spawn(async move { session.disconnect().await });
                    }
                    _ => {}
                }
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        pc.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = upgrade(&weak) else { return };
                debug!(event = "signaling_state", state = %s);
                if s == RTCSignalingState::Closed && !session.inner.sos.cancelled() {
                    tokio::spawn(async move { session.disconnect().await });
                }
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        pc.on_data_channel(Box::new(move |dc| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = upgrade(&weak) else { return };
                if session.inner.sos.cancelled() {
                    return;
                }
                debug!(event = "dc_remote_open", channel = %dc.label(), protocol = %dc.protocol());
                let channel =
                    rtc::wrap_data_channel(dc, session.inner.low_threshold, &session.inner.sos).await;
                session.adopt_channel(channel, true);
            })
        }));
    }

    fn adopt_channel(&self, channel: Channel, announce: bool) {
        if channel.protocol() == MESSAGE_PROTOCOL {
            self.install_message_channel(channel);
            return;
        }
        lock(&self.inner.channels).insert(channel.label().to_string(), channel.clone());
        if !announce {
            return;
        }
        let events = self.inner.events.clone();
        let sos = self.inner.sos.clone();
        let timeout = self.inner.config.channel_open_timeout();
        tokio::spawn(async move {
            match sos.select(channel.wait_open(timeout)).await {
                Some(Ok(())) => {
                    let _ = events.send(SessionEvent::ChannelOpened(channel));
                }
                Some(Err(e)) => warn!(event = "dc_open_failure", error = %e),
                None => {}
            }
        });
    }

    /// The control channel is the only one the session reads itself.
    fn install_message_channel(&self, channel: Channel) {
        *lock(&self.inner.message_channel) = Some(channel.clone());
        let weak = Arc::downgrade(&self.inner);
        let events = self.inner.events.clone();
        let sos = self.inner.sos.clone();
        let timeout = self.inner.config.channel_open_timeout();

        tokio::spawn(async move {
            let mut rx = channel.attach();
            match sos.select(channel.wait_open(timeout)).await {
                Some(Ok(())) => {
                    info!(event = "message_channel_ready", channel = %channel.label());
                    let _ = events.send(SessionEvent::MessageChannelReady);
                }
                Some(Err(e)) => {
                    warn!(event = "message_channel_open_failure", error = %e);
                    return;
                }
                None => return,
            }

            while let Some(Some(event)) = sos.select(rx.recv()).await {
                match event {
                    ChannelEvent::Message(frame) => {
                        let parsed = match &frame {
                            ChannelFrame::Text(text) => serde_json::from_str(text),
                            ChannelFrame::Binary(data) => serde_json::from_slice(data),
                        };
                        match parsed {
                            Ok(value) => {
                                let _ = events.send(SessionEvent::Message(value));
                            }
                            Err(e) => warn!(event = "message_decode_failure", error = %e),
                        }
                    }
                    ChannelEvent::Closed => {
                        info!(event = "message_channel_closed");
                        let _ = events.send(SessionEvent::MessageChannelClosed);
                        if let Some(session) = upgrade(&weak) {
                            let mut slot = lock(&session.inner.message_channel);
                            if slot.as_ref().is_some_and(|c| c.same(&channel)) {
                                *slot = None;
                            }
                        }
                        break;
                    }
                    ChannelEvent::Error(e) => warn!(event = "message_channel_error", error = %e),
                }
            }
        });
    }

    // ── Negotiation ──────────────────────────────────────────────────────

    /// Start consuming signaling payloads from the remote peer.
    pub fn listen(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        let mut rx = self.inner.signaling.subscribe(&self.inner.remote.id)?;
        let weak = Arc::downgrade(&self.inner);
        let sos = self.inner.sos.clone();

        tokio::spawn(async move {
            while let Some(Some(payload)) = sos.select(rx.recv()).await {
                let Some(session) = upgrade(&weak) else { break };
                let kind = payload.kind();
                if let Err(e) = session.handle_signal(payload).await {
                    warn!(event = "signal_handling_failure", kind, error = %e);
                    session.emit(SessionEvent::Error(e.to_string()));
                }
            }
            debug!(event = "signal_listener_stopped");
        });
        Ok(())
    }

    async fn handle_signal(&self, payload: SignalingPayload) -> Result<(), SessionError> {
        let pc = &self.inner.pc;
        match payload {
            SignalingPayload::Offer { sdp } => {
                let stable = pc.signaling_state() == RTCSignalingState::Stable;
                let action = lock(&self.inner.negotiator).on_offer(stable);
                let OfferAction::Accept { rollback } = action else {
                    debug!(event = "offer_ignored", "Offer collision, keeping our own offer");
                    return Ok(());
                };
                if rollback {
                    debug!(event = "offer_rollback");
                    self.rollback().await?;
                }
                pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
                    .await?;
                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer).await?;
                let sdp = pc
                    .local_description()
                    .await
                    .ok_or(SessionError::NoLocalDescription)?
                    .sdp;
                self.signal(SignalingPayload::Answer { sdp }).await?;
            }
            SignalingPayload::Answer { sdp } => {
                if !lock(&self.inner.negotiator).should_apply_answer() {
                    debug!(event = "answer_ignored");
                    return Ok(());
                }
                pc.set_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await?;
            }
            SignalingPayload::Candidate { candidate } => {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    if lock(&self.inner.negotiator).swallow_candidate_error() {
                        debug!(event = "candidate_ignored", error = %e);
                    } else {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), SessionError> {
        let desc: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({"type": "rollback", "sdp": ""}))?;
        self.inner.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn negotiate(&self, ice_restart: bool) -> Result<(), SessionError> {
        if !lock(&self.inner.negotiator).may_offer() {
            debug!(event = "negotiation_deferred", "Polite peer waits for the remote offer");
            return Ok(());
        }
        if !lock(&self.inner.negotiator).begin_offer() {
            debug!(event = "negotiation_in_flight");
            return Ok(());
        }
        let result = self.make_offer(ice_restart).await;
        lock(&self.inner.negotiator).end_offer();
        result
    }

    async fn make_offer(&self, ice_restart: bool) -> Result<(), SessionError> {
        let pc = &self.inner.pc;
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = pc.create_offer(options).await?;
        pc.set_local_description(offer).await?;
        let sdp = pc
            .local_description()
            .await
            .ok_or(SessionError::NoLocalDescription)?
            .sdp;
        debug!(event = "offer_sent", ice_restart);
        self.signal(SignalingPayload::Offer { sdp }).await
    }

    /// Create and send a fresh offer. A no-op on the polite peer or while an
    /// offer is already in flight.
    pub async fn renegotiate(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.negotiate(false).await
    }

    /// Connect to the remote peer, or fail with a [`ConnectError`]. Any
    /// failure tears the session down.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        self.set_state(SessionState::Connecting);

        let offered = async {
            if lock(&self.inner.negotiator).may_offer() {
                if lock(&self.inner.message_channel).is_none() {
                    // The first channel must exist before the offer so the
                    // SDP carries an application section.
                    self.open_channel(MESSAGE_PROTOCOL, MESSAGE_PROTOCOL).await?;
                }
                self.negotiate(false).await?;
            }
            Ok::<(), SessionError>(())
        }
        .await;

        let result = match offered {
            Ok(()) => self
                .wait_connected(self.inner.config.connect_timeout())
                .await
                .map_err(SessionError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            error!(event = "connect_failure", remote = %self.inner.remote.id, error = %e);
            self.disconnect().await;
        }
        result
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<(), ConnectError> {
        let mut rx = self.inner.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| !matches!(s, SessionState::Idle | SessionState::Connecting)),
        )
        .await;
        let state = match waited {
            Err(_) => return Err(ConnectError::Timeout),
            Ok(Err(_)) => return Err(ConnectError::Failed),
            Ok(Ok(state)) => *state,
        };
        match state {
            SessionState::Connected => Ok(()),
            SessionState::Disconnected => Err(ConnectError::Disconnected),
            _ => Err(ConnectError::Failed),
        }
    }

    /// Restart ICE and re-offer, keeping existing channels. A no-op when
    /// already connected or on the polite peer.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        info!(event = "session_reconnect", remote = %self.inner.remote.id);
        self.negotiate(true).await
    }

    // ── Channels ─────────────────────────────────────────────────────────

    async fn open_channel(&self, label: &str, protocol: &str) -> Result<Channel, SessionError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            protocol: Some(protocol.to_string()),
            ..Default::default()
        };
        let dc = self.inner.pc.create_data_channel(label, Some(init)).await?;
        let channel = rtc::wrap_data_channel(dc, self.inner.low_threshold, &self.inner.sos).await;
        self.adopt_channel(channel.clone(), false);
        Ok(channel)
    }

    /// Open a data channel and wait until it is usable.
    pub async fn create_channel(&self, label: &str, protocol: &str) -> Result<Channel, SessionError> {
        self.ensure_live()?;
        let channel = self.open_channel(label, protocol).await?;
        channel
            .wait_open(self.inner.config.channel_open_timeout())
            .await?;
        Ok(channel)
    }

    /// Open `<transfer_id>-0 .. <transfer_id>-(count-1)`.
    pub async fn create_transfer_channels(
        &self,
        transfer_id: &str,
        count: usize,
    ) -> Result<Vec<Channel>, SessionError> {
        let opening = (0..count.max(1)).map(|i| {
            let label = format!("{transfer_id}-{i}");
            async move { self.create_channel(&label, TRANSFER_PROTOCOL).await }
        });
        futures::future::try_join_all(opening).await
    }

    /// Known transfer channels of `transfer_id`, ordered by index.
    pub fn transfer_channels(&self, transfer_id: &str) -> Vec<Channel> {
        let prefix = format!("{transfer_id}-");
        let mut found: Vec<(u32, Channel)> = lock(&self.inner.channels)
            .values()
            .filter(|c| c.protocol() == TRANSFER_PROTOCOL)
            .filter_map(|c| {
                let index = c.label().strip_prefix(&prefix)?.parse().ok()?;
                Some((index, c.clone()))
            })
            .collect();
        found.sort_by_key(|(i, _)| *i);
        found.into_iter().map(|(_, c)| c).collect()
    }

    /// Send a JSON application message on the control channel.
    pub async fn send_message<T: Serialize>(&self, message: &T) -> Result<(), SessionError> {
        self.ensure_live()?;
        let channel = lock(&self.inner.message_channel)
            .clone()
            .ok_or(SessionError::NoMessageChannel)?;
        channel.send_json(message).await?;
        Ok(())
    }

    /// Tear everything down. Idempotent; the session is unusable afterwards.
    pub async fn disconnect(&self) {
        if !self.inner.sos.cancel() {
            return;
        }
        info!(event = "session_disconnect", remote = %self.inner.remote.id);

        let mut channels: Vec<Channel> = lock(&self.inner.channels).drain().map(|(_, c)| c).collect();
        if let Some(mc) = lock(&self.inner.message_channel).take() {
            channels.push(mc);
        }
        for channel in channels {
            if let Err(e) = channel.close().await {
                debug!(event = "dc_close_failure", channel = %channel.label(), error = %e);
            }
        }
        if let Err(e) = self.inner.pc.close().await {
            warn!(event = "pc_close_failure", error = %e);
        }
        self.set_state(SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::signaling::LocalSignalingHub;

    fn loopback_config() -> SessionConfig {
        SessionConfig {
            ice_servers: Vec::new(),
            include_loopback: true,
            connect_timeout_ms: 20_000,
            channel_open_timeout_ms: 10_000,
        }
    }

    async fn session_pair() -> (PeerSession, PeerSession) {
        let hub = LocalSignalingHub::new();
        let a_id = PeerIdentity::new("a", 1);
        let b_id = PeerIdentity::new("b", 2);
        let a = PeerSession::new(
            a_id.clone(),
            b_id.clone(),
            Arc::new(hub.endpoint("a")),
            loopback_config(),
            1024 * 1024,
        )
        .await
        .unwrap();
        let b = PeerSession::new(b_id, a_id, Arc::new(hub.endpoint("b")), loopback_config(), 1024 * 1024)
            .await
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn roles_follow_creation_time() {
        let (a, b) = session_pair().await;
        assert!(!a.is_polite());
        assert!(b.is_polite());
        assert_eq!(a.state(), SessionState::Idle);

        // The polite side never offers on its own.
        b.renegotiate().await.unwrap();
        assert_eq!(b.state(), SessionState::Idle);

        a.disconnect().await;
        a.disconnect().await;
        assert_eq!(a.state(), SessionState::Closed);
        assert!(matches!(a.connect().await, Err(SessionError::Closed)));
        assert!(matches!(
            b.send_message(&serde_json::json!({})).await,
            Err(SessionError::NoMessageChannel)
        ));
        b.disconnect().await;
    }

    #[tokio::test]
    #[ignore = "opens UDP sockets for a real loopback ICE exchange"]
    async fn loopback_connect_and_exchange() {
        let (a, b) = session_pair().await;
        a.listen().unwrap();
        b.listen().unwrap();
        let mut b_events = b.subscribe();

        let (ra, rb) = tokio::join!(a.connect(), b.connect());
        ra.unwrap();
        rb.unwrap();
        assert_eq!(a.state(), SessionState::Connected);

        let channels = a.create_transfer_channels("t1", 2).await.unwrap();
        assert_eq!(channels.len(), 2);
        a.send_message(&serde_json::json!({"type": "ping"})).await.unwrap();

        let mut opened = 0;
        let mut got_message = false;
        while opened < 2 || !got_message {
            match tokio::time::timeout(Duration::from_secs(10), b_events.recv()).await {
                Ok(Ok(SessionEvent::ChannelOpened(_))) => opened += 1,
                Ok(Ok(SessionEvent::Message(v))) => got_message = v["type"] == "ping",
                Ok(Ok(_)) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(b.transfer_channels("t1").len(), 2);

        a.disconnect().await;
        b.disconnect().await;
    }
}
