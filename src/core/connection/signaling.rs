//! Signaling collaborator.
//!
//! The session only needs a way to push opaque payloads to one named peer
//! and to receive the payloads that peer sends back. Any pub/sub backend
//! fits behind [`Signaling`]; [`LocalSignalingHub`] is the in-process one
//! used by the loopback command and tests.
//!
//! Wire shape:
//!
//! ```json
//! {"type":"offer","data":{"sdp":"..."}}
//! {"type":"answer","data":{"sdp":"..."}}
//! {"type":"candidate","data":{"candidate":{"candidate":"...","sdpMid":"0", ...}}}
//! ```

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum SignalingPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RTCIceCandidateInit },
}

impl SignalingPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingPayload::Offer { .. } => "offer",
            SignalingPayload::Answer { .. } => "answer",
            SignalingPayload::Candidate { .. } => "candidate",
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling unavailable: {0}")]
    Unavailable(String),
}

pub trait Signaling: Send + Sync + 'static {
    fn local_id(&self) -> &str;

    /// Deliver `payload` to peer `to`.
    fn send(&self, to: &str, payload: SignalingPayload) -> BoxFuture<'_, Result<(), SignalingError>>;

    /// Payloads sent to us by peer `from`, in order. A later call replaces
    /// the earlier receiver.
    fn subscribe(&self, from: &str) -> Result<mpsc::UnboundedReceiver<SignalingPayload>, SignalingError>;
}

type Route = (String, String);

#[derive(Default)]
struct Mailbox {
    sink: Option<mpsc::UnboundedSender<SignalingPayload>>,
    backlog: Vec<SignalingPayload>,
}

/// In-process relay. Payloads sent before the recipient subscribes are
/// held and replayed on subscribe.
#[derive(Clone, Default)]
pub struct LocalSignalingHub {
    routes: Arc<Mutex<HashMap<Route, Mailbox>>>,
}

impl LocalSignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signaling handle for peer `peer_id`.
    pub fn endpoint(&self, peer_id: &str) -> LocalSignaling {
        LocalSignaling {
            hub: self.clone(),
            local_id: peer_id.to_string(),
        }
    }

    fn post(&self, from: &str, to: &str, payload: SignalingPayload) -> Result<(), SignalingError> {
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| SignalingError::Unavailable("hub lock poisoned".into()))?;
        let mailbox = routes.entry((to.to_string(), from.to_string())).or_default();
        trace!(event = "signal_post", from, to, kind = payload.kind());
        let payload = match mailbox.sink.take() {
            Some(sink) => match sink.send(payload) {
                Ok(()) => {
                    mailbox.sink = Some(sink);
                    return Ok(());
                }
                Err(mpsc::error::SendError(returned)) => returned,
            },
            None => payload,
        };
        mailbox.backlog.push(payload);
        Ok(())
    }

    fn open(
        &self,
        to: &str,
        from: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingPayload>, SignalingError> {
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| SignalingError::Unavailable("hub lock poisoned".into()))?;
        let mailbox = routes.entry((to.to_string(), from.to_string())).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        for payload in mailbox.backlog.drain(..) {
            let _ = tx.send(payload);
        }
        mailbox.sink = Some(tx);
        Ok(rx)
    }
}

pub struct LocalSignaling {
    hub: LocalSignalingHub,
    local_id: String,
}

impl Signaling for LocalSignaling {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn send(&self, to: &str, payload: SignalingPayload) -> BoxFuture<'_, Result<(), SignalingError>> {
        let result = self.hub.post(&self.local_id, to, payload);
        Box::pin(async move { result })
    }

    fn subscribe(&self, from: &str) -> Result<mpsc::UnboundedReceiver<SignalingPayload>, SignalingError> {
        self.hub.open(&self.local_id, from)
    }
}
