//! Data channel handle.
//!
//! A [`Channel`] wraps one transport-level data channel behind a small
//! [`ChannelTransport`] seam. The session owns the lifecycle (open, close);
//! transferers only borrow a channel: they `attach()` to receive its
//! messages and `detach()` when done, and never close it.
//!
//! Incoming messages that arrive before anyone is attached are kept in a
//! backlog and replayed on the next `attach()`.

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("channel {0} is not open")]
    NotOpen(String),
    #[error("channel {0} did not open in time")]
    OpenTimeout(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One message on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Bytes),
}

impl ChannelFrame {
    pub fn len(&self) -> usize {
        match self {
            ChannelFrame::Text(s) => s.len(),
            ChannelFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(ChannelFrame),
    Closed,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// The transport-specific half of a channel.
pub trait ChannelTransport: Send + Sync + 'static {
    fn send(&self, frame: ChannelFrame) -> BoxFuture<'_, Result<(), ChannelError>>;
    /// Bytes queued for sending but not yet handed to the network.
    fn buffered_amount(&self) -> BoxFuture<'_, usize>;
    fn close(&self) -> BoxFuture<'_, Result<(), ChannelError>>;
}

#[derive(Default)]
struct Inbox {
    sink: Option<mpsc::UnboundedSender<ChannelEvent>>,
    backlog: VecDeque<ChannelEvent>,
}

struct ChannelShared {
    label: String,
    protocol: String,
    low_threshold: usize,
    transport: Box<dyn ChannelTransport>,
    state: watch::Sender<ChannelState>,
    low: Notify,
    inbox: Mutex<Inbox>,
}

#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

/// Non-owning reference, held by transport callbacks.
#[derive(Clone)]
pub struct WeakChannel(Weak<ChannelShared>);

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|shared| Channel { shared })
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.shared.label)
            .field("protocol", &self.shared.protocol)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub fn new(
        label: impl Into<String>,
        protocol: impl Into<String>,
        low_threshold: usize,
        transport: impl ChannelTransport,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        Self {
            shared: Arc::new(ChannelShared {
                label: label.into(),
                protocol: protocol.into(),
                low_threshold,
                transport: Box::new(transport),
                state,
                low: Notify::new(),
                inbox: Mutex::new(Inbox::default()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.shared))
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn protocol(&self) -> &str {
        &self.shared.protocol
    }

    pub fn low_threshold(&self) -> usize {
        self.shared.low_threshold
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // ── Transport side ───────────────────────────────────────────────────

    pub fn mark_open(&self) {
        let changed = self.shared.state.send_if_modified(|s| {
            if *s == ChannelState::Connecting {
                *s = ChannelState::Open;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(event = "dc_open", channel = %self.label());
        }
    }

    pub fn mark_closed(&self) {
        let prev = self.shared.state.send_replace(ChannelState::Closed);
        if prev == ChannelState::Closed {
            return;
        }
        debug!(event = "dc_closed", channel = %self.label());
        // Wake flow-control waiters so they re-check availability.
        self.shared.low.notify_waiters();
        self.push(ChannelEvent::Closed);
    }

    pub fn report_error(&self, message: String) {
        warn!(event = "dc_error", channel = %self.label(), error = %message);
        self.push(ChannelEvent::Error(message));
    }

    pub fn deliver(&self, frame: ChannelFrame) {
        self.push(ChannelEvent::Message(frame));
    }

    /// The send buffer dropped to the low-water threshold.
    pub fn signal_low(&self) {
        self.shared.low.notify_waiters();
    }

    fn push(&self, event: ChannelEvent) {
        let Ok(mut inbox) = self.shared.inbox.lock() else {
            return;
        };
        let mut event = event;
        if let Some(sink) = inbox.sink.take() {
            match sink.send(event) {
                Ok(()) => {
                    inbox.sink = Some(sink);
                    return;
                }
                // Receiver dropped without detach.
                Err(mpsc::error::SendError(returned)) => event = returned,
            }
        }
        inbox.backlog.push_back(event);
    }

    // ── Consumer side ────────────────────────────────────────────────────

    /// Route incoming events to a fresh receiver, replacing any previous one.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inbox) = self.shared.inbox.lock() {
            for event in inbox.backlog.drain(..) {
                let _ = tx.send(event);
            }
            inbox.sink = Some(tx);
        }
        rx
    }

    /// Stop routing; later events go to the backlog.
    pub fn detach(&self) {
        if let Ok(mut inbox) = self.shared.inbox.lock() {
            inbox.sink = None;
        }
    }

    /// Future resolving on the next low-buffer (or close) signal. Enable it
    /// before checking `buffered_amount` to avoid missing a wakeup.
    pub fn low_notified(&self) -> Notified<'_> {
        self.shared.low.notified()
    }

    pub async fn buffered_amount(&self) -> usize {
        self.shared.transport.buffered_amount().await
    }

    /// Open and at or below its low-water threshold.
    pub async fn is_available(&self) -> bool {
        self.is_open() && self.buffered_amount().await <= self.low_threshold()
    }

    pub async fn send(&self, frame: ChannelFrame) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Open => self.shared.transport.send(frame).await,
            ChannelState::Closed => Err(ChannelError::Closed(self.shared.label.clone())),
            ChannelState::Connecting => Err(ChannelError::NotOpen(self.shared.label.clone())),
        }
    }

    pub async fn send_binary(&self, data: Bytes) -> Result<(), ChannelError> {
        self.send(ChannelFrame::Binary(data)).await
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ChannelError> {
        let text = serde_json::to_string(value)?;
        self.send(ChannelFrame::Text(text)).await
    }

    /// Wait until the channel is open; fails if it closes first.
    pub async fn wait_open(&self, timeout: Duration) -> Result<(), ChannelError> {
        let mut rx = self.shared.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s != ChannelState::Connecting),
        )
        .await;
        match waited {
            Ok(Ok(state)) if *state == ChannelState::Open => Ok(()),
            Ok(_) => Err(ChannelError::Closed(self.shared.label.clone())),
            Err(_) => Err(ChannelError::OpenTimeout(self.shared.label.clone())),
        }
    }

    pub async fn close(&self) -> Result<(), ChannelError> {
        let result = self.shared.transport.close().await;
        self.mark_closed();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::memory_pair;

    #[tokio::test]
    async fn backlog_is_replayed_on_attach() {
        let (a, b, _ab, _ba) = memory_pair("t-0", "transfer", 1024);
        a.send_json(&serde_json::json!({"n": 1})).await.unwrap();
        a.send_binary(Bytes::from_static(b"xyz")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut rx = b.attach();
        assert!(matches!(
            rx.recv().await,
            Some(ChannelEvent::Message(ChannelFrame::Text(t))) if t == r#"{"n":1}"#
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ChannelEvent::Message(ChannelFrame::Binary(b))) if &b[..] == b"xyz"
        ));
    }

    #[tokio::test]
    async fn closed_channel_rejects_sends_and_reports_once() {
        let (a, b, _ab, _ba) = memory_pair("t-0", "transfer", 1024);
        let mut rx = b.attach();
        a.close().await.unwrap();
        a.close().await.unwrap();

        assert!(matches!(
            a.send_binary(Bytes::new()).await,
            Err(ChannelError::Closed(_))
        ));
        assert!(matches!(rx.recv().await, Some(ChannelEvent::Closed)));
        assert!(!b.is_open());
        assert!(b.wait_open(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn wait_open_times_out_while_connecting() {
        struct Idle;
        impl ChannelTransport for Idle {
            fn send(&self, _: ChannelFrame) -> BoxFuture<'_, Result<(), ChannelError>> {
                Box::pin(async { Ok(()) })
            }
            fn buffered_amount(&self) -> BoxFuture<'_, usize> {
                Box::pin(async { 0 })
            }
            fn close(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
                Box::pin(async { Ok(()) })
            }
        }
        let ch = Channel::new("idle", "transfer", 0, Idle);
        assert!(matches!(
            ch.wait_open(Duration::from_millis(10)).await,
            Err(ChannelError::OpenTimeout(_))
        ));
        assert!(matches!(
            ch.send_binary(Bytes::new()).await,
            Err(ChannelError::NotOpen(_))
        ));
        ch.mark_open();
        ch.wait_open(Duration::from_millis(10)).await.unwrap();
    }
}
