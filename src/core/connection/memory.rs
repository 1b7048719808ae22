//! In-memory channel pair for tests.
//!
//! Each direction is a [`MemoryLink`]: frames sit in a queue (counted as the
//! sender's buffered amount) until a pump task delivers them. Pausing a link
//! stops delivery, so buffered bytes pile up exactly like a congested data
//! channel and backpressure becomes observable.

use super::channel::{Channel, ChannelError, ChannelFrame, ChannelTransport, WeakChannel};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct LinkInner {
    queue: Mutex<VecDeque<ChannelFrame>>,
    buffered: AtomicUsize,
    max_buffered_at_send: AtomicUsize,
    sent_frames: AtomicUsize,
    paused: AtomicBool,
    dropping: AtomicBool,
    closed: AtomicBool,
    wake: Notify,
}

/// Test-side control of one direction of a pair.
#[derive(Clone)]
pub struct MemoryLink {
    inner: Arc<LinkInner>,
}

impl MemoryLink {
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// While set, binary frames are silently lost.
    pub fn set_dropping(&self, dropping: bool) {
        self.inner.dropping.store(dropping, Ordering::SeqCst);
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffered.load(Ordering::SeqCst)
    }

    /// Highest buffered amount observed at the moment of a send.
    pub fn max_buffered_at_send(&self) -> usize {
        self.inner.max_buffered_at_send.load(Ordering::SeqCst)
    }

    pub fn sent_frames(&self) -> usize {
        self.inner.sent_frames.load(Ordering::SeqCst)
    }
}

struct MemoryTransport {
    link: Arc<LinkInner>,
}

impl ChannelTransport for MemoryTransport {
    fn send(&self, frame: ChannelFrame) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            if self.link.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed("memory".into()));
            }
            let before = self.link.buffered.fetch_add(frame.len(), Ordering::SeqCst);
            self.link
                .max_buffered_at_send
                .fetch_max(before, Ordering::SeqCst);
            self.link.sent_frames.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut queue) = self.link.queue.lock() {
                queue.push_back(frame);
            }
            self.link.wake.notify_one();
            Ok(())
        })
    }

    fn buffered_amount(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.link.buffered.load(Ordering::SeqCst) })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            self.link.closed.store(true, Ordering::SeqCst);
            self.link.wake.notify_one();
            Ok(())
        })
    }
}

/// Two open channels wired to each other, plus the a→b and b→a links.
pub fn memory_pair(
    label: &str,
    protocol: &str,
    low_threshold: usize,
) -> (Channel, Channel, MemoryLink, MemoryLink) {
    let ab = Arc::new(LinkInner::default());
    let ba = Arc::new(LinkInner::default());
    let a = Channel::new(label, protocol, low_threshold, MemoryTransport { link: ab.clone() });
    let b = Channel::new(label, protocol, low_threshold, MemoryTransport { link: ba.clone() });
    a.mark_open();
    b.mark_open();
    tokio::spawn(pump(ab.clone(), a.downgrade(), b.downgrade()));
    tokio::spawn(pump(ba.clone(), b.downgrade(), a.downgrade()));
    (a, b, MemoryLink { inner: ab }, MemoryLink { inner: ba })
}

async fn pump(link: Arc<LinkInner>, src: WeakChannel, dst: WeakChannel) {
    loop {
        link.wake.notified().await;
        while !link.paused.load(Ordering::SeqCst) {
            let next = link.queue.lock().ok().and_then(|mut q| q.pop_front());
            let Some(frame) = next else { break };
            let len = frame.len();
            let lost = link.dropping.load(Ordering::SeqCst)
                && matches!(frame, ChannelFrame::Binary(_));
            if !lost && let Some(dst) = dst.upgrade() {
                dst.deliver(frame);
            }
            let left = link.buffered.fetch_sub(len, Ordering::SeqCst) - len;
            if let Some(src) = src.upgrade()
                && left <= src.low_threshold()
            {
                src.signal_low();
            }
            tokio::task::yield_now().await;
        }
        if link.closed.load(Ordering::SeqCst) {
            if let Some(src) = src.upgrade() {
                src.mark_closed();
            }
            if let Some(dst) = dst.upgrade() {
                dst.mark_closed();
            }
            return;
        }
    }
}
