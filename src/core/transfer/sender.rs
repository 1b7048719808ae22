//! Send side of a transfer.
//!
//! Requested chunk indices are coalesced into one pending set, so a chunk is
//! queued at most once no matter how many overlapping `request-content`
//! messages arrive. Each batch runs a two-stage pipeline:
//!
//! ```text
//!  cache.get_chunk ─► worker.submit(Compress) ─► [bounded queue, chunk order] ─► split ─► acquire channel ─► send
//! ```
//!
//! Compression runs up to `compress_ahead` chunks ahead of transmission
//! while blocks still leave in chunk order.

use super::flow::wait_drained;
use super::messages::TransferMessage;
use super::{Command, LiveChannels, TransferCtx, TransferError, TransferProgress, attach_all};
use crate::core::cache::CacheEvent;
use crate::core::codec::{CodecRequest, PendingReply, split_chunk};
use crate::core::config::BUFFER_POLL_INTERVAL;
use crate::core::connection::{ChannelEvent, ChannelFrame};
use crate::core::meta::FileMetaData;
use crate::core::range::{merge_ranges, parse_ranges, ranges_byte_len};
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Chunk bookkeeping shared between the event loop and the running batch.
#[derive(Debug, Default)]
pub(super) struct SendQueue {
    pending: BTreeSet<u32>,
    in_flight: BTreeSet<u32>,
    sent: BTreeSet<u32>,
}

impl SendQueue {
    /// Queue `indices` below `total`, skipping chunks already queued or in
    /// flight. Returns how many were newly queued.
    pub(super) fn enqueue<I: IntoIterator<Item = u32>>(&mut self, indices: I, total: u32) -> usize {
        let mut added = 0;
        for index in indices.into_iter().filter(|&i| i < total) {
            if !self.in_flight.contains(&index) && self.pending.insert(index) {
                added += 1;
            }
        }
        added
    }

    /// Move everything pending into flight, in ascending order.
    pub(super) fn take_pending(&mut self) -> Vec<u32> {
        let batch: Vec<u32> = std::mem::take(&mut self.pending).into_iter().collect();
        self.in_flight.extend(batch.iter().copied());
        batch
    }

    pub(super) fn finish(&mut self, index: u32, sent: bool) {
        self.in_flight.remove(&index);
        if sent {
            self.sent.insert(index);
        }
    }

    pub(super) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    fn progress(&self, meta: &FileMetaData) -> TransferProgress {
        TransferProgress {
            transferred_bytes: ranges_byte_len(
                &merge_ranges(self.sent.iter().copied()),
                meta.file_size,
                meta.chunk_size,
            ),
            total_bytes: meta.file_size,
            chunks_done: self.sent.len() as u32,
            total_chunks: meta.chunk_count(),
        }
    }
}

fn lock(queue: &Mutex<SendQueue>) -> std::sync::MutexGuard<'_, SendQueue> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Batch = BoxFuture<'static, Result<(), TransferError>>;

async fn drive(batch: &mut Option<Batch>) -> Result<(), TransferError> {
    match batch {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

pub(super) async fn run(
    ctx: Arc<TransferCtx>,
    meta: FileMetaData,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut cache_events: broadcast::Receiver<CacheEvent>,
) -> Result<(), TransferError> {
    let total = meta.chunk_count();
    let queue = Arc::new(Mutex::new(SendQueue::default()));
    let mut inbound = attach_all(&ctx.channels);
    let mut live = LiveChannels::new(ctx.channels.len());
    let mut batch: Option<Batch> = None;
    let mut announce_complete = false;

    info!(event = "transfer_send_start", transfer = %ctx.id, file = %meta.id, chunks = total);
    ctx.send_control(&TransferMessage::Head(meta.clone())).await?;

    loop {
        if batch.is_none() {
            let next = lock(&queue).take_pending();
            if !next.is_empty() {
                debug!(event = "send_batch_start", transfer = %ctx.id, chunks = next.len());
                batch = Some(Box::pin(send_batch(ctx.clone(), queue.clone(), meta.clone(), next)));
            } else if announce_complete {
                // Everything requested is on the wire: tell the receiver so it
                // can check for gaps right away.
                wait_drained(&ctx.channels, BUFFER_POLL_INTERVAL, &ctx.sos).await?;
                ctx.send_control(&TransferMessage::Complete).await?;
                announce_complete = false;
            }
        }

        tokio::select! {
            _ = ctx.sos.wait() => return Err(TransferError::Cancelled),
            done = drive(&mut batch) => {
                batch = None;
                done?;
                announce_complete = lock(&queue).is_idle();
            }
            Some(command) = commands.recv() => match command {
                Command::SendRanges(ranges) => {
                    let added = lock(&queue).enqueue(parse_ranges(&ranges), total);
                    debug!(event = "send_ranges", transfer = %ctx.id, added);
                }
            },
            incoming = inbound.recv() => {
                let Some((index, event)) = incoming else {
                    return Err(TransferError::NoChannels);
                };
                match event {
                    ChannelEvent::Message(ChannelFrame::Text(text)) => {
                        match serde_json::from_str::<TransferMessage>(&text) {
                            Ok(TransferMessage::RequestHead) => {
                                ctx.send_control(&TransferMessage::Head(meta.clone())).await?;
                            }
                            Ok(TransferMessage::RequestContent { ranges }) => {
                                let added = lock(&queue).enqueue(parse_ranges(&ranges), total);
                                info!(
                                    event = "request_content",
                                    transfer = %ctx.id,
                                    ranges = ranges.len(),
                                    added
                                );
                            }
                            Ok(TransferMessage::Complete) => {
                                info!(event = "transfer_send_complete", transfer = %ctx.id);
                                return Ok(());
                            }
                            Ok(other) => debug!(event = "transfer_message_ignored", kind = other.kind()),
                            Err(e) => warn!(event = "transfer_message_decode_failure", error = %e),
                        }
                    }
                    ChannelEvent::Message(ChannelFrame::Binary(_)) => {
                        debug!(event = "unexpected_block", transfer = %ctx.id);
                    }
                    ChannelEvent::Closed => {
                        if live.close(index) == 0 {
                            return Err(TransferError::NoChannels);
                        }
                    }
                    ChannelEvent::Error(e) => warn!(event = "transfer_channel_error", transfer = %ctx.id, error = %e),
                }
            }
            cache_event = cache_events.recv() => match cache_event {
                Ok(CacheEvent::Cleanup) => return Err(TransferError::CacheDestroyed),
                Err(broadcast::error::RecvError::Closed) => return Err(TransferError::CacheDestroyed),
                _ => {}
            },
        }
    }
}

async fn send_batch(
    ctx: Arc<TransferCtx>,
    queue: Arc<Mutex<SendQueue>>,
    meta: FileMetaData,
    indices: Vec<u32>,
) -> Result<(), TransferError> {
    let (tx, mut rx) = mpsc::channel::<(u32, PendingReply)>(ctx.config.compress_ahead.max(1));

    let producer = {
        let ctx = ctx.clone();
        let queue = queue.clone();
        async move {
            for index in indices {
                let Some(raw) = ctx
                    .cache
                    .get_chunk(index)
                    .await
                    .map_err(TransferError::at_chunk(index))?
                else {
                    warn!(event = "chunk_missing", transfer = %ctx.id, chunk = index);
                    ctx.report_chunk(index, "chunk is not held");
                    lock(&queue).finish(index, false);
                    continue;
                };
                let reply = ctx.worker.submit(CodecRequest::Compress {
                    data: raw,
                    level: ctx.config.compression_level,
                });
                if tx.send((index, reply)).await.is_err() {
                    break;
                }
            }
            Ok::<(), TransferError>(())
        }
    };

    let consumer = async {
        while let Some((index, reply)) = rx.recv().await {
            let packed = match reply.data().await {
                Ok(packed) => packed,
                Err(e) => {
                    // Dropped; the receiver's resume check asks again.
                    error!(event = "compress_failure", transfer = %ctx.id, chunk = index, error = %e);
                    ctx.report_chunk(index, e.to_string());
                    lock(&queue).finish(index, false);
                    continue;
                }
            };
            for block in split_chunk(index, packed, ctx.config.block_size) {
                ctx.send_on_any(ChannelFrame::Binary(block.encode())).await?;
            }
            let progress = {
                let mut queue = lock(&queue);
                queue.finish(index, true);
                queue.progress(&meta)
            };
            ctx.set_progress(progress);
        }
        Ok::<(), TransferError>(())
    };

    let (produced, consumed) = tokio::join!(producer, consumer);
    consumed?;
    produced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::meta::tests::sample;

    #[test]
    fn overlapping_requests_are_coalesced() {
        let mut q = SendQueue::default();
        assert_eq!(q.enqueue(0..4, 10), 4);
        assert_eq!(q.enqueue([2, 3, 4, 4, 42], 10), 1);
        assert_eq!(q.take_pending(), vec![0, 1, 2, 3, 4]);

        // In flight: not queued again.
        assert_eq!(q.enqueue(0..5, 10), 0);
        q.finish(0, true);
        q.finish(1, false);
        assert!(!q.is_idle());

        // Once finished a chunk may be requested again.
        assert_eq!(q.enqueue([0, 1], 10), 2);
        assert_eq!(q.take_pending(), vec![0, 1]);
    }

    #[test]
    fn progress_counts_sent_bytes_with_short_tail() {
        let meta = sample(1_500_000, 512 * 1024);
        let mut q = SendQueue::default();
        q.enqueue(0..3, 3);
        q.take_pending();
        q.finish(0, true);
        q.finish(2, true);
        let p = q.progress(&meta);
        assert_eq!(p.transferred_bytes, 512 * 1024 + 451_424);
        assert_eq!(p.chunks_done, 2);
        assert_eq!(p.total_chunks, 3);
    }
}
