//! Receive side of a transfer.
//!
//! Blocks are reassembled per chunk, decompressed on the codec worker and
//! stored in the cache. Missing chunks are recovered by a periodic resume
//! check: it re-requests whatever the cache still lacks, but only when the
//! stream has stalled (no block since the previous tick) or nothing was
//! requested yet.

use super::flow::wait_drained;
use super::messages::TransferMessage;
use super::{LiveChannels, TransferCtx, TransferError, TransferEvent, TransferProgress, attach_all};
use crate::core::cache::{CacheError, CacheEvent};
use crate::core::codec::{BlockCache, BlockPacket, CodecError};
use crate::core::config::BUFFER_POLL_INTERVAL;
use crate::core::connection::{ChannelEvent, ChannelFrame};
use crate::core::meta::FileMetaData;
use crate::core::range::{count_indices, merge_ranges, parse_ranges, ranges_byte_len};
use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

type Decoding = BoxFuture<'static, (u32, Result<Bytes, CodecError>)>;

#[derive(Default)]
struct ReceiveState {
    meta: Option<FileMetaData>,
    held: BTreeSet<u32>,
    decoding: HashSet<u32>,
    blocks: BlockCache,
    requested: bool,
    /// A block arrived since the last resume tick.
    active: bool,
}

impl ReceiveState {
    fn is_done(&self) -> bool {
        self.meta
            .as_ref()
            .is_some_and(|m| self.held.len() as u64 >= m.chunk_count() as u64)
    }

    fn progress(&self) -> TransferProgress {
        let Some(meta) = &self.meta else {
            return TransferProgress::default();
        };
        TransferProgress {
            transferred_bytes: ranges_byte_len(
                &merge_ranges(self.held.iter().copied()),
                meta.file_size,
                meta.chunk_size,
            ),
            total_bytes: meta.file_size,
            chunks_done: self.held.len() as u32,
            total_chunks: meta.chunk_count(),
        }
    }

    /// Take on metadata, from the cache record or a `head`. Returns false
    /// when it was already known.
    async fn adopt(&mut self, ctx: &TransferCtx, meta: FileMetaData) -> Result<bool, TransferError> {
        if let Some(known) = &self.meta {
            if known.file_size != meta.file_size || known.chunk_size != meta.chunk_size {
                return Err(CacheError::MetaMismatch.into());
            }
            return Ok(false);
        }
        ctx.cache.set_info(meta.clone()).await?;
        self.held = ctx.cache.get_cached_keys().await?.into_iter().collect();
        info!(
            event = "transfer_head",
            transfer = %ctx.id,
            file = %meta.id,
            name = %meta.file_name,
            size = meta.file_size,
            held = self.held.len()
        );
        self.meta = Some(meta.clone());
        self.requested = false;
        ctx.emit(TransferEvent::Head(meta));
        ctx.set_progress(self.progress());
        Ok(true)
    }

    /// Returns a completed, still-compressed chunk and its raw length.
    fn on_block(&mut self, ctx: &TransferCtx, frame: Bytes) -> Option<(u32, Bytes, usize)> {
        let packet = match BlockPacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(event = "block_decode_failure", transfer = %ctx.id, error = %e);
                return None;
            }
        };
        let Some(meta) = &self.meta else {
            debug!(event = "block_before_head", transfer = %ctx.id);
            return None;
        };
        let index = packet.chunk_index;
        if index >= meta.chunk_count() {
            warn!(event = "block_out_of_range", transfer = %ctx.id, chunk = index);
            return None;
        }
        self.active = true;
        if self.held.contains(&index) || self.decoding.contains(&index) {
            return None;
        }
        let expected = meta.chunk_len(index);
        let (_, packed) = match self.blocks.insert(packet) {
            Ok(done) => done?,
            Err(e) => {
                warn!(event = "block_rejected", transfer = %ctx.id, chunk = index, error = %e);
                self.blocks.discard(index);
                ctx.report_chunk(index, e.to_string());
                return None;
            }
        };
        self.decoding.insert(index);
        Some((index, packed, expected))
    }

    async fn on_decoded(
        &mut self,
        ctx: &TransferCtx,
        index: u32,
        result: Result<Bytes, CodecError>,
    ) -> Result<(), TransferError> {
        self.decoding.remove(&index);
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                error!(event = "decompress_failure", transfer = %ctx.id, chunk = index, error = %e);
                ctx.report_chunk(index, e.to_string());
                return Ok(());
            }
        };
        match ctx.cache.store_chunk(index, raw).await {
            Ok(()) => {}
            Err(e @ (CacheError::ChunkLength { .. } | CacheError::OutOfRange { .. } | CacheError::Merging)) => {
                warn!(event = "chunk_rejected", transfer = %ctx.id, chunk = index, error = %e);
                ctx.report_chunk(index, e.to_string());
                return Ok(());
            }
            Err(e) => return Err(TransferError::at_chunk(index)(e)),
        }
        if self.held.insert(index) {
            ctx.set_progress(self.progress());
        }
        Ok(())
    }

    /// Ask for the head, or for whatever is still missing.
    async fn resume_check(&mut self, ctx: &TransferCtx, force: bool) -> Result<(), TransferError> {
        if self.meta.is_none() {
            debug!(event = "request_head", transfer = %ctx.id);
            return ctx.send_control(&TransferMessage::RequestHead).await;
        }
        if self.is_done() {
            return Ok(());
        }
        let stalled = !std::mem::take(&mut self.active);
        if !force && self.requested && !stalled {
            return Ok(());
        }

        let mut ranges = ctx.cache.get_req_ranges().await?;
        if !self.decoding.is_empty() {
            ranges = merge_ranges(
                parse_ranges(&ranges)
                    .into_iter()
                    .filter(|i| !self.decoding.contains(i)),
            );
        }
        if ranges.is_empty() {
            return Ok(());
        }
        info!(
            event = "request_content",
            transfer = %ctx.id,
            chunks = count_indices(&ranges),
            retry = self.requested
        );
        ctx.send_control(&TransferMessage::RequestContent { ranges }).await?;
        self.requested = true;
        Ok(())
    }
}

pub(super) async fn run(
    ctx: Arc<TransferCtx>,
    mut cache_events: broadcast::Receiver<CacheEvent>,
) -> Result<(), TransferError> {
    let mut inbound = attach_all(&ctx.channels);
    let mut live = LiveChannels::new(ctx.channels.len());
    let mut state = ReceiveState::default();
    let mut decoding: FuturesUnordered<Decoding> = FuturesUnordered::new();

    info!(event = "transfer_receive_start", transfer = %ctx.id, file = %ctx.cache.id());
    if let Some(meta) = ctx.cache.info().await {
        state.adopt(&ctx, meta).await?;
    }

    // The first tick fires immediately and makes the initial request.
    let mut ticker = tokio::time::interval(ctx.config.resume_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if state.is_done() {
            ctx.cache.flush().await?;
            wait_drained(&ctx.channels, BUFFER_POLL_INTERVAL, &ctx.sos).await?;
            ctx.send_control(&TransferMessage::Complete).await?;
            wait_drained(&ctx.channels, BUFFER_POLL_INTERVAL, &ctx.sos).await?;
            info!(event = "transfer_receive_complete", transfer = %ctx.id);
            return Ok(());
        }

        tokio::select! {
            _ = ctx.sos.wait() => return Err(TransferError::Cancelled),
            _ = ticker.tick() => state.resume_check(&ctx, false).await?,
            Some((index, result)) = decoding.next(), if !decoding.is_empty() => {
                state.on_decoded(&ctx, index, result).await?;
            }
            incoming = inbound.recv() => {
                let Some((channel, event)) = incoming else {
                    return Err(TransferError::NoChannels);
                };
                match event {
                    ChannelEvent::Message(ChannelFrame::Binary(frame)) => {
                        if let Some((index, packed, limit)) = state.on_block(&ctx, frame) {
                            let worker = ctx.worker.clone();
                            decoding.push(Box::pin(async move {
                                (index, worker.decompress(packed, limit).await)
                            }));
                        }
                    }
                    ChannelEvent::Message(ChannelFrame::Text(text)) => {
                        match serde_json::from_str::<TransferMessage>(&text) {
                            Ok(TransferMessage::Head(meta)) => {
                                if state.adopt(&ctx, meta).await? {
                                    state.resume_check(&ctx, false).await?;
                                }
                            }
                            Ok(TransferMessage::Complete) => {
                                // Sender has nothing more queued; ask for gaps now.
                                state.resume_check(&ctx, true).await?;
                            }
                            Ok(other) => debug!(event = "transfer_message_ignored", kind = other.kind()),
                            Err(e) => warn!(event = "transfer_message_decode_failure", error = %e),
                        }
                    }
                    ChannelEvent::Closed => {
                        if live.close(channel) == 0 {
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
