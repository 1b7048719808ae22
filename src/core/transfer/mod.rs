//! File Transferer: moves one cached file over a set of transfer channels.
//!
//! ```text
//!  sender                                        receiver
//!  ──────                                        ────────
//!  head ───────────────────────────────────────►  set_info
//!                    ◄──────────────────────────  request-content [ranges]
//!  compress ─► blocks ─► least-buffered channel ►  reassemble ─► decompress ─► store
//!  complete ───────────────────────────────────►  resume check
//!                    ◄──────────────────────────  complete (all chunks held)
//! ```
//!
//! Control messages are JSON text frames on the same channels as the binary
//! blocks. Either side may be cancelled at any time via
//! [`FileTransferer::cancel`]; tearing down the cache record aborts both.

pub mod flow;
pub mod messages;
mod receiver;
mod sender;

use crate::core::cache::{CacheError, ChunkCache};
use crate::core::codec::{CodecError, CodecWorker};
use crate::core::config::{BUFFER_POLL_INTERVAL, EVENT_CHANNEL_CAPACITY, TransferConfig};
use crate::core::connection::{Channel, ChannelError, ChannelEvent, ChannelFrame};
use crate::core::meta::FileMetaData;
use crate::core::range::ChunkRange;
use crate::utils::sos::SignalOfStop;
use flow::acquire_channel;
use messages::TransferMessage;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,
    #[error("no open transfer channel left")]
    NoChannels,
    #[error("cache record was cleaned up")]
    CacheDestroyed,
    #[error("channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Protocol(String),
    #[error("transfer failed: {0}")]
    Failed(String),
    #[error("chunk {chunk}: {source}")]
    AtChunk {
        chunk: u32,
        source: Box<TransferError>,
    },
}

impl TransferError {
    /// Tag an error with the chunk it happened on.
    pub(crate) fn at_chunk<E: Into<TransferError>>(chunk: u32) -> impl FnOnce(E) -> TransferError {
        move |e| TransferError::AtChunk {
            chunk,
            source: Box::new(e.into()),
        }
    }

    /// Chunk the failure is attributed to, if any.
    pub fn chunk(&self) -> Option<u32> {
        match self {
            TransferError::AtChunk { chunk, .. } => Some(*chunk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl TransferStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TransferStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub chunks_done: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The receiver learned the file's metadata.
    Head(FileMetaData),
    Progress(TransferProgress),
    Complete,
    Error {
        file_id: String,
        chunk: Option<u32>,
        message: String,
    },
    Cancelled,
}

pub(crate) enum Command {
    SendRanges(Vec<ChunkRange>),
}

/// State shared by the run loop and its helpers.
pub(crate) struct TransferCtx {
    pub id: String,
    pub cache: ChunkCache,
    pub channels: Vec<Channel>,
    pub worker: CodecWorker,
    pub config: TransferConfig,
    pub sos: SignalOfStop,
    events: broadcast::Sender<TransferEvent>,
    progress: watch::Sender<TransferProgress>,
}

impl TransferCtx {
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    /// Report a failure on one chunk that the transfer survives.
    pub fn report_chunk(&self, chunk: u32, message: impl Into<String>) {
        self.emit(TransferEvent::Error {
            file_id: self.cache.id().to_string(),
            chunk: Some(chunk),
            message: message.into(),
        });
    }

    pub fn set_progress(&self, progress: TransferProgress) {
        self.progress.send_replace(progress);
        self.emit(TransferEvent::Progress(progress));
    }

    /// Send one frame on the least-buffered channel, moving on to another
    /// channel if the chosen one closes underneath.
    pub async fn send_on_any(&self, frame: ChannelFrame) -> Result<(), TransferError> {
        loop {
            let channel = acquire_channel(&self.channels, BUFFER_POLL_INTERVAL, &self.sos).await?;
            match channel.send(frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if !channel.is_open() => {
                    warn!(event = "channel_lost_mid_send", transfer = %self.id, channel = channel.label(), error = %e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn send_control(&self, message: &TransferMessage) -> Result<(), TransferError> {
        debug!(event = "transfer_control_out", transfer = %self.id, kind = message.kind());
        let text = serde_json::to_string(message).map_err(ChannelError::from)?;
        self.send_on_any(ChannelFrame::Text(text)).await
    }
}

/// Fan every channel's events into one queue, tagged by channel position.
pub(crate) fn attach_all(channels: &[Channel]) -> mpsc::UnboundedReceiver<(usize, ChannelEvent)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for (position, channel) in channels.iter().enumerate() {
        let mut events = channel.attach();
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((position, event)).is_err() {
                    break;
                }
            }
        });
    }
    rx
}

/// Counts channels that have not reported `Closed` yet.
pub(crate) struct LiveChannels {
    total: usize,
    closed: HashSet<usize>,
}

impl LiveChannels {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            closed: HashSet::new(),
        }
    }

    /// Returns how many remain open.
    pub fn close(&mut self, position: usize) -> usize {
        self.closed.insert(position);
        self.total.saturating_sub(self.closed.len())
    }
}

/// Handle to one running transfer.
pub struct FileTransferer {
    id: String,
    file_id: String,
    direction: Direction,
    sos: SignalOfStop,
    events: broadcast::Sender<TransferEvent>,
    status: watch::Receiver<TransferStatus>,
    progress: watch::Receiver<TransferProgress>,
    commands: mpsc::UnboundedSender<Command>,
}

impl FileTransferer {
    /// Start serving `cache` to the peer. The record must hold metadata.
    pub async fn send(
        id: impl Into<String>,
        cache: ChunkCache,
        channels: Vec<Channel>,
        worker: CodecWorker,
        config: TransferConfig,
    ) -> Result<Self, TransferError> {
        let meta = cache.info().await.ok_or(CacheError::MissingInfo)?;
        Ok(Self::start(Some(meta), id.into(), cache, channels, worker, config))
    }

    /// Start filling `cache` from the peer. Metadata is taken from the record
    /// when present, otherwise requested with `request-head`.
    pub fn receive(
        id: impl Into<String>,
        cache: ChunkCache,
        channels: Vec<Channel>,
        worker: CodecWorker,
        config: TransferConfig,
    ) -> Self {
        Self::start(None, id.into(), cache, channels, worker, config)
    }

    /// Spawn the run loop; `outgoing` carries the metadata being served.
    fn start(
        outgoing: Option<FileMetaData>,
        id: String,
        cache: ChunkCache,
        channels: Vec<Channel>,
        worker: CodecWorker,
        config: TransferConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status) = watch::channel(TransferStatus::Running);
        let (progress_tx, progress) = watch::channel(TransferProgress::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let sos = SignalOfStop::new();
        let file_id = cache.id().to_string();
        let direction = match outgoing {
            Some(_) => Direction::Send,
            None => Direction::Receive,
        };
        // Subscribed before spawning so an early cleanup is not missed.
        let cache_events = cache.subscribe();

        let ctx = Arc::new(TransferCtx {
            id: id.clone(),
            cache,
            channels,
            worker,
            config,
            sos: sos.clone(),
            events: events.clone(),
            progress: progress_tx,
        });

        tokio::spawn(async move {
            let result = match outgoing {
                Some(meta) => sender::run(ctx.clone(), meta, commands_rx, cache_events).await,
                None => receiver::run(ctx.clone(), cache_events).await,
            };
            for channel in &ctx.channels {
                channel.detach();
            }
            let status = match result {
                Ok(()) => {
                    ctx.emit(TransferEvent::Complete);
                    TransferStatus::Completed
                }
                Err(TransferError::Cancelled) => {
                    info!(event = "transfer_cancelled", transfer = %ctx.id);
                    ctx.emit(TransferEvent::Cancelled);
                    TransferStatus::Cancelled
                }
                Err(e) => {
                    error!(event = "transfer_failed", transfer = %ctx.id, ?direction, error = %e);
                    ctx.emit(TransferEvent::Error {
                        file_id: ctx.cache.id().to_string(),
                        chunk: e.chunk(),
                        message: e.to_string(),
                    });
                    TransferStatus::Failed(e.to_string())
                }
            };
            // Nothing else may run once the loop is over.
            ctx.sos.cancel();
            status_tx.send_replace(status);
        });

        Self {
            id,
            file_id,
            direction,
            sos,
            events,
            status,
            progress,
            commands,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> TransferStatus {
        self.status.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<TransferStatus> {
        self.status.clone()
    }

    pub fn progress(&self) -> TransferProgress {
        *self.progress.borrow()
    }

    pub fn progress_watch(&self) -> watch::Receiver<TransferProgress> {
        self.progress.clone()
    }

    /// Push chunks without waiting for a request. Sender only.
    pub fn send_ranges(&self, ranges: Vec<ChunkRange>) -> Result<(), TransferError> {
        if self.direction != Direction::Send {
            return Err(TransferError::Protocol("send_ranges on a receiving transfer".into()));
        }
        self.commands
            .send(Command::SendRanges(ranges))
            .map_err(|_| TransferError::Failed("transfer is no longer running".into()))
    }

    /// Stop the transfer. Safe to call any number of times.
    pub fn cancel(&self) {
        if self.sos.cancel() {
            debug!(event = "transfer_cancel_requested", transfer = %self.id);
        }
    }

    /// Wait for the transfer to finish.
    pub async fn wait(&self) -> Result<(), TransferError> {
        let mut status = self.status.clone();
        let finished = status
            .wait_for(TransferStatus::is_finished)
            .await
            .map(|s| s.clone())
            .map_err(|_| TransferError::Failed("transfer task vanished".into()))?;
        match finished {
            TransferStatus::Completed => Ok(()),
            TransferStatus::Cancelled => Err(TransferError::Cancelled),
            TransferStatus::Failed(message) => Err(TransferError::Failed(message)),
            TransferStatus::Running => Err(TransferError::Failed("transfer still running".into())),
        }
    }
}
