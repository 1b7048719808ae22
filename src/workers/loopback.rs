//! `peerdrop loopback`: two in-process peers exchange a file over real
//! WebRTC, using loopback ICE candidates and an in-process signaling hub.
//!
//! ```text
//!   alice (sender, impolite)                     bob (receiver, polite)
//!   ────────────────────────                     ──────────────────────
//!   connect ◄──────────── offer/answer/ICE ────────────► connect
//!   open <transfer>-0..n ────────────────────────────►   ChannelOpened
//!   "offer-file" on the message channel ─────────────►   open cache, receive
//!   FileTransferer::send  ◄═══════ blocks ══════════►   FileTransferer::receive
//!                                                        merge, export
//! ```

use super::cache::cache_root;
use anyhow::{Context, anyhow, bail};
use peerdrop::core::cache::ChunkCache;
use peerdrop::core::codec::CodecWorker;
use peerdrop::core::config::{SessionConfig, Settings};
use peerdrop::core::connection::{
    Channel, LocalSignalingHub, PeerIdentity, PeerSession, SessionEvent,
};
use peerdrop::core::meta::FileMetaData;
use peerdrop::core::registry::Registry;
use peerdrop::core::transfer::{FileTransferer, TransferProgress};
use peerdrop::utils::sos::SignalOfStop;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Application messages exchanged on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppMessage {
    #[serde(rename_all = "camelCase")]
    OfferFile {
        transfer_id: String,
        file_id: String,
        file_name: String,
        file_size: u64,
        channels: usize,
    },
}

const CHANNEL_POLL: Duration = Duration::from_millis(100);

/// One in-process peer: its session and the transfers it runs.
struct LocalPeer {
    session: PeerSession,
    transfers: Registry<String, FileTransferer>,
}

pub struct LoopbackJob {
    pub file: PathBuf,
    pub out: PathBuf,
}

/// Run the whole exchange and return the exported copy's path.
pub async fn run(
    job: LoopbackJob,
    settings: &Settings,
    data_dir: &Path,
    sos: SignalOfStop,
) -> anyhow::Result<PathBuf> {
    let threads = std::thread::available_parallelism().map_or(2, |n| n.get().min(4));
    let worker = CodecWorker::spawn("peerdrop-codec", threads).context("failed to start codec worker")?;
    let peers: Registry<String, LocalPeer> = Registry::new();

    let session_config = SessionConfig {
        ice_servers: Vec::new(),
        include_loopback: true,
        ..settings.session.clone()
    };
    let hub = LocalSignalingHub::new();
    let now = epoch_millis();
    let alice_id = PeerIdentity::new("alice", now);
    let bob_id = PeerIdentity::new("bob", now + 1);
    let low = settings.transfer.low_water_mark;

    let alice = PeerSession::new(
        alice_id.clone(),
        bob_id.clone(),
        Arc::new(hub.endpoint(&alice_id.id)),
        session_config.clone(),
        low,
    )
    .await
    .context("failed to create alice's session")?;
    let bob = PeerSession::new(
        bob_id.clone(),
        alice_id.clone(),
        Arc::new(hub.endpoint(&bob_id.id)),
        session_config,
        low,
    )
    .await
    .context("failed to create bob's session")?;
    for session in [&alice, &bob] {
        peers.insert(
            session.local().id.clone(),
            Arc::new(LocalPeer {
                session: session.clone(),
                transfers: Registry::new(),
            }),
        );
    }

    let result = sos
        .select(exchange(&peers, &alice, &bob, &job, settings, data_dir, worker))
        .await
        .unwrap_or_else(|| Err(anyhow!("interrupted")));

    for (id, peer) in peers.drain() {
        for (transfer_id, transfer) in peer.transfers.drain() {
            debug!(event = "transfer_dropped", peer = %id, transfer = %transfer_id);
            transfer.cancel();
        }
        peer.session.disconnect().await;
    }
    result
}

async fn exchange(
    peers: &Registry<String, LocalPeer>,
    alice: &PeerSession,
    bob: &PeerSession,
    job: &LoopbackJob,
    settings: &Settings,
    data_dir: &Path,
    worker: CodecWorker,
) -> anyhow::Result<PathBuf> {
    let mut bob_events = bob.subscribe();
    alice.listen()?;
    bob.listen()?;
    tokio::try_join!(alice.connect(), bob.connect()).context("peers failed to connect")?;
    info!(event = "loopback_connected");

    // Alice records the file as a complete outgoing record.
    let meta = FileMetaData::from_path(&job.file, settings.transfer.chunk_size)
        .await
        .with_context(|| format!("cannot read {}", job.file.display()))?;
    let outgoing = ChunkCache::open(&data_dir.join("outgoing"), &meta.id, worker.clone(), &settings.cache)
        .await
        .context("failed to open outgoing record")?;
    outgoing
        .author(meta.clone(), job.file.clone())
        .await
        .context("failed to record outgoing file")?;

    let transfer_id = uuid::Uuid::new_v4().simple().to_string();
    let count = settings.transfer.channel_count.max(1);
    let channels = alice
        .create_transfer_channels(&transfer_id, count)
        .await
        .context("failed to open transfer channels")?;
    alice
        .send_message(&AppMessage::OfferFile {
            transfer_id: transfer_id.clone(),
            file_id: meta.id.clone(),
            file_name: meta.file_name.clone(),
            file_size: meta.file_size,
            channels: count,
        })
        .await
        .context("failed to offer file")?;

    let sender = Arc::new(
        FileTransferer::send(&transfer_id, outgoing, channels, worker.clone(), settings.transfer.clone()).await?,
    );
    register(peers, alice, &transfer_id, sender.clone());

    // Bob accepts whatever alice offers.
    let open_timeout = settings.session.channel_open_timeout();
    let (offered_id, file_id, expected) = tokio::time::timeout(open_timeout, wait_offer(&mut bob_events))
        .await
        .context("no file offer arrived")??;
    let incoming_channels = wait_channels(bob, &mut bob_events, &offered_id, expected, open_timeout).await?;
    let incoming = ChunkCache::open(&cache_root(settings, data_dir), &file_id, worker.clone(), &settings.cache)
        .await
        .context("failed to open incoming record")?;
    let receiver = Arc::new(FileTransferer::receive(
        &offered_id,
        incoming.clone(),
        incoming_channels,
        worker,
        settings.transfer.clone(),
    ));
    register(peers, bob, &offered_id, receiver.clone());

    let reporter = tokio::spawn(report_progress(receiver.progress_watch()));
    let outcome = tokio::try_join!(receiver.wait(), sender.wait());
    reporter.abort();
    outcome.context("transfer failed")?;

    let merged = incoming
        .merge_file()
        .await
        .context("failed to assemble received file")?
        .context("received file is already being assembled")?;
    debug!(event = "loopback_merged", path = %merged.display());
    let exported = incoming
        .export(&job.out)
        .await
        .with_context(|| format!("failed to export into {}", job.out.display()))?;
    info!(event = "loopback_done", file = %meta.file_name, size = meta.file_size, dest = %exported.display());
    Ok(exported)
}

fn register(peers: &Registry<String, LocalPeer>, session: &PeerSession, transfer_id: &str, transfer: Arc<FileTransferer>) {
    if let Some(peer) = peers.get(&session.local().id) {
        peer.transfers.insert(transfer_id.to_string(), transfer);
    }
}

async fn wait_offer(events: &mut broadcast::Receiver<SessionEvent>) -> anyhow::Result<(String, String, usize)> {
    loop {
        match next_event(events).await? {
            SessionEvent::Message(value) => match serde_json::from_value::<AppMessage>(value) {
                Ok(AppMessage::OfferFile {
                    transfer_id,
                    file_id,
                    file_name,
                    file_size,
                    channels,
                }) => {
                    info!(event = "file_offered", transfer = %transfer_id, name = %file_name, size = file_size);
                    return Ok((transfer_id, file_id, channels));
                }
                Err(e) => warn!(event = "app_message_ignored", error = %e),
            },
            SessionEvent::Error(e) => warn!(event = "session_error", error = %e),
            _ => {}
        }
    }
}

async fn wait_channels(
    session: &PeerSession,
    events: &mut broadcast::Receiver<SessionEvent>,
    transfer_id: &str,
    expected: usize,
    timeout: Duration,
) -> anyhow::Result<Vec<Channel>> {
    let deadline = Instant::now() + timeout;
    loop {
        let found = session.transfer_channels(transfer_id);
        if found.len() >= expected && found.iter().all(Channel::is_open) {
            return Ok(found);
        }
        if Instant::now() >= deadline {
            bail!("{} of {expected} transfer channels opened in time", found.len());
        }
        // Opening is not always announced; look again at least every poll.
        if let Ok(event) = tokio::time::timeout(CHANNEL_POLL, next_event(events)).await {
            event?;
        }
    }
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> anyhow::Result<SessionEvent> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::State(state)) if state.is_terminal() => {
                bail!("session ended ({state:?})")
            }
            Ok(event) => return Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(event = "session_events_lagged", skipped = n),
            Err(broadcast::error::RecvError::Closed) => bail!("session is gone"),
        }
    }
}

async fn report_progress(mut progress: tokio::sync::watch::Receiver<TransferProgress>) {
    let mut last_tenth = None;
    while progress.changed().await.is_ok() {
        let p = *progress.borrow_and_update();
        if p.total_bytes == 0 {
            continue;
        }
        let tenth = p.transferred_bytes * 10 / p.total_bytes;
        if last_tenth != Some(tenth) {
            last_tenth = Some(tenth);
            info!(
                event = "transfer_progress",
                percent = tenth * 10,
                chunks = p.chunks_done,
                total = p.total_chunks
            );
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_file_wire_shape() {
        let msg = AppMessage::OfferFile {
            transfer_id: "t1".into(),
            file_id: "f1".into(),
            file_name: "a.bin".into(),
            file_size: 3,
            channels: 2,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "offer-file", "transferId": "t1", "fileId": "f1", "fileName": "a.bin", "fileSize": 3, "channels": 2})
        );
        assert_eq!(serde_json::from_value::<AppMessage>(value).unwrap(), msg);
    }

    #[tokio::test]
    #[ignore = "opens real WebRTC connections on the loopback interface"]
    async fn loopback_round_trip() {
        let dir = std::env::temp_dir().join(format!("peerdrop-loopback-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("payload.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&file, &data).unwrap();

        let mut settings = Settings::default();
        settings.transfer.chunk_size = 64 * 1024;
        settings.transfer.channel_count = 2;
        let job = LoopbackJob {
            file,
            out: dir.join("received"),
        };
        let exported = run(job, &settings, &dir, SignalOfStop::new()).await.unwrap();
        assert_eq!(std::fs::read(exported).unwrap(), data);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
