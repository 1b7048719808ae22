//! Chunk Cache: durable, resumable per-file storage.
//!
//! One cache instance owns one record (see [`store`] for the layout). Chunk
//! writes land in a bounded in-memory buffer that is flushed in one batch
//! when full, and always before any read path (`get_chunk`,
//! `get_chunk_count`, `get_cached_keys`, `merge_file`) trusts the disk.
//!
//! Every mutation broadcasts a [`CacheEvent`]; the cache knows nothing about
//! who listens.

pub mod store;

use crate::core::codec::{CodecError, CodecWorker};
use crate::core::config::{CacheConfig, EVENT_CHANNEL_CAPACITY};
use crate::core::meta::{FileMetaData, MetaError};
use crate::core::range::{ChunkRange, count_indices, get_sub_ranges};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use store::CacheStore;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt info row: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("invalid file id {0:?}")]
    InvalidId(String),
    #[error("file metadata is not known yet")]
    MissingInfo,
    #[error("metadata does not match the cached record")]
    MetaMismatch,
    #[error("unusable metadata: {0}")]
    InvalidMeta(#[from] MetaError),
    #[error("record is being assembled")]
    Merging,
    #[error("chunk {index} out of range (total {total})")]
    OutOfRange { index: u32, total: u32 },
    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    ChunkLength {
        index: u32,
        expected: usize,
        actual: usize,
    },
    #[error("{missing} chunk(s) still missing")]
    Incomplete { missing: u64 },
    #[error("assembled size {actual} differs from file size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("record is not assembled")]
    NotAssembled,
    #[error("record was cleaned up")]
    Destroyed,
    #[error("merge: {0}")]
    Merge(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Pending,
    Merging,
    Done,
    Error,
}

/// Contents of the info partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    #[serde(flatten)]
    pub meta: FileMetaData,
    /// Assembled file; present only once complete.
    #[serde(default)]
    pub file: Option<PathBuf>,
    pub status: CacheStatus,
}

impl CacheInfo {
    fn pending(meta: FileMetaData) -> Self {
        Self {
            meta,
            file: None,
            status: CacheStatus::Pending,
        }
    }
}

/// Point-in-time view of a record, carried by update events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub id: String,
    pub meta: Option<FileMetaData>,
    pub status: CacheStatus,
    pub cached_chunks: u32,
    pub total_chunks: Option<u32>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Update(CacheSnapshot),
    Merging,
    Merged { path: PathBuf, size: u64 },
    Error(String),
    Cleanup,
}

#[derive(Debug, Default)]
struct CacheState {
    info: Option<CacheInfo>,
    /// Durable chunk rows.
    keys: BTreeSet<u32>,
    /// Not yet flushed.
    buffer: BTreeMap<u32, Bytes>,
    destroyed: bool,
}

impl CacheState {
    fn total(&self) -> Option<u32> {
        self.info.as_ref().map(|i| i.meta.chunk_count())
    }

    fn is_complete(&self) -> bool {
        matches!(&self.info, Some(i) if i.file.is_some() && i.status == CacheStatus::Done)
    }

    /// Distinct chunk indices held, durable or buffered.
    fn held(&self) -> u32 {
        let extra = self
            .buffer
            .keys()
            .filter(|k| !self.keys.contains(k))
            .count();
        (self.keys.len() + extra) as u32
    }

    fn is_transfer_complete(&self) -> bool {
        if self.is_complete() {
            return true;
        }
        match self.total() {
            Some(total) => self.held() >= total,
            None => false,
        }
    }

    fn ensure_live(&self) -> Result<(), CacheError> {
        if self.destroyed {
            Err(CacheError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn snapshot(&self, id: &str) -> CacheSnapshot {
        let total = self.total();
        CacheSnapshot {
            id: id.to_string(),
            meta: self.info.as_ref().map(|i| i.meta.clone()),
            status: self
                .info
                .as_ref()
                .map_or(CacheStatus::Pending, |i| i.status),
            cached_chunks: if self.is_complete() {
                total.unwrap_or_default()
            } else {
                self.held()
            },
            total_chunks: total,
            file: self.info.as_ref().and_then(|i| i.file.clone()),
        }
    }
}

struct CacheInner {
    id: String,
    store: CacheStore,
    worker: CodecWorker,
    buffer_capacity: usize,
    state: Mutex<CacheState>,
    events: broadcast::Sender<CacheEvent>,
    merging: AtomicBool,
}

impl CacheInner {
    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_update(&self, state: &CacheState) {
        self.emit(CacheEvent::Update(state.snapshot(&self.id)));
    }

    async fn persist(&self, state: &CacheState) -> Result<(), CacheError> {
        match &state.info {
            Some(info) => self.store.write_info(info).await,
            None => Ok(()),
        }
    }

    async fn flush_state(&self, state: &mut CacheState) -> Result<(), CacheError> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let batch: Vec<(u32, Bytes)> = std::mem::take(&mut state.buffer).into_iter().collect();
        if let Err(e) = self.store.write_chunks(&batch).await {
            error!(event = "cache_flush_failure", id = %self.id, chunks = batch.len(), error = %e);
            state.buffer.extend(batch);
            return Err(e);
        }
        state.keys.extend(batch.iter().map(|(i, _)| *i));
        debug!(event = "cache_flush", id = %self.id, chunks = batch.len());
        Ok(())
    }
}

/// Cloneable handle to one file's cache record.
#[derive(Clone)]
pub struct ChunkCache {
    inner: Arc<CacheInner>,
}

impl ChunkCache {
    /// Open (or lazily create) the record for `id` under `root`.
    pub async fn open(
        root: &Path,
        id: &str,
        worker: CodecWorker,
        config: &CacheConfig,
    ) -> Result<Self, CacheError> {
        let store = CacheStore::new(root, id)?;
        let mut info = store.read_info().await?;
        if let Some(i) = &info {
            i.meta.validate()?;
        }
        if let Some(i) = info.as_mut()
            && i.status == CacheStatus::Merging
        {
            // Interrupted merge; the chunk rows are still authoritative.
            warn!(event = "cache_merge_interrupted", id);
            i.status = CacheStatus::Pending;
            i.file = None;
        }
        let keys = store.chunk_keys().await?;
        debug!(event = "cache_open", id, chunks = keys.len(), has_info = info.is_some());

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(CacheInner {
                id: id.to_string(),
                store,
                worker,
                buffer_capacity: config.write_buffer_chunks.max(1),
                state: Mutex::new(CacheState {
                    info,
                    keys,
                    ..Default::default()
                }),
                events,
                merging: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        self.inner.state.lock().await.snapshot(&self.inner.id)
    }

    pub async fn info(&self) -> Option<FileMetaData> {
        let state = self.inner.state.lock().await;
        state.info.as_ref().map(|i| i.meta.clone())
    }

    /// Record metadata learned from a `head`. A record that already has
    /// metadata keeps it, provided the chunk geometry agrees.
    pub async fn set_info(&self, meta: FileMetaData) -> Result<(), CacheError> {
        if meta.id != self.inner.id {
            return Err(CacheError::MetaMismatch);
        }
        meta.validate()?;
        let mut state = self.inner.state.lock().await;
        state.ensure_live()?;
        if let Some(existing) = &state.info {
            if existing.meta.file_size == meta.file_size
                && existing.meta.chunk_size == meta.chunk_size
            {
                return Ok(());
            }
            warn!(event = "cache_meta_mismatch", id = %self.inner.id);
            return Err(CacheError::MetaMismatch);
        }
        state.info = Some(CacheInfo::pending(meta));
        self.inner.persist(&state).await?;
        self.inner.emit_update(&state);
        Ok(())
    }

    /// Record a local file as a complete, already-assembled record.
    pub async fn author(&self, meta: FileMetaData, path: PathBuf) -> Result<(), CacheError> {
        if meta.id != self.inner.id {
            return Err(CacheError::MetaMismatch);
        }
        meta.validate()?;
        let actual = tokio::fs::metadata(&path).await?.len();
        if actual != meta.file_size {
            return Err(CacheError::SizeMismatch {
                expected: meta.file_size,
                actual,
            });
        }
        let mut state = self.inner.state.lock().await;
        state.ensure_live()?;
        state.info = Some(CacheInfo {
            meta,
            file: Some(path),
            status: CacheStatus::Done,
        });
        self.inner.persist(&state).await?;
        self.inner.emit_update(&state);
        Ok(())
    }

    /// Buffer one raw chunk; flushes once the buffer reaches capacity.
    pub async fn store_chunk(&self, index: u32, data: Bytes) -> Result<(), CacheError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_live()?;
        let info = state.info.as_ref().ok_or(CacheError::MissingInfo)?;
        let total = info.meta.chunk_count();
        if index >= total {
            return Err(CacheError::OutOfRange { index, total });
        }
        let expected = info.meta.chunk_len(index);
        if data.len() != expected {
            return Err(CacheError::ChunkLength {
                index,
                expected,
                actual: data.len(),
            });
        }
        if state.is_complete() {
            return Ok(());
        }
        // Rows buffered now would outlive the merge's chunk cleanup.
        if self.inner.merging.load(Ordering::Acquire) {
            return Err(CacheError::Merging);
        }

        state.buffer.insert(index, data);
        if state.buffer.len() >= self.inner.buffer_capacity {
            self.inner.flush_state(&mut state).await?;
        }
        self.inner.emit_update(&state);
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), CacheError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_live()?;
        self.inner.flush_state(&mut state).await
    }

    /// Raw bytes of chunk `index`, or `None` if it is not held.
    ///
    /// An assembled record is sliced directly from its file.
    pub async fn get_chunk(&self, index: u32) -> Result<Option<Bytes>, CacheError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_live()?;
        let info = state.info.as_ref().ok_or(CacheError::MissingInfo)?;
        let total = info.meta.chunk_count();
        if index >= total {
            return Err(CacheError::OutOfRange { index, total });
        }
        if state.is_complete()
            && let Some(file) = &info.file
        {
            let bytes =
                store::read_slice(file, info.meta.chunk_offset(index), info.meta.chunk_len(index))
                    .await?;
            return Ok(Some(bytes));
        }
        self.inner.flush_state(&mut state).await?;
        self.inner.store.read_chunk(index).await
    }

    pub async fn get_chunk_count(&self) -> Result<u32, CacheError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_live()?;
        self.inner.flush_state(&mut state).await?;
        if state.is_complete() {
            return Ok(state.total().unwrap_or_default());
        }
        Ok(state.keys.len() as u32)
    }

    /// Sorted indices of every held chunk.
    pub async fn get_cached_keys(&self) -> Result<Vec<u32>, CacheError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_live()?;
        self.inner.flush_state(&mut state).await?;
        if state.is_complete() {
            return Ok((0..state.total().unwrap_or_default()).collect());
        }
        Ok(state.keys.iter().copied().collect())
    }

    /// Merged ranges the receiver still needs.
    pub async fn get_req_ranges(&self) -> Result<Vec<ChunkRange>, CacheError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_live()?;
        let total = state.total().ok_or(CacheError::MissingInfo)?;
        if state.is_complete() {
            return Ok(Vec::new());
        }
        self.inner.flush_state(&mut state).await?;
        Ok(get_sub_ranges(total, state.keys.iter().copied()))
    }

    /// True only once an assembled file exists.
    pub async fn is_complete(&self) -> bool {
        self.inner.state.lock().await.is_complete()
    }

    /// True once every chunk is held, merged or not.
    pub async fn is_transfer_complete(&self) -> bool {
        self.inner.state.lock().await.is_transfer_complete()
    }

    /// No info row and no chunk rows.
    pub async fn is_empty(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.info.is_none() && state.keys.is_empty() && state.buffer.is_empty()
    }

    /// Reassemble all chunks into one file on the codec worker.
    ///
    /// Returns `Ok(None)` without doing anything if a merge is already
    /// running. On success the chunk rows are dropped.
    pub async fn merge_file(&self) -> Result<Option<PathBuf>, CacheError> {
        if self.inner.merging.swap(true, Ordering::AcqRel) {
            debug!(event = "cache_merge_skipped", id = %self.inner.id);
            return Ok(None);
        }
        let result = self.merge_inner().await;
        self.inner.merging.store(false, Ordering::Release);
        result.map(Some)
    }

    async fn merge_inner(&self) -> Result<PathBuf, CacheError> {
        let (parts, dest, expected) = {
            let mut state = self.inner.state.lock().await;
            state.ensure_live()?;
            self.inner.flush_state(&mut state).await?;
            let info = state.info.as_ref().ok_or(CacheError::MissingInfo)?;
            if state.is_complete()
                && let Some(file) = &info.file
            {
                return Ok(file.clone());
            }
            let total = info.meta.chunk_count();
            let missing = count_indices(&get_sub_ranges(total, state.keys.iter().copied()));
            if missing > 0 {
                return Err(CacheError::Incomplete { missing });
            }
            let parts: Vec<PathBuf> = (0..total).map(|i| self.inner.store.chunk_path(i)).collect();
            let expected = info.meta.file_size;
            if let Some(i) = state.info.as_mut() {
                i.status = CacheStatus::Merging;
            }
            self.inner.persist(&state).await?;
            self.inner.emit_update(&state);
            (parts, self.inner.store.assembled_path(), expected)
        };

        self.inner.emit(CacheEvent::Merging);
        info!(event = "cache_merge_start", id = %self.inner.id, chunks = parts.len());

        let outcome = match self.inner.worker.merge(parts, dest.clone()).await {
            Ok(size) if size == expected => Ok(size),
            Ok(actual) => Err(CacheError::SizeMismatch { expected, actual }),
            Err(e) => Err(CacheError::from(e)),
        };

        let mut state = self.inner.state.lock().await;
        if state.destroyed {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(CacheError::Destroyed);
        }
        match outcome {
            Ok(size) => {
                if let Some(i) = state.info.as_mut() {
                    i.file = Some(dest.clone());
                    i.status = CacheStatus::Done;
                }
                self.inner.persist(&state).await?;
                if let Err(e) = self.inner.store.clear_chunks().await {
                    warn!(event = "cache_chunk_cleanup_failure", id = %self.inner.id, error = %e);
                }
                state.keys.clear();
                info!(event = "cache_merged", id = %self.inner.id, size);
                self.inner.emit(CacheEvent::Merged {
                    path: dest.clone(),
                    size,
                });
                self.inner.emit_update(&state);
                Ok(dest)
            }
            Err(e) => {
                error!(event = "cache_merge_failure", id = %self.inner.id, error = %e);
                let _ = tokio::fs::remove_file(&dest).await;
                if let Some(i) = state.info.as_mut() {
                    i.status = CacheStatus::Error;
                }
                if let Err(pe) = self.inner.persist(&state).await {
                    warn!(event = "cache_persist_failure", id = %self.inner.id, error = %pe);
                }
                self.inner.emit(CacheEvent::Error(e.to_string()));
                self.inner.emit_update(&state);
                Err(e)
            }
        }
    }

    /// Irreversibly delete the record. Calling it again is a no-op.
    pub async fn cleanup(&self) -> Result<(), CacheError> {
        let mut state = self.inner.state.lock().await;
        if state.destroyed {
            return Ok(());
        }
        state.destroyed = true;
        state.buffer.clear();
        state.keys.clear();
        state.info = None;
        self.inner.store.destroy().await?;
        info!(event = "cache_cleanup", id = %self.inner.id);
        self.inner.emit(CacheEvent::Cleanup);
        Ok(())
    }

    /// Copy the assembled file into `dest_dir` under its sanitised original
    /// name, never overwriting an existing file.
    pub async fn export(&self, dest_dir: &Path) -> Result<PathBuf, CacheError> {
        let (src, name) = {
            let state = self.inner.state.lock().await;
            state.ensure_live()?;
            match &state.info {
                Some(CacheInfo {
                    file: Some(file),
                    meta,
                    status: CacheStatus::Done,
                }) => (file.clone(), sanitize_file_name(&meta.file_name)),
                _ => return Err(CacheError::NotAssembled),
            }
        };
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = unique_path(dest_dir, &name).await;
        tokio::fs::copy(&src, &dest).await?;
        info!(event = "cache_export", id = %self.inner.id, dest = %dest.display());
        Ok(dest)
    }

    /// Snapshots of every record under `root`.
    pub async fn list(root: &Path) -> Result<Vec<CacheSnapshot>, CacheError> {
        let infos = store::list_infos(root).await?;
        let mut out = Vec::with_capacity(infos.len());
        for (id, info) in infos {
            let keys = CacheStore::new(root, &id)?.chunk_keys().await?;
            let state = CacheState {
                info: Some(info),
                keys,
                ..Default::default()
            };
            out.push(state.snapshot(&id));
        }
        Ok(out)
    }
}

/// Reduce an untrusted file name to one safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .replace('\\', "/")
        .split('/')
        .filter(|p| !p.is_empty() && !matches!(*p, "." | ".."))
        .next_back()
        .unwrap_or_default()
        .to_string();
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_start_matches('.').trim();
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe.to_string()
    }
}

async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let file = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(file);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::meta::tests::sample;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("peerdrop_test")
            .join("cache")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn cleanup(dir: &Path) {
        let _ = std::fs::remove_dir_all(dir);
    }

    fn chunk(meta: &FileMetaData, index: u32) -> Bytes {
        Bytes::from(vec![index as u8 + 1; meta.chunk_len(index)])
    }

    async fn open(root: &Path, capacity: usize) -> ChunkCache {
        let worker = CodecWorker::spawn("cache-test", 1).unwrap();
        let config = CacheConfig {
            root: None,
            write_buffer_chunks: capacity,
        };
        ChunkCache::open(root, "file-1", worker, &config).await.unwrap()
    }

    #[tokio::test]
    async fn missing_ranges_are_the_complement() {
        let root = test_dir("req_ranges");
        let cache = open(&root, 2).await;
        let meta = sample(4 * 100, 100);
        cache.set_info(meta.clone()).await.unwrap();

        for i in [0, 1, 3] {
            cache.store_chunk(i, chunk(&meta, i)).await.unwrap();
        }
        assert_eq!(cache.get_req_ranges().await.unwrap(), vec![ChunkRange::Single(2)]);
        assert_eq!(cache.get_cached_keys().await.unwrap(), vec![0, 1, 3]);
        assert!(!cache.is_transfer_complete().await);
        cleanup(&root);
    }

    #[tokio::test]
    async fn never_complete_before_merge() {
        let root = test_dir("merge");
        let cache = open(&root, 16).await;
        let meta = sample(1_500_000, 512 * 1024);
        cache.set_info(meta.clone()).await.unwrap();
        let mut events = cache.subscribe();

        for i in [0, 2] {
            cache.store_chunk(i, chunk(&meta, i)).await.unwrap();
        }
        assert_eq!(cache.get_req_ranges().await.unwrap(), vec![ChunkRange::Single(1)]);
        assert!(matches!(
            cache.merge_file().await,
            Err(CacheError::Incomplete { missing: 1 })
        ));

        cache.store_chunk(1, chunk(&meta, 1)).await.unwrap();
        assert!(cache.is_transfer_complete().await);
        assert!(!cache.is_complete().await);

        let path = cache.merge_file().await.unwrap().unwrap();
        assert!(cache.is_complete().await);
        let merged = std::fs::read(&path).unwrap();
        assert_eq!(merged.len(), 1_500_000);
        assert_eq!(merged[512 * 1024], 2);
        assert_eq!(merged[1_499_999], 3);

        // Rows are gone but reads slice the assembled file.
        assert_eq!(cache.get_chunk(2).await.unwrap().unwrap(), chunk(&meta, 2));
        assert_eq!(cache.get_cached_keys().await.unwrap(), vec![0, 1, 2]);

        let mut saw_merging = false;
        let mut saw_merged = false;
        while let Ok(ev) = events.try_recv() {
            match ev {
                CacheEvent::Merging => saw_merging = true,
                CacheEvent::Merged { size, .. } => saw_merged = size == 1_500_000,
                _ => {}
            }
        }
        assert!(saw_merging && saw_merged);
        cleanup(&root);
    }

    #[tokio::test]
    async fn buffered_chunks_survive_reopen_after_flush() {
        let root = test_dir("reopen");
        let meta = sample(10 * 8, 8);
        {
            let cache = open(&root, 4).await;
            cache.set_info(meta.clone()).await.unwrap();
            for i in 0..5 {
                cache.store_chunk(i, chunk(&meta, i)).await.unwrap();
            }
            // Four were flushed by capacity, the fifth is still buffered.
            cache.flush().await.unwrap();
        }
        let cache = open(&root, 4).await;
        assert_eq!(cache.info().await, Some(meta.clone()));
        assert_eq!(cache.get_chunk_count().await.unwrap(), 5);
        assert_eq!(cache.get_req_ranges().await.unwrap(), vec![ChunkRange::Span(5, 9)]);
        assert_eq!(cache.get_chunk(4).await.unwrap().unwrap(), chunk(&meta, 4));
        assert!(cache.get_chunk(7).await.unwrap().is_none());
        cleanup(&root);
    }

    #[tokio::test]
    async fn empty_means_no_info_and_no_chunks() {
        let root = test_dir("empty");
        let cache = open(&root, 4).await;
        assert!(cache.is_empty().await);
        assert!(matches!(cache.get_req_ranges().await, Err(CacheError::MissingInfo)));

        cache.set_info(sample(16, 8)).await.unwrap();
        assert!(!cache.is_empty().await);
        cleanup(&root);
    }

    #[tokio::test]
    async fn rejects_bad_chunks_and_conflicting_meta() {
        let root = test_dir("reject");
        let cache = open(&root, 4).await;
        let meta = sample(20, 8);
        assert!(matches!(
            cache.store_chunk(0, chunk(&meta, 0)).await,
            Err(CacheError::MissingInfo)
        ));
        cache.set_info(meta.clone()).await.unwrap();
        cache.set_info(meta.clone()).await.unwrap();

        assert!(matches!(
            cache.store_chunk(3, Bytes::new()).await,
            Err(CacheError::OutOfRange { index: 3, total: 3 })
        ));
        assert!(matches!(
            cache.store_chunk(2, Bytes::from_static(b"too long")).await,
            Err(CacheError::ChunkLength { expected: 4, .. })
        ));
        assert!(matches!(
            cache.set_info(sample(21, 8)).await,
            Err(CacheError::MetaMismatch)
        ));
        cleanup(&root);
    }

    #[tokio::test]
    async fn unusable_metadata_is_refused() {
        let root = test_dir("invalid_meta");
        let cache = open(&root, 4).await;
        assert!(matches!(
            cache.set_info(sample(1_000_000, 0)).await,
            Err(CacheError::InvalidMeta(MetaError::ZeroChunkSize))
        ));
        assert!(matches!(
            cache.set_info(sample(u64::MAX, 1)).await,
            Err(CacheError::InvalidMeta(MetaError::TooManyChunks { .. }))
        ));
        assert!(cache.info().await.is_none());
        assert!(!cache.is_transfer_complete().await);
        assert!(matches!(
            cache.author(sample(10, 0), root.join("nope.bin")).await,
            Err(CacheError::InvalidMeta(_))
        ));
        cleanup(&root);
    }

    #[tokio::test]
    async fn chunks_are_refused_while_merging() {
        let root = test_dir("store_during_merge");
        let cache = open(&root, 1).await;
        let meta = sample(24, 8);
        cache.set_info(meta.clone()).await.unwrap();
        for i in 0..3 {
            cache.store_chunk(i, chunk(&meta, i)).await.unwrap();
        }

        cache.inner.merging.store(true, Ordering::Release);
        assert!(matches!(
            cache.store_chunk(1, chunk(&meta, 1)).await,
            Err(CacheError::Merging)
        ));
        assert!(cache.inner.state.lock().await.buffer.is_empty());
        cache.inner.merging.store(false, Ordering::Release);

        let path = cache.merge_file().await.unwrap().unwrap();
        assert_eq!(std::fs::read(path).unwrap().len(), 24);
        assert_eq!(cache.get_chunk_count().await.unwrap(), 3);
        assert!(cache.inner.store.chunk_keys().await.unwrap().is_empty());
        cleanup(&root);
    }

    #[tokio::test]
    async fn authored_record_is_complete_and_sliceable() {
        let root = test_dir("author");
        let src = root.join("src.bin");
        std::fs::create_dir_all(&root).unwrap();
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let cache = open(&root.join("cache"), 4).await;
        let meta = sample(250, 100);
        cache.author(meta, src).await.unwrap();

        assert!(cache.is_complete().await);
        assert!(cache.get_req_ranges().await.unwrap().is_empty());
        assert_eq!(cache.get_chunk(2).await.unwrap().unwrap(), Bytes::from(data[200..].to_vec()));
        assert_eq!(cache.merge_file().await.unwrap(), Some(root.join("src.bin")));
        cleanup(&root);
    }

    #[tokio::test]
    async fn cleanup_is_final_and_idempotent() {
        let root = test_dir("cleanup");
        let cache = open(&root, 4).await;
        let meta = sample(16, 8);
        cache.set_info(meta.clone()).await.unwrap();
        cache.store_chunk(0, chunk(&meta, 0)).await.unwrap();
        cache.flush().await.unwrap();
        let mut events = cache.subscribe();

        cache.cleanup().await.unwrap();
        cache.cleanup().await.unwrap();
        assert!(matches!(events.try_recv(), Ok(CacheEvent::Cleanup)));
        assert!(events.try_recv().is_err());
        assert!(matches!(
            cache.store_chunk(1, chunk(&meta, 1)).await,
            Err(CacheError::Destroyed)
        ));
        assert!(!root.join("file-1").exists());
        cleanup(&root);
    }

    #[tokio::test]
    async fn list_and_export() {
        let root = test_dir("export");
        let cache = open(&root.join("cache"), 4).await;
        let mut meta = sample(10, 8);
        meta.file_name = "../report.txt".into();
        cache.set_info(meta.clone()).await.unwrap();
        cache.store_chunk(0, chunk(&meta, 0)).await.unwrap();
        cache.store_chunk(1, chunk(&meta, 1)).await.unwrap();

        assert!(matches!(cache.export(&root).await, Err(CacheError::NotAssembled)));
        cache.merge_file().await.unwrap();

        let out = root.join("out");
        let first = cache.export(&out).await.unwrap();
        let second = cache.export(&out).await.unwrap();
        assert_eq!(first, out.join("report.txt"));
        assert_eq!(second, out.join("report (1).txt"));
        assert_eq!(std::fs::read(&first).unwrap().len(), 10);

        let listed = ChunkCache::list(&root.join("cache")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, CacheStatus::Done);
        assert_eq!(listed[0].cached_chunks, 2);
        cleanup(&root);
    }

    #[test]
    fn file_names_are_flattened() {
        assert_eq!(sanitize_file_name("a/b/c.txt"), "c.txt");
        assert_eq!(sanitize_file_name("..\\..\\x.bin"), "x.bin");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }
}
