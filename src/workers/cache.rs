//! `peerdrop cache ...`: inspect and manage cached records.

use super::args::CacheAction;
use anyhow::{Context, bail};
use peerdrop::core::cache::{CacheSnapshot, CacheStatus, ChunkCache};
use peerdrop::core::codec::CodecWorker;
use peerdrop::core::config::{CacheConfig, Settings};
use peerdrop::utils::data_dir;
use std::path::{Path, PathBuf};
use tracing::info;

pub fn cache_root(settings: &Settings, data_dir: &Path) -> PathBuf {
    settings
        .cache
        .root
        .clone()
        .unwrap_or_else(|| data_dir::cache_root(data_dir))
}

pub async fn run(action: CacheAction, settings: &Settings, data_dir: &Path) -> anyhow::Result<()> {
    let root = cache_root(settings, data_dir);
    match action {
        CacheAction::List => {
            let records = ChunkCache::list(&root)
                .await
                .with_context(|| format!("failed to list {}", root.display()))?;
            if records.is_empty() {
                println!("cache is empty ({})", root.display());
            }
            for record in &records {
                println!("{}", describe(record));
            }
        }
        CacheAction::Remove { id } => {
            let cache = open(&root, &id, &settings.cache).await?;
            if cache.is_empty().await {
                bail!("no cached record {id}");
            }
            cache.cleanup().await.context("failed to remove record")?;
            info!(event = "cache_removed", id = %id);
        }
        CacheAction::Export { id, dest } => {
            let cache = open(&root, &id, &settings.cache).await?;
            if !cache.is_complete().await {
                if !cache.is_transfer_complete().await {
                    bail!("record {id} is still missing chunks");
                }
                cache
                    .merge_file()
                    .await
                    .context("failed to assemble record")?
                    .context("record is already being assembled")?;
            }
            let path = cache.export(&dest).await.context("failed to export")?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn open(root: &Path, id: &str, config: &CacheConfig) -> anyhow::Result<ChunkCache> {
    let worker = CodecWorker::spawn("peerdrop-codec", 1).context("failed to start codec worker")?;
    ChunkCache::open(root, id, worker, config)
        .await
        .with_context(|| format!("failed to open record {id}"))
}

fn describe(record: &CacheSnapshot) -> String {
    let status = match record.status {
        CacheStatus::Pending => "pending",
        CacheStatus::Merging => "merging",
        CacheStatus::Done => "done",
        CacheStatus::Error => "error",
    };
    let (name, size) = record
        .meta
        .as_ref()
        .map(|m| (m.file_name.as_str(), m.file_size))
        .unwrap_or(("?", 0));
    let chunks = match record.total_chunks {
        Some(total) if record.status == CacheStatus::Done => format!("{total}/{total}"),
        Some(total) => format!("{}/{total}", record.cached_chunks),
        None => format!("{}/?", record.cached_chunks),
    };
    format!("{}  {status:<7}  {chunks:>9}  {size:>12}  {name}", record.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop::core::meta::FileMetaData;

    #[test]
    fn describes_partial_and_done_records() {
        let meta = FileMetaData {
            id: "f".into(),
            file_name: "a.txt".into(),
            file_size: 10,
            chunk_size: 4,
            mime_type: "text/plain".into(),
            last_modified: 0,
            created_at: 0,
        };
        let mut snap = CacheSnapshot {
            id: "f".into(),
            meta: Some(meta),
            status: CacheStatus::Pending,
            cached_chunks: 1,
            total_chunks: Some(3),
            file: None,
        };
        assert!(describe(&snap).contains("1/3"));
        snap.status = CacheStatus::Done;
        snap.cached_chunks = 0;
        let line = describe(&snap);
        assert!(line.contains("3/3") && line.contains("done") && line.ends_with("a.txt"));
    }
}
