//! On-disk layout of one cache record.
//!
//! ```text
//! <root>/<file_id>/
//!   info.json        info partition: FileMetaData + status + assembled file handle
//!   file.bin         assembled file (after merge)
//!   chunks/<n>.bin   chunks partition: one row per chunk index
//! ```
//!
//! Deleting `<root>/<file_id>` is the whole record's cleanup.

use super::{CacheError, CacheInfo};
use crate::utils::atomic_write::atomic_write;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::warn;

const INFO_FILE: &str = "info.json";
const CHUNKS_DIR: &str = "chunks";
const ASSEMBLED_FILE: &str = "file.bin";
const CHUNK_EXT: &str = "bin";

/// File ids come from remote peers; only a conservative charset may reach
/// the filesystem.
pub fn validate_id(id: &str) -> Result<(), CacheError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(CacheError::InvalidId(id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(root: &Path, id: &str) -> Result<Self, CacheError> {
        validate_id(id)?;
        Ok(Self { dir: root.join(id) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn info_path(&self) -> PathBuf {
        self.dir.join(INFO_FILE)
    }

    fn chunks_dir(&self) -> PathBuf {
        self.dir.join(CHUNKS_DIR)
    }

    pub fn assembled_path(&self) -> PathBuf {
        self.dir.join(ASSEMBLED_FILE)
    }

    pub fn chunk_path(&self, index: u32) -> PathBuf {
        self.chunks_dir().join(format!("{index}.{CHUNK_EXT}"))
    }

    pub async fn read_info(&self) -> Result<Option<CacheInfo>, CacheError> {
        read_info_at(&self.info_path()).await
    }

    pub async fn write_info(&self, info: &CacheInfo) -> Result<(), CacheError> {
        let content = serde_json::to_vec_pretty(info)?;
        atomic_write(&self.info_path(), &content).await?;
        Ok(())
    }

    /// Persist a batch of chunk rows. Each row is written to a temp name and
    /// renamed, so a row either exists whole or not at all.
    pub async fn write_chunks(&self, batch: &[(u32, Bytes)]) -> Result<(), CacheError> {
        if batch.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.chunks_dir()).await?;
        for (index, data) in batch {
            let path = self.chunk_path(*index);
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, data).await?;
            fs::rename(&tmp, &path).await?;
        }
        Ok(())
    }

    pub async fn read_chunk(&self, index: u32) -> Result<Option<Bytes>, CacheError> {
        match fs::read(self.chunk_path(index)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Indices of every durable chunk row.
    pub async fn chunk_keys(&self) -> Result<BTreeSet<u32>, CacheError> {
        let mut keys = BTreeSet::new();
        let mut entries = match fs::read_dir(self.chunks_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXT) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).map(str::parse::<u32>) {
                Some(Ok(index)) => {
                    keys.insert(index);
                }
                _ => warn!(event = "cache_stray_file", path = %path.display()),
            }
        }
        Ok(keys)
    }

    pub async fn clear_chunks(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(self.chunks_dir()).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Remove the whole record.
    pub async fn destroy(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

async fn read_info_at(path: &Path) -> Result<Option<CacheInfo>, CacheError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read `len` bytes at `offset` of an assembled file.
pub async fn read_slice(path: &Path, offset: u64, len: usize) -> Result<Bytes, CacheError> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Info rows of every record under `root`, skipping unreadable ones.
pub async fn list_infos(root: &Path) -> Result<Vec<(String, CacheInfo)>, CacheError> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(root).await {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let Some(id) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if validate_id(&id).is_err() {
            continue;
        }
        match read_info_at(&entry.path().join(INFO_FILE)).await {
            Ok(Some(info)) => out.push((id, info)),
            Ok(None) => {}
            Err(e) => warn!(event = "cache_info_unreadable", id = %id, error = %e),
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_restricted() {
        assert!(validate_id("3f2a-b_9").is_ok());
        for bad in ["", "../etc", "a/b", "a b", "x.y"] {
            assert!(validate_id(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn chunk_rows_roundtrip_and_list() {
        let root = std::env::temp_dir().join("peerdrop_test").join("store");
        let _ = std::fs::remove_dir_all(&root);
        let store = CacheStore::new(&root, "rec").unwrap();

        assert!(store.chunk_keys().await.unwrap().is_empty());
        store
            .write_chunks(&[(3, Bytes::from_static(b"ccc")), (0, Bytes::from_static(b"a"))])
            .await
            .unwrap();
        std::fs::write(store.chunks_dir().join("junk.txt"), b"x").unwrap();

        assert_eq!(store.chunk_keys().await.unwrap().into_iter().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(store.read_chunk(3).await.unwrap().unwrap(), Bytes::from_static(b"ccc"));
        assert!(store.read_chunk(1).await.unwrap().is_none());

        store.clear_chunks().await.unwrap();
        assert!(store.chunk_keys().await.unwrap().is_empty());
        store.destroy().await.unwrap();
        store.destroy().await.unwrap();
        assert!(list_infos(&root).await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }
}
