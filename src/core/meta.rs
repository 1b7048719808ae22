//! File identity and description shared by cache, transferer, and wire.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("chunk size must be positive")]
    ZeroChunkSize,
    #[error("{count} chunks do not fit a 32-bit chunk index")]
    TooManyChunks { count: u64 },
}

/// Identity and description of one file.
///
/// Serialized camelCase so it can be flattened into the `head` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetaData {
    /// Opaque identifier, stable across resume.
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    /// Bytes per chunk; fixed for the file's lifetime.
    pub chunk_size: u32,
    pub mime_type: String,
    /// Milliseconds since the Unix epoch.
    pub last_modified: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl FileMetaData {
    /// Describe a local file, assigning it a fresh id.
    pub async fn from_path(path: &Path, chunk_size: u32) -> std::io::Result<Self> {
        let md = tokio::fs::metadata(path).await?;
        if !md.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let last_modified = md.modified().ok().map(epoch_millis).unwrap_or_default();

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            mime_type: mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            file_name,
            file_size: md.len(),
            chunk_size,
            last_modified,
            created_at: epoch_millis(SystemTime::now()),
        })
    }

    /// Reject geometry that cannot be chunked: a zero chunk size, or more
    /// chunks than a chunk index can address.
    pub fn validate(&self) -> Result<(), MetaError> {
        if self.chunk_size == 0 {
            return Err(MetaError::ZeroChunkSize);
        }
        let count = self.file_size.div_ceil(self.chunk_size as u64);
        if count > u32::MAX as u64 {
            return Err(MetaError::TooManyChunks { count });
        }
        Ok(())
    }

    /// `ceil(file_size / chunk_size)`, saturating for geometry that
    /// [`validate`](Self::validate) rejects.
    pub fn chunk_count(&self) -> u32 {
        if self.chunk_size == 0 {
            return 0;
        }
        u32::try_from(self.file_size.div_ceil(self.chunk_size as u64)).unwrap_or(u32::MAX)
    }

    /// Byte offset of chunk `index` within the file.
    pub fn chunk_offset(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size as u64
    }

    /// Byte length of chunk `index`; only the final chunk may be short.
    pub fn chunk_len(&self, index: u32) -> usize {
        let offset = self.chunk_offset(index);
        if offset >= self.file_size {
            return 0;
        }
        (self.file_size - offset).min(self.chunk_size as u64) as usize
    }
}

pub(crate) fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
