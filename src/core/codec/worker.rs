//! Offloaded codec worker.
//!
//! CPU-heavy work (compression, decompression, file merge) never runs on the
//! async reactor. Callers talk to the worker purely by message passing: a
//! typed [`CodecRequest`] goes in over a channel and a typed
//! [`CodecResponse`] comes back on a oneshot. Nothing is shared between the
//! two sides, so the serving end may equally live in another process as long
//! as it honours the same request/response contract.
//!
//! ```text
//! ┌──────────────┐  Job{request, reply}  ┌────────────────────┐
//! │ CodecWorker  │ ────────────────────► │ worker threads (N) │
//! │ (cloneable)  │ ◄──────────────────── │ brotli / merge     │
//! └──────────────┘   oneshot response    └────────────────────┘
//! ```

use super::CodecError;
use super::compress::{compress_data, decompress_data};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

#[derive(Debug)]
pub enum CodecRequest {
    Compress { data: Bytes, level: u32 },
    /// Fails with `TooLarge` rather than produce more than `limit` bytes.
    Decompress { data: Bytes, limit: usize },
    /// Concatenate `parts` in order into `dest`.
    Merge { parts: Vec<PathBuf>, dest: PathBuf },
}

#[derive(Debug)]
pub enum CodecResponse {
    Data(Bytes),
    Merged { path: PathBuf, size: u64 },
}

type Reply = oneshot::Sender<Result<CodecResponse, CodecError>>;

/// One request travelling to the serving side.
pub struct Job {
    pub request: CodecRequest,
    reply: Reply,
}

impl Job {
    /// Run the request and deliver the response.
    pub fn run(self) {
        let response = process(self.request);
        let _ = self.reply.send(response);
    }
}

/// A response that has been requested but not yet awaited.
pub struct PendingReply(oneshot::Receiver<Result<CodecResponse, CodecError>>);

impl PendingReply {
    pub async fn wait(self) -> Result<CodecResponse, CodecError> {
        self.0.await.map_err(|_| CodecError::WorkerGone)?
    }

    /// Await a `Data` response.
    pub async fn data(self) -> Result<Bytes, CodecError> {
        match self.wait().await? {
            CodecResponse::Data(bytes) => Ok(bytes),
            CodecResponse::Merged { .. } => Err(CodecError::UnexpectedResponse),
        }
    }
}

/// Cloneable client handle of a codec worker.
#[derive(Clone)]
pub struct CodecWorker {
    tx: mpsc::UnboundedSender<Job>,
}

impl CodecWorker {
    /// Start `threads` dedicated OS threads serving one shared job queue.
    pub fn spawn(name: &str, threads: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        for n in 0..threads.max(1) {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || serve_blocking(rx))?;
        }
        debug!(event = "codec_worker_started", name, threads = threads.max(1));
        Ok(Self { tx })
    }

    /// Wrap an existing job queue whose serving side is managed elsewhere.
    pub fn from_sender(tx: mpsc::UnboundedSender<Job>) -> Self {
        Self { tx }
    }

    /// Enqueue a request without waiting for the response.
    pub fn submit(&self, request: CodecRequest) -> PendingReply {
        let (reply, rx) = oneshot::channel();
        // A closed queue drops `reply`, which `PendingReply` reports as WorkerGone.
        let _ = self.tx.send(Job { request, reply });
        PendingReply(rx)
    }

    pub async fn compress(&self, data: Bytes, level: u32) -> Result<Bytes, CodecError> {
        self.submit(CodecRequest::Compress { data, level }).data().await
    }

    pub async fn decompress(&self, data: Bytes, limit: usize) -> Result<Bytes, CodecError> {
        self.submit(CodecRequest::Decompress { data, limit }).data().await
    }

    /// Concatenate chunk files into `dest`; returns the merged size.
    pub async fn merge(&self, parts: Vec<PathBuf>, dest: PathBuf) -> Result<u64, CodecError> {
        match self.submit(CodecRequest::Merge { parts, dest }).wait().await? {
            CodecResponse::Merged { size, .. } => Ok(size),
            CodecResponse::Data(_) => Err(CodecError::UnexpectedResponse),
        }
    }
}

fn serve_blocking(rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        let job = match rx.lock() {
            Ok(mut guard) => guard.blocking_recv(),
            Err(_) => None,
        };
        match job {
            Some(job) => job.run(),
            None => break,
        }
    }
}

fn process(request: CodecRequest) -> Result<CodecResponse, CodecError> {
    match request {
        CodecRequest::Compress { data, level } => {
            let out = compress_data(&data, level).inspect_err(|e| {
                error!(event = "compress_failure", bytes = data.len(), %e);
            })?;
            Ok(CodecResponse::Data(Bytes::from(out)))
        }
        CodecRequest::Decompress { data, limit } => {
            let out = decompress_data(&data, limit).inspect_err(|e| {
                error!(event = "decompress_failure", bytes = data.len(), limit, %e);
            })?;
            Ok(CodecResponse::Data(Bytes::from(out)))
        }
        CodecRequest::Merge { parts, dest } => {
            let size = merge_parts(&parts, &dest).inspect_err(|e| {
                error!(event = "merge_failure", dest = %dest.display(), %e);
            })?;
            Ok(CodecResponse::Merged { path: dest, size })
        }
    }
}

/// Write parts to a temp file next to `dest`, then rename into place.
fn merge_parts(parts: &[PathBuf], dest: &Path) -> std::io::Result<u64> {
    let tmp = dest.with_extension("merging");
    let result = (|| -> std::io::Result<u64> {
        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut size = 0u64;
        for part in parts {
            let mut src = File::open(part)?;
            size += std::io::copy(&mut src, &mut out)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(size)
    })();

    match result {
        Ok(size) => {
            std::fs::rename(&tmp, dest)?;
            Ok(size)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("peerdrop_test")
            .join("worker")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn compress_then_decompress() {
        let worker = CodecWorker::spawn("codec-test", 2).unwrap();
        let data = Bytes::from(vec![7u8; 100_000]);

        let packed = worker.compress(data.clone(), 4).await.unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(worker.decompress(packed.clone(), data.len()).await.unwrap(), data);
        let err = worker.decompress(packed, data.len() - 1).await.unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { limit: 99_999 }));
    }

    #[tokio::test]
    async fn submitted_replies_can_be_awaited_later() {
        let worker = CodecWorker::spawn("codec-pipeline", 3).unwrap();
        let pending: Vec<_> = (0..8u8)
            .map(|i| {
                worker.submit(CodecRequest::Compress {
                    data: Bytes::from(vec![i; 10_000]),
                    level: 2,
                })
            })
            .collect();

        for (i, reply) in pending.into_iter().enumerate() {
            let packed = reply.data().await.unwrap();
            let raw = decompress_data(&packed, 10_000).unwrap();
            assert_eq!(raw, vec![i as u8; 10_000]);
        }
    }

    #[tokio::test]
    async fn merge_concatenates_in_order() {
        let dir = test_dir("merge");
        let parts: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = dir.join(format!("{i}.bin"));
                std::fs::write(&p, vec![b'a' + i as u8; 10]).unwrap();
                p
            })
            .collect();
        let dest = dir.join("out.bin");

        let worker = CodecWorker::spawn("codec-merge", 1).unwrap();
        let size = worker.merge(parts, dest.clone()).await.unwrap();
        assert_eq!(size, 30);
        let merged = std::fs::read(&dest).unwrap();
        assert_eq!(&merged[..10], &[b'a'; 10]);
        assert_eq!(&merged[20..], &[b'c'; 10]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn merge_with_missing_part_fails_cleanly() {
        let dir = test_dir("merge_missing");
        let dest = dir.join("out.bin");
        let worker = CodecWorker::spawn("codec-missing", 1).unwrap();

        let err = worker
            .merge(vec![dir.join("nope.bin")], dest.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
        assert!(!dest.exists());
        assert!(!dest.with_extension("merging").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dropped_queue_reports_worker_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let worker = CodecWorker::from_sender(tx);
        let err = worker.decompress(Bytes::new(), 0).await.unwrap_err();
        assert!(matches!(err, CodecError::WorkerGone));
    }
}
