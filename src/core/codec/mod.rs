//! Chunk codecs: block framing, brotli compression, and the offloaded worker
//! that runs compression, decompression, and merge off the reactor.

pub mod block;
pub mod compress;
pub mod worker;

pub use block::{BlockCache, BlockPacket, split_chunk};
pub use worker::{CodecRequest, CodecResponse, CodecWorker, PendingReply};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("block frame too short ({0} bytes)")]
    ShortFrame(usize),
    #[error("codec I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed block {block} of chunk {chunk}")]
    BadBlock { chunk: u32, block: u32 },
    #[error("decompressed data exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("codec worker is gone")]
    WorkerGone,
    #[error("codec worker returned an unexpected response")]
    UnexpectedResponse,
}
