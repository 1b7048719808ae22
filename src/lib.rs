//! Resumable peer-to-peer file transfer over WebRTC data channels.
//!
//! - [`core::connection`]: peer sessions, data channels, signaling.
//! - [`core::cache`]: durable chunk storage with resume and merge.
//! - [`core::transfer`]: the chunked, compressed transfer protocol.

pub mod core;
pub mod utils;
