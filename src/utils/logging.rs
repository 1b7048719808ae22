//! Tracing subscriber setup.
//!
//! Two layers under one `EnvFilter`: a compact stderr layer and a full file
//! layer under the data directory.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter directive for a `-v` count.
///
/// webrtc_ice reports late STUN responses as "unknown TransactionID"
/// warnings; they are harmless and muted at every level but trace.
pub fn filter_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn,peerdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    }
}

/// Install the global subscriber.
pub fn init(verbose: u8, log_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter_for(verbose)))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .try_init()?;
    Ok(())
}
