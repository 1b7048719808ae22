//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML settings file
//! - Merging CLI with file settings (CLI takes precedence)

use anyhow::Context;
use clap::{Parser, Subcommand};
use peerdrop::core::config::Settings;
use std::fs;
use std::path::{Path, PathBuf};

/// Peerdrop - resumable peer-to-peer file transfer.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for all persistent data (cache, logs, settings).
    /// Defaults to ~/.peerdrop/
    #[clap(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Settings file. Defaults to `<data-dir>/config.toml` when present.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Send a file between two in-process peers over real WebRTC.
    Loopback {
        file: PathBuf,

        /// Where the received copy is exported. Defaults to `<data-dir>/received`.
        #[clap(long)]
        out: Option<PathBuf>,

        /// Parallel transfer channels.
        #[clap(long)]
        channels: Option<usize>,

        /// Chunk size in bytes.
        #[clap(long)]
        chunk_size: Option<u32>,
    },
    /// Inspect and manage the chunk cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum CacheAction {
    /// List every cached record.
    List,
    /// Delete a record and its chunks.
    Remove { id: String },
    /// Copy an assembled file out of the cache.
    Export { id: String, dest: PathBuf },
}

impl Args {
    /// Parse the command line, resolving relative paths before any working
    /// directory change.
    pub fn load() -> Self {
        let mut args = Args::parse();
        args.data_dir = args.data_dir.map(Self::resolve_path);
        args.config = args.config.map(Self::resolve_path);
        if let Command::Loopback { file, out, .. } = &mut args.command {
            *file = Self::resolve_path(std::mem::take(file));
            *out = out.take().map(Self::resolve_path);
        }
        args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Settings from the file (if any) with CLI overrides applied.
    pub fn settings(&self, data_dir: &Path) -> anyhow::Result<Settings> {
        let file = match &self.config {
            Some(path) => Some(
                Self::from_file(path)?
                    .with_context(|| format!("settings file {} not found", path.display()))?,
            ),
            None => Self::from_file(&data_dir.join("config.toml"))?,
        };
        Ok(self.merge(file.unwrap_or_default()))
    }

    /// Load settings from a TOML file; `None` if it does not exist.
    fn from_file(path: &Path) -> anyhow::Result<Option<Settings>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings = Settings::from_toml(&content)
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        Ok(Some(settings))
    }

    /// Merge file settings with CLI args (CLI takes precedence).
    fn merge(&self, mut file: Settings) -> Settings {
        if let Command::Loopback {
            channels,
            chunk_size,
            ..
        } = &self.command
        {
            if let Some(channels) = channels {
                file.transfer.channel_count = (*channels).max(1);
            }
            if let Some(chunk_size) = chunk_size {
                file.transfer.chunk_size = (*chunk_size).max(1);
            }
        }
        file
    }
}
