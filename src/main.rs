mod workers;

use anyhow::Context;
use peerdrop::utils::sos::SignalOfStop;
use peerdrop::utils::{data_dir, logging};
use workers::args::{Args, Command};
use workers::loopback::LoopbackJob;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Initialize the global data directory (must happen before any cache access)
    let data_dir = data_dir::init(args.data_dir.as_deref())?;
    logging::init(args.verbose, &data_dir::log_file(data_dir)).context("failed to set up logging")?;
    let settings = args.settings(data_dir)?;

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command {
        Command::Loopback { file, out, .. } => {
            let job = LoopbackJob {
                file,
                out: out.unwrap_or_else(|| data_dir.join("received")),
            };
            let exported = workers::loopback::run(job, &settings, data_dir, sos).await?;
            println!("{}", exported.display());
        }
        Command::Cache { action } => workers::cache::run(action, &settings, data_dir).await?,
    }
    Ok(())
}
