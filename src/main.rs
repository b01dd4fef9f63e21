mod error;
mod fetch;
mod orchestrator;
mod pool;
mod populate;
mod registry;
mod resp;
mod settings;
mod store;
mod transport;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use settings::{CliArgs, RunConfig, Settings, CONFIG_FILE};
use store::RedisStore;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let args = CliArgs::try_parse().unwrap_or_else(|err| exit_with_usage(err));
    let settings = Settings::load(CONFIG_FILE).context("Error loading settings")?;
    init_tracing(&settings.log_level);

    let config = RunConfig::try_from((args, settings))?;
    tracing::debug!("Running with {config:?}");
    if config.secure {
        tracing::warn!("TLS certificate verification is disabled, use against test servers only");
    }

    // The store client resolves its TLS provider from the process default.
    transport::install_crypto_provider();

    // Each worker spends its life on one socket, so runtime threads only
    // matter for building values and driving handshakes.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.settings.runtime_threads)
        .enable_all()
        .build()
        .context("Error building runtime")?;

    let store = RedisStore::new(&config.host, config.port, config.secure);
    let summary = runtime.block_on(orchestrator::run(&config, &store));

    // Stage outcomes are narrated, never turned into an exit status.
    if let Err(err) = &summary.population {
        tracing::error!("Population stage did not run: {err}");
    }
    if let Err(err) = &summary.fetch {
        tracing::error!("Fetch stage did not run: {err}");
    }
    let flush = match &summary.flush {
        None => "skipped",
        Some(Ok(())) => "done",
        Some(Err(_)) => "failed",
    };
    tracing::info!("Finished (flush {flush})");
    Ok(())
}

/// Prints clap's message (which includes the usage line) and exits with 1.
/// `--help` and `--version` keep their zero exit status.
fn exit_with_usage(err: clap::Error) -> ! {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => err.exit(),
        _ => {
            let _ = err.print();
            std::process::exit(1);
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
