//! taskpilot daemon: watches workflows, prunes old context and accepts
//! line-delimited JSON commands on stdin.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tp_core::config::Config;
use tp_daemon::Daemon;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    tp_telemetry::logging::init_logging("tp-daemon", &config.general.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "taskpilot daemon starting");

    let daemon = Daemon::new(config).await.context("failed to start daemon")?;
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    let commands = async {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = daemon.serve_lines(stdin, tokio::io::stdout()).await {
            error!(error = %e, "command input failed");
        }
    };
    let (result, ()) = tokio::join!(daemon.run(), commands);
    result
}

/// `TASKPILOT_CONFIG` overrides `~/.taskpilot/config.toml`.
fn load_config() -> Result<Config> {
    match std::env::var_os("TASKPILOT_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            Config::load_from(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => Config::load().context("failed to load config"),
    }
}
