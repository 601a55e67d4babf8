mod cli;
mod session;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use tp_core::config::Config;

use crate::cli::{Cli, Commands, Request};
use crate::session::Session;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("TASKPILOT_CONFIG").map(PathBuf::from));
    let mut config = match &config_path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    if let Some(dir) = &cli.data_dir {
        config.general.data_dir = dir.display().to_string();
    }

    let level = tp_telemetry::logging::level_for_verbosity(&config.general.log_level, cli.verbose);
    tp_telemetry::logging::init_logging("tp", &level);

    let request = match cli.command {
        Commands::Exec { json } => Request::Raw(cli::read_raw(json)?),
        other => other.into_request()?,
    };

    let session = Session::open(&config).await?;
    let output = session.run(request).await;

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{rendered}");

    Ok(if output.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
