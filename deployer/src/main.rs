//! ethdeploy - Entry Point

use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error};

use ethdeploy::app::options::Cli;
use ethdeploy::app::run::{run, run_standalone};
use ethdeploy::app::state::AppState;
use ethdeploy::filesys::file::File;
use ethdeploy::logs::{init_logging, LogOptions};
use ethdeploy::storage::layout::StorageLayout;
use ethdeploy::storage::settings::Settings;

#[tokio::main]
async fn main() {
    let code = match main_inner().await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            2
        }
    };
    process::exit(code);
}

async fn main_inner() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    if let Some(code) = run_standalone(&cli.command)? {
        return Ok(code);
    }

    let layout = cli
        .base_dir
        .clone()
        .map(StorageLayout::new)
        .unwrap_or_default();

    let settings_file = cli
        .settings
        .clone()
        .map(File::new)
        .unwrap_or_else(|| layout.settings_file());
    let settings = Settings::load(&settings_file)
        .await
        .with_context(|| format!("reading {}", settings_file.path().display()))?;

    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.json_logs,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    // Held until exit so the file writer flushes.
    let _log_guard = init_logging(log_options).context("initializing logging")?;
    debug!("Using state directory {}", layout.base_dir.display());

    let app = AppState::init(layout, settings)
        .await
        .context("loading inventory")?;
    Ok(run(cli, app).await?)
}
