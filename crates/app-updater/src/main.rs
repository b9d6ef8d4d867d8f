use std::path::PathBuf;

use anyhow::Context;
use app_updater::*;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "updatectl")]
#[command(about = "Check for, download, and install application updates")]
struct Args {
    /// Update configuration file (YAML, JSON, or TOML)
    #[arg(short, long, default_value = "app-update.yml")]
    config: PathBuf,

    /// Version of the installed application
    #[arg(long)]
    current_version: String,

    /// Override the configured channel
    #[arg(long)]
    channel: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report whether an update is available
    Check,
    /// Download and verify the available update
    Download,
    /// Download, verify, and hand the update to the installer
    Install {
        /// Print the install handoff without launching it
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(format!("app_updater={},updatectl={}", args.log_level, args.log_level))
        .init();

    let mut config = UpdateConfig::load_from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(channel) = &args.channel {
        config.channel = ReleaseChannel::from_name(channel);
    }
    let current_version = AppVersion::parse(&args.current_version)
        .with_context(|| format!("invalid --current-version {:?}", args.current_version))?;

    let mut builder = UpdateManager::builder(config, current_version);
    if let Command::Install { dry_run: true } = args.command {
        builder = builder.with_executor(std::sync::Arc::new(DryRunExecutor));
    }
    let manager = builder.build()?;

    manager.subscribe(|event| match event {
        UpdaterEvent::UpdateAvailable(info) => {
            println!("update available: {} ({})", info.version, info.artifact_url)
        }
        UpdaterEvent::UpdateNotAvailable { current_version } => {
            println!("up to date: {current_version}")
        }
        UpdaterEvent::DownloadProgress(progress) => info!(%progress, "Downloading"),
        UpdaterEvent::UpdateDownloaded(update) => {
            println!("downloaded: {}", update.artifact.path.display())
        }
        UpdaterEvent::UpdateCancelled(info) => println!("cancelled: {}", info.version),
        UpdaterEvent::Error(e) => eprintln!("error: {e}"),
        UpdaterEvent::CheckingForUpdate => {}
    });

    let check = manager.check_for_updates().await?;
    if !check.is_update_available || matches!(args.command, Command::Check) {
        return Ok(());
    }

    let downloader = manager.clone();
    let mut download = tokio::spawn(async move { downloader.download_update().await });
    let downloaded = tokio::select! {
        result = &mut download => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling download");
            // The download may have finished in the meantime.
            let _ = manager.cancel_download();
            download.await?
        }
    };
    let downloaded = match downloaded {
        Ok(downloaded) => downloaded,
        Err(e) if e.is_cancelled() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if let Command::Install { .. } = args.command {
        let handoff = manager.quit_and_install().await?;
        info!(
            version = %downloaded.info.version,
            program = %handoff.program.display(),
            args = ?handoff.args,
            "Installer launched"
        );
    }

    Ok(())
}

/// Prints the handoff instead of running it.
struct DryRunExecutor;

#[async_trait::async_trait]
impl HandoffExecutor for DryRunExecutor {
    async fn execute(&self, handoff: &InstallHandoff) -> Result<(), InstallError> {
        println!(
            "would run: {} {}{}",
            handoff.program.display(),
            handoff.args.join(" "),
            if handoff.requires_elevation { " (elevated)" } else { "" }
        );
        Ok(())
    }
}
