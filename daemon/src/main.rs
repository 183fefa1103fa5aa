use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::config::DEFAULT_CONFIG_PATH;
use strata_core::{LogProgress, StrataConfig};
use strata_daemon::{EncryptionManager, Host, Installer, StorageHealthMonitor};

#[derive(Parser)]
#[command(name = "strata-daemon")]
#[command(about = "Storage lifecycle daemon: install, drive unlock and pool health", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Poll pool health once and exit instead of looping
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = StrataConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let host = Host::system(&config.paths);

    let installer = Installer::new(host.clone(), config.clone(), Arc::new(LogProgress));
    if let Some(options) = installer.pending_install() {
        log::info!("Install seed found, starting install");
        let reboot = installer.run(&options).await.context("install failed")?;
        reboot.wait().await;
        return Ok(());
    }

    let encryption = EncryptionManager::new(Arc::clone(&host.runner), config.paths.clone());
    let unlocked = encryption.decrypt_drives().await?;
    log::info!("{} encrypted drive(s) unlocked", unlocked.len());

    let monitor = StorageHealthMonitor::new(Arc::clone(&host.runner), config.health.clone());
    if args.once {
        monitor.log_health().await?;
        return Ok(());
    }

    let mut interval = tokio::time::interval(config.health.poll_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = monitor.log_health().await {
                    log::warn!("Pool health check failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                return Ok(());
            }
        }
    }
}
