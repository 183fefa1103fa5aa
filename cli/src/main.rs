use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::config::{InstallTarget, DEFAULT_CONFIG_PATH};
use strata_core::{InstallOptions, LogProgress, StrataConfig, StrataError};
use strata_daemon::{EncryptionManager, Host, Installer, ResetOrchestrator, ResetRequest, StorageHealthMonitor};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Install, reset and manage storage on a strata appliance", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the device the running system was booted from
    Source,
    /// List disks the system could be installed to
    Targets,
    /// Install the running system onto another disk
    Install {
        /// Stable ID (or part of one) of the target disk
        #[arg(short, long)]
        target: Option<String>,
        /// Install over an existing partition table
        #[arg(long)]
        force: bool,
        /// Reboot without waiting for the install media to be removed
        #[arg(long)]
        force_reboot: bool,
    },
    /// Factory reset: rewrite seeds, clear the TPM and drop all data partitions
    Reset {
        /// Seed to write, as NAME=FILE with FILE holding a JSON document
        #[arg(short, long = "seed", value_name = "NAME=FILE")]
        seeds: Vec<String>,
        /// Full reset request as a JSON document, instead of --seed
        #[arg(long, conflicts_with = "seeds")]
        request: Option<PathBuf>,
        /// Drop every existing seed instead of merging
        #[arg(long)]
        wipe_seeds: bool,
        /// Carry on if the TPM can't be cleared
        #[arg(long)]
        allow_tpm_failure: bool,
    },
    /// Encrypt a drive with a new random key
    Encrypt {
        /// Drive path under the stable-ID namespace
        device: PathBuf,
    },
    /// Adopt a drive encrypted elsewhere, given its base64 key
    Import {
        device: PathBuf,
        key: String,
    },
    /// Unlock every drive with a stored key
    Unlock,
    /// Print the stored drive keys
    Keys,
    /// Show pool state and scrub progress
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = StrataConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let host = Host::system(&config.paths);

    match cli.command {
        Commands::Source => {
            let installer = Installer::new(host, config, Arc::new(LogProgress));
            let source = installer.detect_source()?;
            println!("Device: {}", source.device.display());
            println!("  Read-only: {}", if source.read_only { "Yes" } else { "No" });
            println!("  Optical: {}", if source.optical { "Yes" } else { "No" });
            match installer.install_options(&source)? {
                Some(options) => println!("  Install seed: {:?}", options),
                None => println!("  Install seed: none"),
            }
        }
        Commands::Targets => {
            let installer = Installer::new(host, config, Arc::new(LogProgress));
            let source = installer.detect_source()?;
            let candidates = installer.candidates().await?;
            if candidates.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Block devices:\n");
            for device in &candidates {
                println!("Device: {}", device.kernel_name.display());
                println!("  ID: {}", if device.stable_id.is_empty() { "-" } else { device.stable_id.as_str() });
                println!("  Size: {:.2} GB", device.size as f64 / 1_073_741_824.0);
                if device.is(&source.device) {
                    println!("  Install media: Yes");
                }
                println!();
            }

            match installer.select_target(&source, &candidates, None) {
                Ok(target) => println!("Default install target: {}", target),
                Err(e) => println!("No default install target: {}", e),
            }
        }
        Commands::Install {
            target,
            force,
            force_reboot,
        } => {
            let options = InstallOptions {
                force_install: force,
                force_reboot,
                target: target.map(|id| InstallTarget { id }),
            };
            let installer = Installer::new(host, config, Arc::new(LogProgress));
            let plan = installer.plan(&options).await.map_err(explain)?;

            println!("Source: {}", plan.source.device.display());
            println!("Target: {}", plan.target);
            println!();
            println!("⚠️  WARNING: This will ERASE ALL DATA on {}", plan.target);
            if !confirm()? {
                println!("Install cancelled.");
                return Ok(());
            }

            let reboot = installer.run(&options).await.map_err(explain)?;
            println!("✓ Install complete, rebooting in {:?}", reboot.delay());
            reboot.wait().await;
        }
        Commands::Reset {
            seeds,
            request,
            wipe_seeds,
            allow_tpm_failure,
        } => {
            let mut request = match request {
                Some(path) => ResetRequest::from_json(&std::fs::read(&path)?)?,
                None => ResetRequest {
                    seeds: read_seed_args(&seeds)?,
                    ..ResetRequest::default()
                },
            };
            request.wipe_existing_seeds |= wipe_seeds;
            request.allow_tpm_reset_failure |= allow_tpm_failure;

            println!("Seeds to write: {}", request.seeds.keys().cloned().collect::<Vec<_>>().join(", "));
            println!(
                "Existing seeds: {}",
                if request.wipe_existing_seeds { "dropped" } else { "kept" }
            );
            println!();
            println!("⚠️  WARNING: This will clear the TPM and DESTROY ALL DATA on this machine");
            if !confirm()? {
                println!("Reset cancelled.");
                return Ok(());
            }

            let orchestrator = ResetOrchestrator::new(host, config);
            let reboot = orchestrator.run(request).await.map_err(explain)?;
            println!("✓ Reset complete, rebooting in {:?}", reboot.delay());
            reboot.wait().await;
        }
        Commands::Encrypt { device } => {
            println!("⚠️  WARNING: This will ERASE ALL DATA on {}", device.display());
            if !confirm()? {
                println!("Encryption cancelled.");
                return Ok(());
            }

            let manager = EncryptionManager::new(host.runner, config.paths);
            let record = manager.encrypt_drive(&device).await.map_err(explain)?;
            println!("✓ {} encrypted", record.device_id);
            println!("  Key file: {}", record.key_file.display());
            println!("  Key: {}", record.encoded_key());
        }
        Commands::Import { device, key } => {
            let manager = EncryptionManager::new(host.runner, config.paths);
            manager.import_encrypted_drive(&device, &key).await?;
            println!("✓ {} imported and unlocked", device.display());
        }
        Commands::Unlock => {
            let manager = EncryptionManager::new(host.runner, config.paths);
            let unlocked = manager.decrypt_drives().await?;
            if unlocked.is_empty() {
                println!("No drives unlocked.");
            }
            for id in unlocked {
                println!("✓ {}", id);
            }
        }
        Commands::Keys => {
            let manager = EncryptionManager::new(host.runner, config.paths);
            let keys = manager.get_drive_keys()?;
            if keys.is_empty() {
                println!("No drive keys stored.");
            }
            for (id, key) in keys {
                println!("{}: {}", id, key);
            }
        }
        Commands::Health => {
            let monitor = StorageHealthMonitor::new(host.runner, config.health);
            let pools = monitor.poll().await?;
            if pools.is_empty() {
                println!("No pools found.");
            }
            for pool in pools {
                println!("Pool: {}", pool.name);
                println!("  State: {}", pool.state);
                if let (Some(function), Some(progress)) = (&pool.scan_function, pool.scan_progress()) {
                    println!("  {}: {}", function.to_lowercase(), progress);
                }
            }
        }
    }

    Ok(())
}

/// Ask for an explicit `yes` on stdin.
fn confirm() -> io::Result<bool> {
    println!("Type 'yes' to continue: ");
    let stdin = io::stdin();
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(line.trim() == "yes")
}

/// Tell the operator whether the machine was left as it was.
fn explain(err: StrataError) -> anyhow::Error {
    if err.is_pre_mutation() {
        eprintln!("No changes were made.");
    } else {
        eprintln!("The operation failed part way through; the machine may not boot.");
    }
    err.into()
}

fn read_seed_args(args: &[String]) -> anyhow::Result<std::collections::BTreeMap<String, Vec<u8>>> {
    args.iter()
        .map(|arg| {
            let (name, file) = arg
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Seed '{}' is not of the form NAME=FILE", arg))?;
            let payload = std::fs::read(Path::new(file)).with_context(|| format!("reading seed file {}", file))?;
            Ok((name.to_string(), payload))
        })
        .collect()
}
