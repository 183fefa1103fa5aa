//! Installing the running system onto another disk.
//!
//! The partition table is re-created entry by entry rather than copied, since
//! the install media and the target may use different sector sizes. After
//! that, each partition's raw contents are copied over and the machine
//! reboots once the install media is gone.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::device::is_optical_device;
use strata_core::seed;
use strata_core::{
    partition_path, BlockDeviceRef, InstallOptions, ProgressReporter, ScheduledReboot, StrataConfig,
    StrataError,
};
use strata_platform::{enumerate_block_devices, is_read_only, Sgdisk, TableState};

use crate::host::Host;

const COPY_CHUNK_SIZE: usize = 1024 * 1024;
const PROGRESS_EVERY_CHUNKS: u64 = 10;
const GIB: u64 = 1024 * 1024 * 1024;

/// Stable-ID prefixes of virtual media exposed by server BMCs.
const VIRTUAL_MEDIA_PREFIXES: &[&str] = &["usb-Linux_Virtual_", "usb-Cisco_"];

/// Where the running system was booted from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMedia {
    /// Device whose partitions hold the data to copy.
    pub device: PathBuf,
    pub read_only: bool,
    /// Booted from an optical drive, accessed through a mapped device.
    pub optical: bool,
}

/// Source, target and the candidates the target was picked from.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub source: SourceMedia,
    pub target: BlockDeviceRef,
    pub candidates: Vec<BlockDeviceRef>,
}

pub struct Installer {
    host: Host,
    config: StrataConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl Installer {
    pub fn new(host: Host, config: StrataConfig, progress: Arc<dyn ProgressReporter>) -> Self {
        Self {
            host,
            config,
            progress,
        }
    }

    /// Find the install media and whether it can be written to.
    pub fn detect_source(&self) -> Result<SourceMedia, StrataError> {
        let paths = &self.config.paths;

        if !paths.boot_mount.exists() && paths.optical_device.exists() {
            log::info!("Running from optical media {}", paths.optical_device.display());
            return Ok(SourceMedia {
                device: paths.optical_mapped.clone(),
                read_only: true,
                optical: true,
            });
        }

        let device = self.host.system_disk(paths)?;
        let read_only = is_read_only(&paths.boot_mount)?;

        log::info!(
            "Running from {}{}",
            device.display(),
            if read_only { " (read-only)" } else { "" }
        );
        Ok(SourceMedia {
            device,
            read_only,
            optical: false,
        })
    }

    /// Install options from the `install` seed on the source media, if any.
    pub fn install_options(&self, source: &SourceMedia) -> Result<Option<InstallOptions>, StrataError> {
        let partition = partition_path(&source.device, self.config.layout.seed);
        let bundle = match seed::read_existing(&partition) {
            Ok(bundle) => bundle,
            Err(StrataError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        bundle.parse("install")
    }

    /// Install options for this boot, if the install media asks for an
    /// install. Problems reading the media are logged and treated as no
    /// install request.
    pub fn pending_install(&self) -> Option<InstallOptions> {
        let source = match self.detect_source() {
            Ok(source) => source,
            Err(e) => {
                log::warn!("Couldn't determine boot media, skipping install check: {}", e);
                return None;
            }
        };

        match self.install_options(&source) {
            Ok(options) => options,
            Err(e) => {
                log::warn!("Ignoring unreadable install seed on {}: {}", source.device.display(), e);
                None
            }
        }
    }

    /// Every whole disk on the system, in target preference order.
    pub async fn candidates(&self) -> Result<Vec<BlockDeviceRef>, StrataError> {
        enumerate_block_devices(self.host.runner.as_ref()).await
    }

    /// Pick the install target among `candidates`.
    pub fn select_target(
        &self,
        source: &SourceMedia,
        candidates: &[BlockDeviceRef],
        selector: Option<&str>,
    ) -> Result<BlockDeviceRef, StrataError> {
        if candidates.len() < 2 {
            return Err(StrataError::NoCandidate(format!(
                "found {} block device(s), need the install media plus at least one disk",
                candidates.len()
            )));
        }

        let eligible: Vec<&BlockDeviceRef> = candidates
            .iter()
            .filter(|device| self.is_eligible(source, device))
            .collect();

        let target = match selector {
            Some(selector) => eligible
                .into_iter()
                .find(|device| self.matches_selector(device, selector))
                .cloned()
                .ok_or_else(|| StrataError::NoCandidate(format!("no target device matched '{}'", selector))),
            None => match eligible.as_slice() {
                [only] => Ok((*only).clone()),
                [] => Err(StrataError::NoCandidate(
                    "no eligible install device found".to_string(),
                )),
                many => Err(StrataError::AmbiguousTarget(format!(
                    "no target configured and {} eligible devices found: {}",
                    many.len(),
                    many.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
                ))),
            },
        }?;

        let minimum = self.config.install.min_target_size;
        if target.size < minimum {
            return Err(StrataError::TargetTooSmall {
                target: target.to_string(),
                minimum,
                detected: candidates.iter().map(describe).collect::<Vec<_>>().join(", "),
            });
        }
        Ok(target)
    }

    /// Steps 1 and 2: source detection and target selection. Touches nothing.
    pub async fn plan(&self, options: &InstallOptions) -> Result<InstallPlan, StrataError> {
        let source = self.detect_source()?;
        let candidates = self.candidates().await?;
        let target = self.select_target(&source, &candidates, options.target_selector())?;

        Ok(InstallPlan {
            source,
            target,
            candidates,
        })
    }

    /// Run the whole install and arm the final reboot. Failures are also
    /// reported to the progress reporter.
    pub async fn run(&self, options: &InstallOptions) -> Result<ScheduledReboot, StrataError> {
        let result = self.install(options).await;
        if let Err(e) = &result {
            self.progress.update(&format!("Error: {}", e));
        }
        result
    }

    async fn install(&self, options: &InstallOptions) -> Result<ScheduledReboot, StrataError> {
        let layout = &self.config.layout;

        self.progress.update("Starting install");
        let plan = self.plan(options).await?;
        let source = &plan.source;
        let target = plan.target.kernel_name.as_path();
        log::info!("Installing from {} to {}", source.device.display(), plan.target);

        let sgdisk = Sgdisk::new(self.host.runner.as_ref());
        let force_install = match sgdisk.verify(target).await? {
            TableState::Absent => options.force_install,
            TableState::Present if options.force_install => true,
            TableState::Present => {
                return Err(StrataError::ExistingPartitionTable(target.display().to_string()));
            }
            TableState::Damaged => {
                log::warn!("{} has a damaged partition table, installing over it", target.display());
                true
            }
        };

        // Nothing above this point has modified any device.
        self.teardown(source, target, force_install)
            .await
            .map_err(|e| e.interrupted("Preparing the target"))?;

        let count = layout.clone_count(source.read_only);
        let table_device = self.table_device(source);
        for index in 1..=count {
            self.progress
                .update(&format!("Creating partition {} of {}", index, count));
            let spec = sgdisk
                .partition_info(&table_device, index)
                .await
                .map_err(|e| e.interrupted("Creating partitions"))?;
            sgdisk
                .create_partition(target, &spec)
                .await
                .map_err(|e| e.interrupted("Creating partitions"))?;
        }

        for index in 1..=count {
            self.progress
                .update(&format!("Copying partition {} of {}", index, count));
            self.copy_partition(&source.device, target, index)
                .await
                .map_err(|e| e.interrupted("Copying partitions"))?;
        }
        self.progress.update_progress(0, 0);

        self.remove_install_seed(target)
            .map_err(|e| e.interrupted("Removing the install seed"))?;

        self.progress
            .update("Install complete. Remove the install media to reboot into the installed system.");
        self.wait_for_media_removal(source, options.force_reboot)
            .await
            .map_err(|e| e.interrupted("Waiting for media removal"))?;

        self.host.power.sync_disks();
        let reboot = self
            .host
            .reboot_scheduler()
            .schedule(self.config.reboot.install_delay());
        self.progress.done();
        Ok(reboot)
    }

    fn is_eligible(&self, source: &SourceMedia, device: &BlockDeviceRef) -> bool {
        if device.is(&source.device) {
            return false;
        }
        if source.optical && device.is(&self.config.paths.optical_device) {
            return false;
        }
        if device.stable_id.is_empty() {
            return false;
        }
        if VIRTUAL_MEDIA_PREFIXES
            .iter()
            .any(|prefix| device.stable_id.starts_with(prefix))
        {
            return false;
        }
        !is_optical_device(&device.kernel_name)
    }

    /// A selector matches by substring of the stable ID, or when both names
    /// link to the same device node.
    fn matches_selector(&self, device: &BlockDeviceRef, selector: &str) -> bool {
        if device.stable_id.contains(selector) {
            return true;
        }

        let by_id = &self.config.paths.by_id;
        match (
            fs::read_link(by_id.join(selector)),
            fs::read_link(by_id.join(&device.stable_id)),
        ) {
            (Ok(wanted), Ok(candidate)) => wanted == candidate,
            _ => false,
        }
    }

    /// Device to read the partition table from. Optical media is read through
    /// the raw drive, its partitions through the mapped device.
    fn table_device(&self, source: &SourceMedia) -> PathBuf {
        if source.optical {
            self.config.paths.optical_device.clone()
        } else {
            source.device.clone()
        }
    }

    async fn teardown(&self, source: &SourceMedia, target: &Path, force_install: bool) -> Result<(), StrataError> {
        let runner = self.host.runner.as_ref();
        let target_arg = target.to_string_lossy();

        if force_install {
            Sgdisk::new(runner).zap(target).await?;

            log::info!("Discarding {}", target.display());
            let discard = runner.run("blkdiscard", &["-f", &target_arg]).await?;
            if !discard.success() {
                log::debug!("blkdiscard {}: {}", target.display(), discard.diagnostic());
            }
        }

        log::info!("Disabling swap");
        runner.run_checked("swapoff", &["-a"]).await?;

        let boot = self.config.paths.boot_mount.to_string_lossy();
        log::info!("Unmounting {}", boot);
        if let Err(e) = runner.run_checked("umount", &[boot.as_ref()]).await {
            if !source.read_only {
                return Err(e);
            }
            log::warn!("Ignoring unmount failure on read-only media: {}", e);
        }

        Ok(())
    }

    async fn copy_partition(&self, source: &Path, target: &Path, index: u32) -> Result<(), StrataError> {
        let from = partition_path(source, index);
        let to = partition_path(target, index);
        let progress = Arc::clone(&self.progress);

        log::info!("Copying {} to {}", from.display(), to.display());
        tokio::task::spawn_blocking(move || copy_contents(&from, &to, progress.as_ref()))
            .await
            .map_err(|e| StrataError::IoError(io::Error::new(io::ErrorKind::Other, e.to_string())))?
    }

    fn remove_install_seed(&self, target: &Path) -> Result<(), StrataError> {
        let partition = partition_path(target, self.config.layout.seed);
        let mut bundle = seed::read_existing(&partition)?;

        if bundle.remove("install") {
            seed::write_bundle(&partition, &bundle)?;
        } else {
            log::debug!("No install seed on {}", partition.display());
        }
        Ok(())
    }

    async fn wait_for_media_removal(&self, source: &SourceMedia, force_reboot: bool) -> Result<(), StrataError> {
        if force_reboot {
            return Ok(());
        }

        let marker = if source.optical {
            self.config.paths.optical_device.clone()
        } else {
            partition_path(&source.device, self.config.layout.boot)
        };

        log::info!("Waiting for {} to disappear", marker.display());
        loop {
            match fs::metadata(&marker) {
                Ok(_) => self.host.clock.sleep(self.config.reboot.media_poll_interval()).await,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn describe(device: &BlockDeviceRef) -> String {
    format!("{} {:.2} GiB", device, device.size as f64 / GIB as f64)
}

/// Copy `from` to `to` in fixed-size chunks until the end of `from`.
fn copy_contents(from: &Path, to: &Path, progress: &dyn ProgressReporter) -> Result<(), StrataError> {
    let mut source = File::open(from)?;
    let expected = source.seek(SeekFrom::End(0))?;
    source.seek(SeekFrom::Start(0))?;

    let mut target = OpenOptions::new().write(true).open(to)?;
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut copied = 0u64;
    let mut chunks = 0u64;

    loop {
        let filled = fill_chunk(&mut source, &mut buffer)?;
        if filled == 0 {
            break;
        }

        target.write_all(&buffer[..filled])?;
        copied += filled as u64;
        chunks += 1;

        if chunks % PROGRESS_EVERY_CHUNKS == 0 {
            progress.update_progress(copied, expected);
        }
    }

    target.flush()?;
    target.sync_all()?;

    if copied < expected {
        return Err(StrataError::IncompleteCopy {
            path: from.display().to_string(),
            copied,
            expected,
        });
    }

    Ok(())
}

fn fill_chunk(reader: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
