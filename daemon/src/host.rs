use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{
    underlying_device, Clock, CommandRunner, HostPaths, PowerControl, RebootScheduler, StrataError,
    SysfsView, SystemCommandRunner, TokioClock,
};
use strata_platform::{HostSysfs, SysrqPower};

/// The host-facing seams every workflow runs against.
#[derive(Clone)]
pub struct Host {
    pub runner: Arc<dyn CommandRunner>,
    pub sysfs: Arc<dyn SysfsView>,
    pub power: Arc<dyn PowerControl>,
    pub clock: Arc<dyn Clock>,
}

impl Host {
    /// The real machine, at the locations in `paths`.
    pub fn system(paths: &HostPaths) -> Self {
        Self {
            runner: Arc::new(SystemCommandRunner),
            sysfs: Arc::new(HostSysfs::new(&paths.sysfs_block)),
            power: Arc::new(SysrqPower::new(&paths.reboot_trigger)),
            clock: Arc::new(TokioClock),
        }
    }

    pub fn reboot_scheduler(&self) -> RebootScheduler {
        RebootScheduler::new(Arc::clone(&self.power), Arc::clone(&self.clock))
    }

    /// The disk the running system lives on.
    pub fn system_disk(&self, paths: &HostPaths) -> Result<PathBuf, StrataError> {
        let anchor = paths.anchor()?;
        underlying_device(self.sysfs.as_ref(), &anchor, &paths.dev_root)
    }
}
