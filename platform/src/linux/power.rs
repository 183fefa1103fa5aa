use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use strata_core::PowerControl;

/// Power control through `sync(2)` and the magic SysRq trigger.
#[derive(Debug, Clone)]
pub struct SysrqPower {
    trigger: PathBuf,
}

impl SysrqPower {
    pub fn new(trigger: impl Into<PathBuf>) -> Self {
        Self { trigger: trigger.into() }
    }
}

impl PowerControl for SysrqPower {
    fn sync_disks(&self) {
        nix::unistd::sync();
    }

    fn reboot_now(&self) -> io::Result<()> {
        log::warn!("Triggering immediate reboot via {}", self.trigger.display());
        let mut trigger = OpenOptions::new().write(true).open(&self.trigger)?;
        trigger.write_all(b"b")
    }
}
