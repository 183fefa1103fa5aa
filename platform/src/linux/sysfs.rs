use nix::sys::stat::{major, minor, stat};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use strata_core::{DeviceNumber, SysfsView};

/// The host's block registry, normally `/sys/class/block`.
#[derive(Debug, Clone)]
pub struct HostSysfs {
    root: PathBuf,
}

impl HostSysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sorted_names(dir: &Path) -> io::Result<Vec<String>> {
        let mut names = fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }
}

impl SysfsView for HostSysfs {
    fn device_number(&self, path: &Path) -> io::Result<DeviceNumber> {
        let st = stat(path).map_err(io::Error::from)?;
        Ok(DeviceNumber::new(major(st.st_dev), minor(st.st_dev)))
    }

    fn entries(&self) -> io::Result<Vec<String>> {
        Self::sorted_names(&self.root)
    }

    fn read_attribute(&self, path: &str) -> io::Result<String> {
        fs::read_to_string(self.root.join(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.root.join(path).exists()
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        Self::sorted_names(&self.root.join(path))
    }

    fn read_link(&self, path: &str) -> io::Result<PathBuf> {
        fs::read_link(self.root.join(path))
    }
}
