//! Mapping a path to the physical disk it lives on.
//!
//! The kernel exposes the chain through the block registry in sysfs: every
//! entry has a `dev` attribute with its major:minor pair, mapped devices list
//! their backing devices under `slaves/`, and partitions carry a `partition`
//! attribute and live below their parent disk.

use crate::StrataError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How many mapped devices may be stacked on top of the disk (a CD-ROM image
/// mapped through a loop device is the deepest case).
const MAX_MAPPED_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceNumber {
    pub major: u64,
    pub minor: u64,
}

impl DeviceNumber {
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for DeviceNumber {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| StrataError::InvalidInput(format!("Malformed device number '{}'", s.trim())))?;

        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| StrataError::InvalidInput(format!("Malformed device number '{}'", s.trim())))
        };

        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

/// Read-only view of the kernel's block-device registry.
///
/// Paths handed to the `read_*`/`list_dir`/`exists` methods are relative to
/// the registry root, e.g. `dm-0/slaves` or `sda3/partition`.
pub trait SysfsView: Send + Sync {
    /// Device number of the filesystem `path` lives on.
    fn device_number(&self, path: &Path) -> io::Result<DeviceNumber>;

    /// Top-level registry entries, sorted by name.
    fn entries(&self) -> io::Result<Vec<String>>;

    fn read_attribute(&self, path: &str) -> io::Result<String>;

    fn exists(&self, path: &str) -> bool;

    /// Directory listing, sorted by name.
    fn list_dir(&self, path: &str) -> io::Result<Vec<String>>;

    fn read_link(&self, path: &str) -> io::Result<PathBuf>;
}

/// Find the registry entry whose `dev` attribute equals `number`.
pub fn find_entry(view: &dyn SysfsView, number: DeviceNumber) -> Result<String, StrataError> {
    for entry in view.entries()? {
        let Ok(dev) = view.read_attribute(&format!("{}/dev", entry)) else {
            continue;
        };

        match dev.parse::<DeviceNumber>() {
            Ok(candidate) if candidate == number => return Ok(entry),
            Ok(_) => {}
            Err(_) => log::debug!("Ignoring block entry {} with malformed dev '{}'", entry, dev.trim()),
        }
    }

    Err(StrataError::DeviceNotFound(format!(
        "no block device with number {}",
        number
    )))
}

/// Resolve the physical disk backing `anchor`, returned as a path under
/// `dev_root`.
pub fn underlying_device(
    view: &dyn SysfsView,
    anchor: &Path,
    dev_root: &Path,
) -> Result<PathBuf, StrataError> {
    let number = view.device_number(anchor)?;
    let entry = find_entry(view, number)?;
    let disk = disk_for_entry(view, &entry, 0)?;

    log::debug!("{} is backed by {} (via {})", anchor.display(), disk, entry);
    Ok(dev_root.join(disk))
}

fn disk_for_entry(view: &dyn SysfsView, entry: &str, depth: usize) -> Result<String, StrataError> {
    if view.exists(&format!("{}/partition", entry)) {
        let link = view.read_link(entry)?;
        return Ok(parent_disk(entry, &link));
    }

    let slaves = view.list_dir(&format!("{}/slaves", entry))?;
    let Some(first) = slaves.first() else {
        // A whole disk with nothing stacked below it.
        return Ok(entry.to_string());
    };

    let link = view.read_link(&format!("{}/slaves/{}", entry, first))?;
    let slave = link_name(&link).ok_or_else(|| {
        StrataError::DeviceNotFound(format!("unreadable slave link {}", link.display()))
    })?;

    if slave.starts_with("dm-") {
        if depth + 1 >= MAX_MAPPED_DEPTH {
            return Err(StrataError::DeviceNotFound(format!(
                "mapped device chain below {} is too deep",
                entry
            )));
        }
        return disk_for_entry(view, &slave, depth + 1);
    }

    Ok(parent_disk(&slave, &link))
}

/// Partitions sit below their disk (`.../block/sda/sda3`); whole disks sit
/// directly below a `block` directory.
fn parent_disk(name: &str, link: &Path) -> String {
    match link.parent().and_then(link_name) {
        Some(parent) if parent != "block" => parent,
        _ => name.to_string(),
    }
}

fn link_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().to_string())
}
