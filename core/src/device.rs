use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A block device as seen by enumeration: its volatile kernel name plus the
/// stable link under the by-id namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDeviceRef {
    pub kernel_name: PathBuf,
    pub stable_id: String,
    pub size: u64,
}

impl BlockDeviceRef {
    pub fn new(kernel_name: impl Into<PathBuf>, stable_id: impl Into<String>, size: u64) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            stable_id: stable_id.into(),
            size,
        }
    }

    pub fn is(&self, device: &Path) -> bool {
        self.kernel_name == device
    }
}

// Exclusion checks only ever care about the kernel name.
impl PartialEq for BlockDeviceRef {
    fn eq(&self, other: &Self) -> bool {
        self.kernel_name == other.kernel_name
    }
}

impl Eq for BlockDeviceRef {}

impl fmt::Display for BlockDeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stable_id.is_empty() {
            write!(f, "{}", self.kernel_name.display())
        } else {
            write!(f, "{} ({})", self.kernel_name.display(), self.stable_id)
        }
    }
}

/// Known partition type descriptions and the on-disk type codes they map to.
///
/// The descriptions are the strings the partitioning tool prints when asked
/// about an existing partition.
pub const PARTITION_TYPE_CODES: &[(&str, &str)] = &[
    ("EFI system partition", "EF00"),
    ("Linux filesystem", "8300"),
    ("Linux x86-64 /usr verity signature", "8385"),
    ("Linux x86-64 /usr verity", "8319"),
    ("Linux x86-64 /usr", "8314"),
    ("Linux ARM64 /usr verity signature", "8375"),
    ("Linux ARM64 /usr verity", "831B"),
    ("Linux ARM64 /usr", "8316"),
];

/// Look up the type code for a partition type description.
pub fn partition_type_code(type_name: &str) -> Option<&'static str> {
    PARTITION_TYPE_CODES
        .iter()
        .find(|(name, _)| *name == type_name)
        .map(|(_, code)| *code)
}

/// A partition re-derived from an existing table, ready to be recreated on
/// another device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub index: u32,
    pub type_name: String,
    pub unique_guid: Uuid,
    pub name: String,
    /// Size as the partitioning tool expresses it, e.g. `100.0MiB`.
    pub size: String,
    /// `None` when `type_name` is not in [`PARTITION_TYPE_CODES`].
    pub type_code: Option<String>,
}

impl PartitionSpec {
    pub fn new(
        index: u32,
        type_name: impl Into<String>,
        unique_guid: Uuid,
        name: impl Into<String>,
        size: impl Into<String>,
    ) -> Self {
        let type_name = type_name.into();
        let type_code = partition_type_code(&type_name).map(str::to_string);
        Self {
            index,
            type_name,
            unique_guid,
            name: name.into(),
            size: size.into(),
            type_code,
        }
    }
}

/// Separator between a device name and its partition number.
///
/// NVMe, MMC, loop and mapped optical devices name partitions `<dev>pN`,
/// traditional disks `<dev>N`.
pub fn partition_separator(device: &Path) -> &'static str {
    let device = device.to_string_lossy();
    if device.contains("/nvme")
        || device.contains("/mmcblk")
        || device.contains("/loop")
        || is_mapped_optical(&device)
    {
        "p"
    } else {
        ""
    }
}

/// Path of partition `index` on `device`.
pub fn partition_path(device: &Path, index: u32) -> PathBuf {
    let mut path = device.as_os_str().to_os_string();
    path.push(partition_separator(device));
    path.push(index.to_string());
    PathBuf::from(path)
}

/// Matches `/dev/srN`.
pub fn is_optical_device(device: &Path) -> bool {
    device
        .to_string_lossy()
        .strip_prefix("/dev/sr")
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn is_mapped_optical(device: &str) -> bool {
    device
        .split_once("/mapper/sr")
        .map(|(_, rest)| rest.starts_with(|c: char| c.is_ascii_digit()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_paths_follow_device_naming() {
        assert_eq!(partition_path(Path::new("/dev/sda"), 2), PathBuf::from("/dev/sda2"));
        assert_eq!(partition_path(Path::new("/dev/nvme0n1"), 10), PathBuf::from("/dev/nvme0n1p10"));
        assert_eq!(partition_path(Path::new("/dev/mmcblk0"), 1), PathBuf::from("/dev/mmcblk0p1"));
        assert_eq!(partition_path(Path::new("/dev/loop3"), 4), PathBuf::from("/dev/loop3p4"));
        assert_eq!(partition_path(Path::new("/dev/mapper/sr0"), 5), PathBuf::from("/dev/mapper/sr0p5"));
        assert_eq!(partition_path(Path::new("/dev/vda"), 9), PathBuf::from("/dev/vda9"));
    }

    #[test]
    fn test_efi_type_code_is_independent_of_other_fields() {
        let a = PartitionSpec::new(1, "EFI system partition", Uuid::nil(), "esp", "100.0MiB");
        let b = PartitionSpec::new(
            3,
            "EFI system partition",
            Uuid::from_u128(0x3b6a_0000_1111_2222_3333_4444_5555_6666),
            "other",
            "2.0GiB",
        );

        assert_eq!(a.type_code.as_deref(), Some("EF00"));
        assert_eq!(b.type_code.as_deref(), Some("EF00"));
    }

    #[test]
    fn test_unknown_partition_type_has_no_code() {
        let spec = PartitionSpec::new(4, "Microsoft basic data", Uuid::nil(), "data", "1.0GiB");
        assert_eq!(spec.type_code, None);
    }

    #[test]
    fn test_verity_types_do_not_shadow_each_other() {
        assert_eq!(partition_type_code("Linux x86-64 /usr verity signature"), Some("8385"));
        assert_eq!(partition_type_code("Linux x86-64 /usr verity"), Some("8319"));
        assert_eq!(partition_type_code("Linux x86-64 /usr"), Some("8314"));
    }

    #[test]
    fn test_device_refs_compare_by_kernel_name() {
        let a = BlockDeviceRef::new("/dev/sda", "ata-Disk_A", 10);
        let b = BlockDeviceRef::new("/dev/sda", "ata-Disk_B", 20);
        let c = BlockDeviceRef::new("/dev/sdb", "ata-Disk_A", 10);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_optical_detection() {
        assert!(is_optical_device(Path::new("/dev/sr0")));
        assert!(is_optical_device(Path::new("/dev/sr12")));
        assert!(!is_optical_device(Path::new("/dev/sda")));
        assert!(!is_optical_device(Path::new("/dev/sr")));
    }
}
