use serde::{Deserialize, Deserializer};
use strata_core::{BlockDeviceRef, CommandRunner, StrataError};

/// Device classes, in the order install targets are preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Nvme,
    Scsi,
    Virtual,
}

impl DeviceClass {
    pub const PRIORITY: [DeviceClass; 3] = [DeviceClass::Nvme, DeviceClass::Scsi, DeviceClass::Virtual];

    fn lsblk_filter(self) -> &'static str {
        match self {
            DeviceClass::Nvme => "-N",
            DeviceClass::Scsi => "-S",
            DeviceClass::Virtual => "-v",
        }
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    kname: String,
    #[serde(rename = "id-link", default)]
    id_link: Option<String>,
    #[serde(default, deserialize_with = "size_field")]
    size: u64,
}

// Older lsblk releases quote numbers even with --bytes.
fn size_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
        Missing(()),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Raw::Missing(_) => Ok(0),
    }
}

fn parse_lsblk_output(json: &str) -> Result<Vec<BlockDeviceRef>, StrataError> {
    // lsblk prints nothing at all when a class has no devices.
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let output: LsblkOutput = serde_json::from_str(json)?;
    Ok(output
        .blockdevices
        .into_iter()
        .map(|dev| BlockDeviceRef::new(dev.kname, dev.id_link.unwrap_or_default(), dev.size))
        .collect())
}

/// List whole disks of one class, in the order the kernel enumerates them.
pub async fn enumerate_class(
    runner: &dyn CommandRunner,
    class: DeviceClass,
) -> Result<Vec<BlockDeviceRef>, StrataError> {
    let output = runner
        .run_checked(
            "lsblk",
            &[class.lsblk_filter(), "-iJnpb", "-e", "1,2", "-o", "KNAME,ID_LINK,SIZE"],
        )
        .await?;

    parse_lsblk_output(&output.stdout)
}

/// Every whole disk on the system: NVMe first, then SCSI, then virtual.
/// A device reported by more than one class keeps its first position.
pub async fn enumerate_block_devices(runner: &dyn CommandRunner) -> Result<Vec<BlockDeviceRef>, StrataError> {
    let mut devices: Vec<BlockDeviceRef> = Vec::new();

    for class in DeviceClass::PRIORITY {
        for device in enumerate_class(runner, class).await? {
            if !devices.contains(&device) {
                devices.push(device);
            }
        }
    }

    log::debug!("Enumerated {} block device(s)", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use strata_core::test_utils::FakeCommandRunner;
    use strata_core::CommandOutput;

    const NVME: &str = r#"{"blockdevices": [
        {"kname": "/dev/nvme0n1", "id-link": "nvme-Samsung_SSD_980_S64DNF0R", "size": 500107862016},
        {"kname": "/dev/nvme1n1", "id-link": "nvme-WD_Blue_SN570_22123", "size": 1000204886016}
    ]}"#;

    const SCSI: &str = r#"{"blockdevices": [
        {"kname": "/dev/sda", "id-link": "usb-SanDisk_Cruzer_4C5300", "size": "15610576896"},
        {"kname": "/dev/sr0", "id-link": null, "size": null}
    ]}"#;

    #[tokio::test]
    async fn test_classes_are_concatenated_in_priority_order() {
        let runner = FakeCommandRunner::new()
            .on("lsblk", &["-N"], CommandOutput::ok(NVME))
            .on("lsblk", &["-S"], CommandOutput::ok(SCSI))
            .on("lsblk", &["-v"], CommandOutput::ok(""));

        let devices = enumerate_block_devices(&runner).await.unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.kernel_name.clone()).collect();
        assert_eq!(
            names,
            vec![
                Path::new("/dev/nvme0n1").to_path_buf(),
                Path::new("/dev/nvme1n1").to_path_buf(),
                Path::new("/dev/sda").to_path_buf(),
                Path::new("/dev/sr0").to_path_buf(),
            ]
        );

        assert_eq!(devices[2].size, 15610576896);
        assert_eq!(devices[3].stable_id, "");
        assert_eq!(devices[3].size, 0);

        assert_eq!(
            runner.calls(),
            vec![
                "lsblk -N -iJnpb -e 1,2 -o KNAME,ID_LINK,SIZE",
                "lsblk -S -iJnpb -e 1,2 -o KNAME,ID_LINK,SIZE",
                "lsblk -v -iJnpb -e 1,2 -o KNAME,ID_LINK,SIZE",
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicates_keep_first_class() {
        let runner = FakeCommandRunner::new()
            .on("lsblk", &["-S"], CommandOutput::ok(SCSI))
            .on("lsblk", &["-v"], CommandOutput::ok(SCSI));

        let devices = enumerate_block_devices(&runner).await.unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_lsblk_failure_is_reported() {
        let runner = FakeCommandRunner::new().on("lsblk", &[], CommandOutput::failed(32, "lsblk: unknown option"));

        let result = enumerate_block_devices(&runner).await;
        tokio_test::assert_err!(&result);
        assert!(matches!(result, Err(StrataError::SubprocessFailure { .. })));
    }
}
