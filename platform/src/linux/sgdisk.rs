//! GPT manipulation through `sgdisk`.

use std::path::Path;
use strata_core::{CommandOutput, CommandRunner, PartitionSpec, StrataError};
use uuid::Uuid;

const NO_TABLE_MARKER: &str = "Creating new GPT entries in memory";
const DAMAGED_MAIN_HEADER_MARKER: &str =
    "Caution: invalid main GPT header, but valid backup; regenerating main header";

/// What `sgdisk -v` found on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Absent,
    Present,
    /// Main header gone but backup intact, typically a partially zeroed disk.
    Damaged,
}

pub struct Sgdisk<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Sgdisk<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    pub async fn verify(&self, device: &Path) -> Result<TableState, StrataError> {
        let device = device.to_string_lossy();
        let output = self.runner.run("sgdisk", &["-v", &device]).await?;

        if !output.success() {
            if output.mentions(DAMAGED_MAIN_HEADER_MARKER) {
                return Ok(TableState::Damaged);
            }
            return Err(failure(&["-v", &device], &output));
        }

        if output.mentions(NO_TABLE_MARKER) {
            Ok(TableState::Absent)
        } else {
            Ok(TableState::Present)
        }
    }

    /// Re-derive partition `index` of `device` from `sgdisk -i`.
    pub async fn partition_info(&self, device: &Path, index: u32) -> Result<PartitionSpec, StrataError> {
        let device = device.to_string_lossy();
        let index_arg = index.to_string();
        let output = self.runner.run_checked("sgdisk", &["-i", &index_arg, &device]).await?;

        // sgdisk exits with zero for a partition that isn't there.
        if output.mentions("does not exist") {
            return Err(StrataError::SubprocessFailure {
                command: format!("sgdisk -i {} {}", index, device),
                status: output.status,
                diagnostic: output.diagnostic().to_string(),
            });
        }

        parse_partition_info(index, &output.stdout)
    }

    /// Create `spec` on `device` with the same size, GUID and name.
    pub async fn create_partition(&self, device: &Path, spec: &PartitionSpec) -> Result<(), StrataError> {
        let code = spec.type_code.as_deref().ok_or_else(|| {
            StrataError::InvalidInput(format!(
                "Unrecognized partition type '{}' for partition {}",
                spec.type_name, spec.index
            ))
        })?;

        let device = device.to_string_lossy();
        let new = format!("{}::+{}", spec.index, spec.size);
        let guid = format!("{}:{}", spec.index, spec.unique_guid);
        let type_code = format!("{}:{}", spec.index, code);
        let name = format!("{}:{}", spec.index, spec.name);

        log::info!("Creating partition {} ({}) on {}", spec.index, spec.type_name, device);
        self.runner
            .run_checked("sgdisk", &["-n", &new, "-u", &guid, "-t", &type_code, "-c", &name, &device])
            .await?;
        Ok(())
    }

    pub async fn delete_partition(&self, device: &Path, index: u32) -> Result<(), StrataError> {
        let device = device.to_string_lossy();
        let index = index.to_string();

        log::info!("Deleting partition {} on {}", index, device);
        self.runner.run_checked("sgdisk", &["-d", &index, &device]).await?;
        Ok(())
    }

    /// Destroy both GPT copies. sgdisk reports an error whenever main and
    /// backup disagree, so the exit status is not meaningful here.
    pub async fn zap(&self, device: &Path) -> Result<(), StrataError> {
        let device = device.to_string_lossy();

        log::info!("Zapping partition table on {}", device);
        let output = self.runner.run("sgdisk", &["-Z", &device]).await?;
        if !output.success() {
            log::debug!("sgdisk -Z {}: {}", device, output.diagnostic());
        }
        Ok(())
    }
}

fn failure(args: &[&str], output: &CommandOutput) -> StrataError {
    StrataError::SubprocessFailure {
        command: strata_core::command::render_command("sgdisk", args),
        status: output.status,
        diagnostic: output.diagnostic().to_string(),
    }
}

fn field<'o>(output: &'o str, label: &str) -> Option<&'o str> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(label))
        .map(str::trim)
}

/// Text between the first `(` and the last `)`.
fn parenthesized(value: &str) -> Option<&str> {
    let start = value.find('(')?;
    let end = value.rfind(')')?;
    (end > start).then(|| &value[start + 1..end])
}

fn parse_partition_info(index: u32, output: &str) -> Result<PartitionSpec, StrataError> {
    let missing = |what: &str| {
        StrataError::InvalidInput(format!("sgdisk output for partition {} has no {}", index, what))
    };

    let type_name = field(output, "Partition GUID code:")
        .and_then(parenthesized)
        .ok_or_else(|| missing("type"))?;

    let guid = field(output, "Partition unique GUID:").ok_or_else(|| missing("unique GUID"))?;
    let unique_guid = Uuid::parse_str(guid)
        .map_err(|e| StrataError::InvalidInput(format!("Bad partition GUID '{}': {}", guid, e)))?;

    let name = field(output, "Partition name:")
        .map(|name| name.trim_matches('\''))
        .ok_or_else(|| missing("name"))?;

    let size: String = field(output, "Partition size:")
        .and_then(parenthesized)
        .ok_or_else(|| missing("size"))?
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    Ok(PartitionSpec::new(index, type_name, unique_guid, name, size))
}
