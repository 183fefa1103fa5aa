pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod power;
pub mod progress;
pub mod resolver;
pub mod seed;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use config::{HostPaths, InstallConfig, InstallOptions, PartitionLayout, StrataConfig};
pub use device::{partition_path, BlockDeviceRef, PartitionSpec};
pub use error::StrataError;
pub use health::{compute_scrub_progress, PoolHealth, ScrubState, ScrubStats};
pub use power::{Clock, PowerControl, RebootScheduler, ScheduledReboot, TokioClock};
pub use progress::{LogProgress, ProgressReporter};
pub use resolver::{underlying_device, DeviceNumber, SysfsView};
pub use seed::SeedBundle;
