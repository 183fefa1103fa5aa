pub mod device;
pub mod mount;
pub mod power;
pub mod sgdisk;
pub mod sysfs;

pub use device::{enumerate_block_devices, DeviceClass};
pub use mount::is_read_only;
pub use power::SysrqPower;
pub use sgdisk::{Sgdisk, TableState};
pub use sysfs::HostSysfs;
