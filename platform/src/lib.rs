#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::{
    enumerate_block_devices, is_read_only, DeviceClass, HostSysfs, Sgdisk, SysrqPower, TableState,
};
