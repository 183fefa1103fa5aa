pub mod encryption;
pub mod health;
pub mod host;
pub mod install;
pub mod reset;

pub use encryption::{EncryptionKeyRecord, EncryptionManager};
pub use health::StorageHealthMonitor;
pub use host::Host;
pub use install::{InstallPlan, Installer, SourceMedia};
pub use reset::{ResetOrchestrator, ResetRequest};
