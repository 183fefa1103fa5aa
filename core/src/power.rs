//! Disk flushing and the delayed reboot both workflows end with.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub trait PowerControl: Send + Sync {
    /// Flush all pending writes to every mounted filesystem.
    fn sync_disks(&self);

    /// Reboot immediately, skipping the normal shutdown sequence.
    fn reboot_now(&self) -> io::Result<()>;
}

#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Arms one-shot reboots on their own task so the caller can return (and an
/// API response can be flushed) before the machine goes away.
#[derive(Clone)]
pub struct RebootScheduler {
    power: Arc<dyn PowerControl>,
    clock: Arc<dyn Clock>,
}

impl RebootScheduler {
    pub fn new(power: Arc<dyn PowerControl>, clock: Arc<dyn Clock>) -> Self {
        Self { power, clock }
    }

    /// Must be called from within a tokio runtime. There is no way to cancel
    /// the reboot once scheduled.
    pub fn schedule(&self, delay: Duration) -> ScheduledReboot {
        let power = Arc::clone(&self.power);
        let clock = Arc::clone(&self.clock);

        log::info!("Reboot scheduled in {:?}", delay);
        let handle = tokio::spawn(async move {
            clock.sleep(delay).await;
            if let Err(e) = power.reboot_now() {
                log::error!("Failed to trigger reboot: {}", e);
            }
        });

        ScheduledReboot { delay, handle }
    }
}

/// Handle to an armed reboot. Dropping it leaves the reboot armed.
#[derive(Debug)]
pub struct ScheduledReboot {
    delay: Duration,
    handle: JoinHandle<()>,
}

impl ScheduledReboot {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait until the reboot trigger has been written. Only useful when the
    /// trigger does not actually take the machine down, i.e. in tests.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            log::error!("Reboot task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{InstantClock, RecordingPower};

    #[tokio::test]
    async fn test_scheduled_reboot_fires_after_delay() {
        let power = Arc::new(RecordingPower::default());
        let clock = Arc::new(InstantClock::default());
        let scheduler = RebootScheduler::new(power.clone(), clock.clone());

        let reboot = scheduler.schedule(Duration::from_secs(1));
        assert_eq!(reboot.delay(), Duration::from_secs(1));
        reboot.wait().await;

        assert_eq!(power.reboots(), 1);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_reboot_failure_does_not_panic() {
        let power = Arc::new(RecordingPower::failing());
        let scheduler = RebootScheduler::new(power.clone(), Arc::new(InstantClock::default()));

        scheduler.schedule(Duration::ZERO).wait().await;
        assert_eq!(power.reboots(), 1);
    }
}
