/// Push-only status channel towards whatever is showing progress to the
/// operator (console, CLI). Implementations must not block.
pub trait ProgressReporter: Send + Sync {
    fn update(&self, message: &str);
    fn update_progress(&self, current: u64, max: u64);
    fn done(&self);
}

/// Reporter that forwards everything to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn update(&self, message: &str) {
        log::info!("{}", message);
    }

    fn update_progress(&self, current: u64, max: u64) {
        if max == 0 {
            return;
        }
        log::info!("Progress: {}/{} ({}%)", current, max, current * 100 / max);
    }

    fn done(&self) {
        log::info!("Done");
    }
}
