/// Test doubles for the host seams - NEVER touch real hardware
use crate::command::{render_command, CommandOutput, CommandRunner};
use crate::power::{Clock, PowerControl};
use crate::progress::ProgressReporter;
use crate::resolver::{DeviceNumber, SysfsView};
use crate::StrataError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Rule {
    program: String,
    args_prefix: Vec<String>,
    output: CommandOutput,
}

impl Rule {
    fn matches(&self, program: &str, args: &[&str]) -> bool {
        self.program == program
            && args.len() >= self.args_prefix.len()
            && self.args_prefix.iter().zip(args).all(|(want, got)| want == got)
    }
}

/// Command runner that answers from canned rules and records every call.
///
/// Rules match on the program name plus a prefix of the arguments; the first
/// matching rule wins. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct FakeCommandRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, program: &str, args_prefix: &[&str], output: CommandOutput) -> Self {
        self.respond(program, args_prefix, output);
        self
    }

    pub fn respond(&self, program: &str, args_prefix: &[&str], output: CommandOutput) {
        self.rules.lock().unwrap().push(Rule {
            program: program.to_string(),
            args_prefix: args_prefix.iter().map(|a| a.to_string()).collect(),
            output,
        });
    }

    /// Every command run so far, rendered as `program arg arg...`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split(' ').next() == Some(program))
            .collect()
    }

    /// Shared handle to the call log, for interleaving with other recorders.
    pub fn call_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, StrataError> {
        self.calls.lock().unwrap().push(render_command(program, args));

        let rules = self.rules.lock().unwrap();
        Ok(rules
            .iter()
            .find(|rule| rule.matches(program, args))
            .map(|rule| rule.output.clone())
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}

/// In-memory block registry.
#[derive(Debug, Default, Clone)]
pub struct FakeSysfs {
    anchors: HashMap<PathBuf, DeviceNumber>,
    entries: BTreeSet<String>,
    attributes: HashMap<String, String>,
    dirs: HashMap<String, BTreeSet<String>>,
    links: HashMap<String, PathBuf>,
}

impl FakeSysfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_anchor(mut self, path: impl Into<PathBuf>, number: DeviceNumber) -> Self {
        self.anchors.insert(path.into(), number);
        self
    }

    /// Registry entry with its `dev` attribute.
    pub fn with_entry(mut self, name: &str, dev: &str) -> Self {
        self.entries.insert(name.to_string());
        self.attributes.insert(format!("{}/dev", name), format!("{}\n", dev));
        self
    }

    pub fn with_attribute(mut self, path: &str, value: &str) -> Self {
        self.attributes.insert(path.to_string(), format!("{}\n", value));
        self
    }

    pub fn with_link(mut self, path: &str, target: impl Into<PathBuf>) -> Self {
        self.links.insert(path.to_string(), target.into());
        self
    }

    pub fn with_slave(mut self, entry: &str, slave: &str, target: impl Into<PathBuf>) -> Self {
        self.dirs
            .entry(format!("{}/slaves", entry))
            .or_default()
            .insert(slave.to_string());
        self.links.insert(format!("{}/slaves/{}", entry, slave), target.into());
        self
    }

    fn not_found(path: &str) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("{}: no such file or directory", path))
    }
}

impl SysfsView for FakeSysfs {
    fn device_number(&self, path: &Path) -> io::Result<DeviceNumber> {
        self.anchors
            .get(path)
            .copied()
            .ok_or_else(|| Self::not_found(&path.to_string_lossy()))
    }

    fn entries(&self) -> io::Result<Vec<String>> {
        Ok(self.entries.iter().cloned().collect())
    }

    fn read_attribute(&self, path: &str) -> io::Result<String> {
        self.attributes.get(path).cloned().ok_or_else(|| Self::not_found(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.entries.contains(path)
            || self.attributes.contains_key(path)
            || self.dirs.contains_key(path)
            || self.links.contains_key(path)
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        self.dirs
            .get(path)
            .map(|names| names.iter().cloned().collect())
            .ok_or_else(|| Self::not_found(path))
    }

    fn read_link(&self, path: &str) -> io::Result<PathBuf> {
        self.links.get(path).cloned().ok_or_else(|| Self::not_found(path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Message(String),
    Progress(u64, u64),
    Done,
}

/// Progress reporter that remembers everything it was told.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Message(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.events().contains(&ProgressEvent::Done)
    }
}

impl ProgressReporter for RecordingProgress {
    fn update(&self, message: &str) {
        self.events.lock().unwrap().push(ProgressEvent::Message(message.to_string()));
    }

    fn update_progress(&self, current: u64, max: u64) {
        self.events.lock().unwrap().push(ProgressEvent::Progress(current, max));
    }

    fn done(&self) {
        self.events.lock().unwrap().push(ProgressEvent::Done);
    }
}

/// Power control that counts instead of acting.
#[derive(Debug, Default)]
pub struct RecordingPower {
    syncs: AtomicUsize,
    reboots: AtomicUsize,
    fail_reboot: bool,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl RecordingPower {
    /// Reboot requests fail with an I/O error.
    pub fn failing() -> Self {
        Self {
            fail_reboot: true,
            ..Self::default()
        }
    }

    /// Also append `sync`/`reboot` to a shared call log.
    pub fn with_log(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            log: Some(log),
            ..Self::default()
        }
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }

    fn record(&self, what: &str) {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(what.to_string());
        }
    }
}

impl PowerControl for RecordingPower {
    fn sync_disks(&self) {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        self.record("sync");
    }

    fn reboot_now(&self) -> io::Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        self.record("reboot");
        if self.fail_reboot {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "reboot denied"));
        }
        Ok(())
    }
}

type SleepAction = Box<dyn FnOnce() + Send>;

/// Clock whose sleeps return immediately. Can run an action once a given
/// number of sleeps has happened, to change the world under a polling loop.
#[derive(Default)]
pub struct InstantClock {
    sleeps: Mutex<Vec<Duration>>,
    action: Mutex<Option<(usize, SleepAction)>>,
}

impl InstantClock {
    pub fn after_sleeps(count: usize, action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            sleeps: Mutex::new(Vec::new()),
            action: Mutex::new(Some((count, Box::new(action)))),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for InstantClock {
    async fn sleep(&self, duration: Duration) {
        let count = {
            let mut sleeps = self.sleeps.lock().unwrap();
            sleeps.push(duration);
            sleeps.len()
        };

        let due = {
            let mut action = self.action.lock().unwrap();
            match action.as_ref() {
                Some((after, _)) if count >= *after => action.take().map(|(_, run)| run),
                _ => None,
            }
        };
        if let Some(run) = due {
            run();
        }

        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_runner_first_matching_rule_wins() {
        let runner = FakeCommandRunner::new()
            .on("sgdisk", &["-i", "1"], CommandOutput::ok("first"))
            .on("sgdisk", &[], CommandOutput::failed(2, "fallback"));

        let info = runner.run("sgdisk", &["-i", "1", "/dev/sda"]).await.unwrap();
        assert_eq!(info.stdout, "first");

        let other = runner.run("sgdisk", &["-v", "/dev/sda"]).await.unwrap();
        assert_eq!(other.status, Some(2));

        let unknown = runner.run("swapoff", &["-a"]).await.unwrap();
        assert!(unknown.success());

        assert_eq!(
            runner.calls(),
            vec!["sgdisk -i 1 /dev/sda", "sgdisk -v /dev/sda", "swapoff -a"]
        );
        assert_eq!(runner.calls_to("swapoff"), vec!["swapoff -a"]);
    }

    #[tokio::test]
    async fn test_instant_clock_runs_action_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let clock = InstantClock::after_sleeps(2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..4 {
            clock.sleep(Duration::from_secs(1)).await;
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(clock.sleeps().len(), 4);
    }
}
