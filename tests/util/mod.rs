use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use nas_wake_sync::config::{Config, Credential, MacAddress};
use nas_wake_sync::nas::{
    DeviceSleeper, ManualClock, NetworkWaker, NotificationEvent, Notifier, ProbeError,
    ReachabilityProbe, ServiceReadinessProbe, SleepError, SyncExecutor, SyncOutcome, SyncReport,
    WakeError,
};

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Sets an environment variable and restores the previous value on drop.
#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

// =============================================================================
// Config fixtures
// =============================================================================

#[allow(dead_code)]
pub const SAMPLE_CONFIG: &str = r#"
[nas]
mac_address = "00:11:32:AA:BB:CC"
ip = "192.168.1.50"
ssh_user = "backup"
max_wait_time = 300
ping_interval = 5
ssh_ready_wait = 30
ssh_poll_interval = 5
ssh_max_wait = 50

[backup]
local_dir = "/var/lib/vz/dump"
nas_dir = "/volume1/pve-backup"
"#;

/// Validated config built from [`SAMPLE_CONFIG`].
#[allow(dead_code)]
pub fn sample_config() -> Config {
    Config::from_toml_str(SAMPLE_CONFIG, Path::new("config.toml")).unwrap()
}

// =============================================================================
// Fakes
// =============================================================================

/// Waker that records every MAC it was asked to wake.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeWaker {
    pub fail: bool,
    pub woken: RefCell<Vec<MacAddress>>,
}

#[allow(dead_code)]
impl FakeWaker {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.woken.borrow().len()
    }
}

impl NetworkWaker for FakeWaker {
    fn wake(&self, mac: &MacAddress) -> Result<(), WakeError> {
        self.woken.borrow_mut().push(*mac);
        if self.fail {
            return Err(WakeError::Broadcast(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "broadcast not permitted",
            )));
        }
        Ok(())
    }
}

/// One scripted probe answer.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum Answer {
    Yes,
    No,
    Fatal,
}

/// Probe answers taken in order; once exhausted the last answer repeats
/// (`No` when the script was empty). Each call also advances the clock by
/// `cost`, standing in for the probe's own runtime.
#[allow(dead_code)]
pub struct ScriptedProbe<'a> {
    clock: &'a ManualClock,
    cost: Duration,
    script: RefCell<VecDeque<Answer>>,
    last: Cell<Option<Answer>>,
    calls: RefCell<Vec<Duration>>,
}

#[allow(dead_code)]
impl<'a> ScriptedProbe<'a> {
    pub fn new(clock: &'a ManualClock, script: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            clock,
            cost: Duration::ZERO,
            script: RefCell::new(script.into_iter().collect()),
            last: Cell::new(None),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn never(clock: &'a ManualClock) -> Self {
        Self::new(clock, [Answer::No])
    }

    pub fn with_cost(mut self, cost: Duration) -> Self {
        self.cost = cost;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.borrow().len()
    }

    /// Simulated time of each call, measured from the clock's origin.
    pub fn call_times(&self) -> Vec<Duration> {
        self.calls.borrow().clone()
    }

    fn answer(&self) -> Result<bool, ProbeError> {
        self.calls.borrow_mut().push(self.clock.elapsed());
        let answer = self
            .script
            .borrow_mut()
            .pop_front()
            .or(self.last.get())
            .unwrap_or(Answer::No);
        self.last.set(Some(answer));
        self.clock.advance(self.cost);
        match answer {
            Answer::Yes => Ok(true),
            Answer::No => Ok(false),
            Answer::Fatal => Err(ProbeError::Authentication(
                "Permission denied (publickey)".to_string(),
            )),
        }
    }
}

impl ReachabilityProbe for ScriptedProbe<'_> {
    fn is_reachable(&self, _address: &str) -> Result<bool, ProbeError> {
        self.answer()
    }
}

impl ServiceReadinessProbe for ScriptedProbe<'_> {
    fn is_ready(&self, _address: &str, _credential: &Credential) -> Result<bool, ProbeError> {
        self.answer()
    }
}

/// Executor that returns a canned outcome and records its arguments.
#[allow(dead_code)]
pub struct FakeSync {
    outcome: SyncOutcome,
    pub calls: RefCell<Vec<(Vec<String>, String, String)>>,
}

#[allow(dead_code)]
impl FakeSync {
    pub fn returning(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn exiting(code: i32) -> Self {
        let report = SyncReport {
            exit_code: Some(code),
            files_transferred: Some(3),
            source_bytes: Some(3 * 1024 * 1024),
            ..Default::default()
        };
        let outcome = match code {
            0 => SyncOutcome::Success(report),
            23 | 24 => SyncOutcome::PartialFailure {
                report,
                detail: format!("rsync exited with code {code}: some files vanished"),
            },
            _ => SyncOutcome::HardFailure {
                report,
                detail: format!("rsync exited with code {code}: connection unexpectedly closed"),
            },
        };
        Self::returning(outcome)
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl SyncExecutor for FakeSync {
    fn run_sync(&self, options: &[String], source: &Path, destination: &str) -> SyncOutcome {
        self.calls.borrow_mut().push((
            options.to_vec(),
            source.display().to_string(),
            destination.to_string(),
        ));
        self.outcome.clone()
    }
}

#[allow(dead_code)]
#[derive(Default)]
pub struct FakeSleeper {
    pub fail: bool,
    pub calls: Cell<usize>,
}

impl DeviceSleeper for FakeSleeper {
    fn sleep_device(&self) -> Result<(), SleepError> {
        self.calls.set(self.calls.get() + 1);
        if self.fail {
            return Err(SleepError::Rejected(
                "sudo: a password is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Notifier that keeps every event; optionally fails after recording.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingNotifier {
    pub fail: bool,
    pub events: RefCell<Vec<NotificationEvent>>,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn count(&self) -> usize {
        self.events.borrow().len()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        self.events.borrow_mut().push(event.clone());
        if self.fail {
            anyhow::bail!("webhook returned 500 Internal Server Error");
        }
        Ok(())
    }
}
