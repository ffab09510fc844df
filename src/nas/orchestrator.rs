//! The wake -> reach -> settle -> ready -> sync state machine.
//!
//! Every stage failure is turned into a terminal [`RunResult`] here; nothing
//! below this boundary decides whether the run as a whole failed. The machine
//! only moves forward and never retries the pipeline.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::clock::Clock;
use super::notify::{NotificationEvent, Notifier};
use super::poller::{BoundedPoller, PollOutcome};
use super::power::DeviceSleeper;
use super::probe::{ReachabilityProbe, ServiceReadinessProbe};
use super::sync::{SyncExecutor, SyncOutcome, SyncReport};
use super::waker::NetworkWaker;
use crate::config::{SyncConfig, TargetConfig};

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// The wake signal could not be sent, or the device never answered pings.
    WakeTimeout,
    /// The device answered pings but the service never accepted a session.
    ReadinessTimeout,
    SyncFailed,
    /// The transfer ran but some files could not be fully processed.
    SyncPartial,
}

impl Outcome {
    /// Process exit status for this outcome: 0 only on success.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::WakeTimeout => 10,
            Self::ReadinessTimeout => 11,
            Self::SyncFailed => 12,
            Self::SyncPartial => 13,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::WakeTimeout => "wake_timeout",
            Self::ReadinessTimeout => "readiness_timeout",
            Self::SyncFailed => "sync_failed",
            Self::SyncPartial => "sync_partial",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Waking,
    AwaitingReachable,
    Settling,
    AwaitingReady,
    Syncing,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waking => "waking",
            Self::AwaitingReachable => "awaiting_reachable",
            Self::Settling => "settling",
            Self::AwaitingReady => "awaiting_ready",
            Self::Syncing => "syncing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed: Duration,
}

/// What happened with the optional sleep signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum SleepSignal {
    NotRequested,
    Sent,
    Failed(String),
}

/// The single, immutable record of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub outcome: Outcome,
    /// Last stage entered.
    pub stage_reached: Stage,
    pub stage_timings: Vec<StageTiming>,
    pub total_elapsed: Duration,
    pub detail: Option<String>,
    pub sync: Option<SyncReport>,
    pub sleep_signal: SleepSignal,
}

impl RunResult {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn stage_elapsed(&self, stage: Stage) -> Option<Duration> {
        self.stage_timings
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.elapsed)
    }
}

/// The capabilities a run is wired from.
pub struct Collaborators<'a> {
    pub clock: &'a dyn Clock,
    pub waker: &'a dyn NetworkWaker,
    pub reachability: &'a dyn ReachabilityProbe,
    pub readiness: &'a dyn ServiceReadinessProbe,
    pub executor: &'a dyn SyncExecutor,
    /// `None` skips the sleep signal regardless of config.
    pub sleeper: Option<&'a dyn DeviceSleeper>,
    pub notifier: &'a dyn Notifier,
}

/// Where the machine is. Idle is the moment before `Running(Waking)`.
enum State {
    Running(Stage),
    Done(Terminal),
}

/// Terminal data gathered before the [`RunResult`] is assembled.
struct Terminal {
    outcome: Outcome,
    detail: Option<String>,
    sync: Option<SyncReport>,
}

impl Terminal {
    fn fail(outcome: Outcome, detail: impl Into<String>) -> State {
        State::Done(Self {
            outcome,
            detail: Some(detail.into()),
            sync: None,
        })
    }
}

pub struct Orchestrator<'a> {
    target: &'a TargetConfig,
    sync: &'a SyncConfig,
    parts: Collaborators<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        target: &'a TargetConfig,
        sync: &'a SyncConfig,
        parts: Collaborators<'a>,
    ) -> Self {
        Self {
            target,
            sync,
            parts,
        }
    }

    /// `user@address:dir` as handed to the transfer tool.
    pub fn destination(&self) -> String {
        format!(
            "{}:{}",
            self.target.credential.login(&self.target.ip),
            self.sync.destination
        )
    }

    /// Drive the machine to `Done`, emit exactly one notification, return the result.
    pub fn run(&self) -> RunResult {
        let clock = self.parts.clock;
        let started = clock.now();
        let mut timings: Vec<StageTiming> = Vec::new();
        let mut stage_reached = Stage::Waking;

        tracing::info!(
            ip = %self.target.ip,
            mac = %self.target.mac,
            "backup sync started"
        );

        let mut state = State::Running(Stage::Waking);
        let terminal = loop {
            match state {
                State::Running(stage) => {
                    stage_reached = stage;
                    let entered = clock.now();
                    state = self.step(stage);
                    timings.push(StageTiming {
                        stage,
                        elapsed: clock.since(entered),
                    });
                }
                State::Done(terminal) => break terminal,
            }
        };

        let sleep_signal = self.maybe_sleep(terminal.outcome);

        let result = RunResult {
            outcome: terminal.outcome,
            stage_reached,
            stage_timings: timings,
            total_elapsed: clock.since(started),
            detail: terminal.detail,
            sync: terminal.sync,
            sleep_signal,
        };

        self.log_result(&result);
        self.notify(&result);
        result
    }

    fn step(&self, stage: Stage) -> State {
        match stage {
            Stage::Waking => self.wake(),
            Stage::AwaitingReachable => self.await_reachable(),
            Stage::Settling => {
                tracing::info!(
                    delay_secs = self.target.settle_delay.as_secs(),
                    "waiting for services to settle"
                );
                self.parts.clock.sleep(self.target.settle_delay);
                State::Running(Stage::AwaitingReady)
            }
            Stage::AwaitingReady => self.await_ready(),
            Stage::Syncing => self.run_sync(),
        }
    }

    fn wake(&self) -> State {
        match self.parts.waker.wake(&self.target.mac) {
            Ok(()) => State::Running(Stage::AwaitingReachable),
            Err(e) => {
                tracing::error!(error = %e, "failed to send WOL packet");
                Terminal::fail(Outcome::WakeTimeout, format!("Failed to send WOL packet: {e}"))
            }
        }
    }

    fn await_reachable(&self) -> State {
        let ip = self.target.ip.as_str();
        tracing::info!(
            ip,
            max_wait_secs = self.target.max_wait.as_secs(),
            "waiting for NAS to respond to ping"
        );

        let poller = BoundedPoller::new(
            self.parts.clock,
            self.target.poll_interval,
            self.target.max_wait,
        );
        match poller.poll_until_ready(|| self.parts.reachability.is_reachable(ip)) {
            Ok(PollOutcome::Reached { elapsed, attempts }) => {
                tracing::info!(
                    ip,
                    attempts,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "NAS responded to ping"
                );
                State::Running(Stage::Settling)
            }
            Ok(PollOutcome::TimedOut { elapsed, attempts }) => {
                tracing::error!(ip, attempts, "NAS did not respond to ping");
                Terminal::fail(
                    Outcome::WakeTimeout,
                    format!(
                        "NAS {ip} unreachable: no ping reply after {} attempts over {}s",
                        attempts,
                        elapsed.as_secs()
                    ),
                )
            }
            Err(e) => {
                tracing::error!(ip, error = %e, "reachability probe failed");
                Terminal::fail(
                    Outcome::WakeTimeout,
                    format!("NAS {ip} reachability could not be checked: {e}"),
                )
            }
        }
    }

    fn await_ready(&self) -> State {
        let ip = self.target.ip.as_str();
        let credential = &self.target.credential;
        tracing::info!(ip, "waiting for SSH service to be ready");

        let poller = BoundedPoller::new(
            self.parts.clock,
            self.target.ready_poll_interval,
            self.target.ready_max_wait,
        );
        match poller.poll_until_ready(|| self.parts.readiness.is_ready(ip, credential)) {
            Ok(PollOutcome::Reached { attempts, .. }) => {
                tracing::info!(ip, attempts, "SSH service is ready");
                State::Running(Stage::Syncing)
            }
            Ok(PollOutcome::TimedOut { elapsed, attempts }) => {
                tracing::error!(ip, attempts, "SSH service not ready");
                Terminal::fail(
                    Outcome::ReadinessTimeout,
                    format!(
                        "NAS {ip} answers ping but SSH service never became ready \
                         ({} attempts over {}s)",
                        attempts,
                        elapsed.as_secs()
                    ),
                )
            }
            Err(e) => {
                tracing::error!(ip, error = %e, "SSH readiness check failed permanently");
                Terminal::fail(
                    Outcome::ReadinessTimeout,
                    format!("NAS {ip} answers ping but SSH cannot be used: {e}"),
                )
            }
        }
    }

    fn run_sync(&self) -> State {
        let destination = self.destination();
        let outcome = self.parts.executor.run_sync(
            &self.sync.options,
            &self.sync.source,
            &destination,
        );

        let (outcome, detail, report) = match outcome {
            SyncOutcome::Success(report) => (Outcome::Success, None, report),
            SyncOutcome::PartialFailure { report, detail } => {
                (Outcome::SyncPartial, Some(detail), report)
            }
            SyncOutcome::HardFailure { report, detail } => {
                (Outcome::SyncFailed, Some(detail), report)
            }
        };
        State::Done(Terminal {
            outcome,
            detail,
            sync: Some(report),
        })
    }

    fn maybe_sleep(&self, outcome: Outcome) -> SleepSignal {
        if !outcome.is_success() || !self.target.shutdown_after_sync {
            return SleepSignal::NotRequested;
        }
        let Some(sleeper) = self.parts.sleeper else {
            return SleepSignal::NotRequested;
        };
        match sleeper.sleep_device() {
            Ok(()) => SleepSignal::Sent,
            Err(e) => {
                tracing::warn!(error = %e, "failed to shutdown NAS, please check manually");
                SleepSignal::Failed(e.to_string())
            }
        }
    }

    fn log_result(&self, result: &RunResult) {
        let total_secs = result.total_elapsed.as_secs_f64();
        if result.outcome.is_success() {
            tracing::info!(total_secs, "backup process completed successfully");
        } else {
            tracing::error!(
                outcome = %result.outcome,
                stage = %result.stage_reached,
                detail = result.detail.as_deref().unwrap_or(""),
                total_secs,
                "backup process failed"
            );
        }
    }

    fn notify(&self, result: &RunResult) {
        let event = NotificationEvent::from_result(result, &self.target.ip);
        if let Err(e) = self.parts.notifier.notify(&event) {
            tracing::warn!(error = %format!("{e:#}"), "failed to deliver notification");
        }
    }
}
