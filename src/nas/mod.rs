//! Waking, waiting for, and syncing to the NAS.
//!
//! # Architecture
//!
//! - **waker**: Wake-on-LAN magic packet
//! - **probe**: ping reachability and ssh readiness checks
//! - **poller**: the one bounded retry loop both probes run under
//! - **clock**: time source for every wait (swappable in tests)
//! - **sync**: rsync invocation and exit-status classification
//! - **power**: optional shutdown after a successful sync
//! - **notify**: run notifications (log, Discord webhook)
//! - **orchestrator**: the state machine tying the above together
//!
//! # Flow
//!
//! ```text
//! Idle -> Waking -> AwaitingReachable -> Settling -> AwaitingReady -> Syncing -> Done
//! ```
//!
//! Each arrow only fires once the previous stage resolved; any stage can jump
//! straight to `Done` with a failure outcome.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nas_wake_sync::config::Config;
//! use nas_wake_sync::nas::{Collaborators, Orchestrator, SystemClock, ...};
//!
//! let config = Config::load(path)?;
//! let result = Orchestrator::new(&config.target, &config.sync, collaborators).run();
//! std::process::exit(result.exit_code());
//! ```

pub mod clock;
pub mod notify;
pub mod orchestrator;
pub mod poller;
pub mod power;
pub mod probe;
pub mod sync;
pub mod waker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use notify::{DiscordNotifier, LogNotifier, NotificationEvent, Notifier};
pub use orchestrator::{
    Collaborators, Orchestrator, Outcome, RunResult, SleepSignal, Stage, StageTiming,
};
pub use poller::{BoundedPoller, PollOutcome};
pub use power::{DeviceSleeper, SleepError, SshShutdown};
pub use probe::{
    PingProbe, ProbeError, ReachabilityProbe, ServiceReadinessProbe, SshReadinessProbe,
};
pub use sync::{RsyncExecutor, SyncExecutor, SyncOutcome, SyncReport};
pub use waker::{MagicPacketWaker, NetworkWaker, WakeError};
