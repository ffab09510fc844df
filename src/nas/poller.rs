//! Bounded retry loop shared by the reachability and readiness stages.

use std::time::Duration;

use super::clock::Clock;

/// How a bounded poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The probe returned `true` on attempt `attempts`.
    Reached { elapsed: Duration, attempts: u32 },
    /// The deadline elapsed before any attempt returned `true`.
    TimedOut { elapsed: Duration, attempts: u32 },
}

impl PollOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, Self::Reached { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Reached { elapsed, .. } | Self::TimedOut { elapsed, .. } => *elapsed,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Reached { attempts, .. } | Self::TimedOut { attempts, .. } => *attempts,
        }
    }
}

/// Invokes a probe every `interval` until it succeeds or `deadline` elapses.
///
/// The first attempt happens immediately. Sleeps are clipped to the time left
/// before the deadline, and no attempt is started once the deadline has been
/// reached. A probe error stops polling and is returned as-is: errors mean
/// "waiting will not help", not "not yet".
pub struct BoundedPoller<'a> {
    clock: &'a dyn Clock,
    interval: Duration,
    deadline: Duration,
}

impl<'a> BoundedPoller<'a> {
    pub fn new(clock: &'a dyn Clock, interval: Duration, deadline: Duration) -> Self {
        Self {
            clock,
            interval,
            deadline,
        }
    }

    pub fn poll_until_ready<E, F>(&self, mut probe: F) -> Result<PollOutcome, E>
    where
        F: FnMut() -> Result<bool, E>,
    {
        let start = self.clock.now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if probe()? {
                return Ok(PollOutcome::Reached {
                    elapsed: self.clock.since(start),
                    attempts,
                });
            }

            let elapsed = self.clock.since(start);
            if elapsed >= self.deadline {
                return Ok(PollOutcome::TimedOut { elapsed, attempts });
            }

            tracing::trace!(attempt = attempts, ?elapsed, "probe not ready, sleeping");
            self.clock.sleep(self.interval.min(self.deadline - elapsed));

            let elapsed = self.clock.since(start);
            if elapsed >= self.deadline {
                return Ok(PollOutcome::TimedOut { elapsed, attempts });
            }
        }
    }
}
