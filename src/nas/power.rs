//! Sleep signal sent after a successful transfer.

use std::process::Output;
use std::time::Duration;

use thiserror::Error;

use super::probe::{fatal_ssh_error, ssh_command};
use crate::config::Credential;

#[derive(Error, Debug)]
pub enum SleepError {
    #[error("Failed to execute ssh: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Shutdown command rejected: {0}")]
    Rejected(String),
}

/// Asks the device to power down. Failure never changes a run's outcome.
pub trait DeviceSleeper {
    fn sleep_device(&self) -> Result<(), SleepError>;
}

/// Runs the configured shutdown command over ssh.
#[derive(Debug, Clone)]
pub struct SshShutdown {
    address: String,
    credential: Credential,
    command: String,
    connect_timeout: Duration,
}

impl SshShutdown {
    pub fn new(
        address: impl Into<String>,
        credential: Credential,
        command: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            credential,
            command: command.into(),
            connect_timeout,
        }
    }
}

impl DeviceSleeper for SshShutdown {
    fn sleep_device(&self) -> Result<(), SleepError> {
        tracing::info!(address = %self.address, command = %self.command, "shutting down NAS");

        let mut cmd = ssh_command(&self.address, &self.credential, self.connect_timeout);
        cmd.arg(&self.command);
        let output = cmd.output().map_err(SleepError::Spawn)?;
        classify_shutdown(&output)
    }
}

/// Exit 0 is sent. ssh's own exit 255 also counts as sent when the remote end
/// went away mid-session, unless stderr shows a fatal ssh error.
fn classify_shutdown(output: &Output) -> Result<(), SleepError> {
    if output.status.success() {
        tracing::info!("shutdown command sent");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    match output.status.code() {
        Some(255) if fatal_ssh_error(stderr).is_none() && connection_dropped(stderr) => {
            tracing::info!("shutdown command sent (connection interruption is normal)");
            Ok(())
        }
        _ => Err(SleepError::Rejected(if stderr.is_empty() {
            output.status.to_string()
        } else {
            stderr.to_string()
        })),
    }
}

fn connection_dropped(stderr: &str) -> bool {
    stderr.is_empty()
        || stderr.contains("closed by remote host")
        || stderr.contains("Connection reset")
        || stderr.contains("Broken pipe")
}
