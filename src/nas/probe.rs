//! Reachability and readiness probes.
//!
//! Two single-shot checks, each driven repeatedly by the
//! [`BoundedPoller`](super::poller::BoundedPoller):
//!
//! - **Reachability**: one ICMP echo through the system `ping`. Answers "is
//!   the box on the network yet".
//! - **Readiness**: one batch-mode `ssh` session running `true`, closed right
//!   away. Answers "will the transfer be able to log in".
//!
//! # Design
//!
//! Both probes shell out rather than speaking ICMP/SSH themselves, so they pick
//! up the same `ssh` binary, agent, known_hosts and config that rsync will use
//! a moment later. Their stderr is classified into "not yet" (`Ok(false)`,
//! keep polling) versus conditions that waiting cannot fix (`Err`, stop now).

use std::io::ErrorKind;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use thiserror::Error;

use crate::config::Credential;

/// A probe failure that retrying will not resolve.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to execute {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Not permitted to run {tool}: {detail}")]
    NotPermitted { tool: &'static str, detail: String },

    #[error("SSH authentication failed: {0}")]
    Authentication(String),

    #[error("Host key verification failed: {0}")]
    HostKey(String),

    #[error("Invalid target address: {0}")]
    InvalidTarget(String),
}

/// One network-level liveness check.
pub trait ReachabilityProbe {
    fn is_reachable(&self, address: &str) -> Result<bool, ProbeError>;
}

/// One application-level "will it accept a session" check.
pub trait ServiceReadinessProbe {
    fn is_ready(&self, address: &str, credential: &Credential) -> Result<bool, ProbeError>;
}

// =============================================================================
// ping
// =============================================================================

/// `ping -c 1 -W <timeout> <address>`.
#[derive(Debug, Clone)]
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(&self, address: &str) -> Command {
        // -W takes whole seconds and 0 means "wait forever".
        let wait_secs = self.timeout.as_secs().max(1);
        let mut cmd = Command::new("ping");
        cmd.args(["-n", "-c", "1", "-W", &wait_secs.to_string(), address])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl ReachabilityProbe for PingProbe {
    fn is_reachable(&self, address: &str) -> Result<bool, ProbeError> {
        let output = self.command(address).output().map_err(|source| {
            if source.kind() == ErrorKind::PermissionDenied {
                ProbeError::NotPermitted {
                    tool: "ping",
                    detail: source.to_string(),
                }
            } else {
                ProbeError::Spawn {
                    tool: "ping",
                    source,
                }
            }
        })?;

        let reachable = classify_ping(&output)?;
        tracing::debug!(address, reachable, "ping");
        Ok(reachable)
    }
}

/// Exit 0 is a reply and exit 1 is silence. Anything else is inspected: local
/// permission or name problems are fatal, network errors just mean "not yet".
fn classify_ping(output: &Output) -> Result<bool, ProbeError> {
    match output.status.code() {
        Some(0) => return Ok(true),
        Some(1) => return Ok(false),
        _ => {}
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lower = stderr.to_lowercase();
    if lower.contains("operation not permitted") || lower.contains("permission denied") {
        Err(ProbeError::NotPermitted {
            tool: "ping",
            detail: stderr.trim().to_string(),
        })
    } else if lower.contains("name or service not known")
        || lower.contains("unknown host")
        || lower.contains("cannot resolve")
        || lower.contains("usage")
    {
        Err(ProbeError::InvalidTarget(stderr.trim().to_string()))
    } else {
        Ok(false)
    }
}

// =============================================================================
// ssh
// =============================================================================

/// Batch-mode `ssh <user>@<address> true`.
#[derive(Debug, Clone)]
pub struct SshReadinessProbe {
    connect_timeout: Duration,
}

impl SshReadinessProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// Base `ssh` command for `credential@address`, non-interactive.
pub(crate) fn ssh_command(
    address: &str,
    credential: &Credential,
    connect_timeout: Duration,
) -> Command {
    let ssh_opts = format!(
        "-o BatchMode=yes -o ConnectTimeout={} -o StrictHostKeyChecking=accept-new",
        connect_timeout.as_secs().max(1)
    );

    let mut cmd = Command::new("ssh");
    cmd.args(ssh_opts.split_whitespace())
        .arg("-p")
        .arg(credential.port.to_string());
    if let Some(key) = &credential.key_path {
        cmd.arg("-i").arg(key);
    }
    cmd.arg(credential.login(address))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

impl ServiceReadinessProbe for SshReadinessProbe {
    fn is_ready(&self, address: &str, credential: &Credential) -> Result<bool, ProbeError> {
        let mut cmd = ssh_command(address, credential, self.connect_timeout);
        cmd.arg("true");

        let output = cmd.output().map_err(|source| ProbeError::Spawn {
            tool: "ssh",
            source,
        })?;

        let ready = classify_ssh(&output)?;
        tracing::debug!(address, user = %credential.user, ready, "ssh readiness probe");
        Ok(ready)
    }
}

/// ssh exits 255 for its own failures; any other status means the session was
/// negotiated and the remote command ran.
fn classify_ssh(output: &Output) -> Result<bool, ProbeError> {
    match output.status.code() {
        Some(255) | None => {}
        Some(_) => return Ok(true),
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if let Some(fatal) = fatal_ssh_error(stderr) {
        return Err(fatal);
    }

    if stderr.contains("Connection refused") {
        tracing::debug!("ssh: connection refused");
    } else if stderr.contains("timed out") {
        tracing::debug!("ssh: connection timed out");
    } else if stderr.contains("No route to host") {
        tracing::debug!("ssh: no route to host");
    } else {
        tracing::debug!(stderr, "ssh: not ready");
    }
    Ok(false)
}

/// Recognize ssh failures that no amount of waiting will fix.
pub(crate) fn fatal_ssh_error(stderr: &str) -> Option<ProbeError> {
    if stderr.contains("Permission denied") {
        Some(ProbeError::Authentication(format!(
            "{} (key not loaded in ssh-agent?)",
            stderr.lines().last().unwrap_or(stderr)
        )))
    } else if stderr.contains("Host key verification failed")
        || stderr.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
    {
        Some(ProbeError::HostKey(stderr.to_string()))
    } else if stderr.contains("Could not resolve hostname") {
        Some(ProbeError::InvalidTarget(stderr.to_string()))
    } else {
        None
    }
}
