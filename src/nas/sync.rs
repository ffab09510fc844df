//! Transfer stage: one rsync run from the local backup directory to the NAS.
//!
//! The option string from the config is passed through untouched, so whether
//! the run is additive or mirrors deletions (`--delete`) is the operator's
//! choice. The executor only decides how the exit status is reported:
//!
//! | exit status                    | outcome          |
//! |--------------------------------|------------------|
//! | 0                              | success          |
//! | in `partial_exit_codes`        | partial failure  |
//! | anything else, or a signal     | hard failure     |
//!
//! # Example
//!
//! ```rust,ignore
//! use nas_wake_sync::nas::sync::{RsyncExecutor, SyncExecutor};
//!
//! let executor = RsyncExecutor::new(&config.sync, config.target.credential.clone());
//! let sync = &config.sync;
//! let outcome = executor.run_sync(&sync.options, &sync.source, "admin@nas:/backup/");
//! println!("{}", outcome.report().exit_code.unwrap_or(-1));
//! ```

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use walkdir::WalkDir;

use crate::config::{Credential, SyncConfig};

/// Upper bound on captured tool output kept as failure detail.
pub const DETAIL_LIMIT_BYTES: usize = 4096;

/// Facts about one transfer, whatever its outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Exit code, if the tool ran and exited normally.
    pub exit_code: Option<i32>,
    /// Files transferred, when the options include `--stats`.
    pub files_transferred: Option<u64>,
    /// Bytes transferred, when the options include `--stats`.
    pub bytes_transferred: Option<u64>,
    /// Size of the local source tree in bytes.
    pub source_bytes: Option<u64>,
    pub duration: Duration,
}

/// Classified result of the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success(SyncReport),
    /// The tool finished but reported files it could not fully process.
    PartialFailure { report: SyncReport, detail: String },
    HardFailure { report: SyncReport, detail: String },
}

impl SyncOutcome {
    pub fn report(&self) -> &SyncReport {
        match self {
            Self::Success(report)
            | Self::PartialFailure { report, .. }
            | Self::HardFailure { report, .. } => report,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::PartialFailure { detail, .. } | Self::HardFailure { detail, .. } => {
                Some(detail)
            }
        }
    }

    fn hard(detail: impl Into<String>, duration: Duration) -> Self {
        Self::HardFailure {
            report: SyncReport {
                duration,
                ..Default::default()
            },
            detail: detail.into(),
        }
    }
}

/// Runs the external transfer exactly once. No retries.
pub trait SyncExecutor {
    fn run_sync(&self, options: &[String], source: &Path, destination: &str) -> SyncOutcome;
}

/// Map an exit status to an outcome bucket.
pub fn classify_exit(code: Option<i32>, partial_exit_codes: &[i32]) -> SyncClass {
    match code {
        Some(0) => SyncClass::Success,
        Some(code) if partial_exit_codes.contains(&code) => SyncClass::Partial,
        _ => SyncClass::Hard,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncClass {
    Success,
    Partial,
    Hard,
}

/// `rsync <options> <source>/ <destination>` with `RSYNC_RSH` pointing at the
/// configured key and port.
#[derive(Debug, Clone)]
pub struct RsyncExecutor {
    tool: String,
    credential: Credential,
    partial_exit_codes: Vec<i32>,
}

impl RsyncExecutor {
    pub fn new(sync: &SyncConfig, credential: Credential) -> Self {
        Self {
            tool: sync.tool.clone(),
            credential,
            partial_exit_codes: sync.partial_exit_codes.clone(),
        }
    }

    /// Resolve the tool through `PATH` so a missing binary is reported by name.
    fn resolve_tool(&self) -> Result<PathBuf, String> {
        which::which(&self.tool).map_err(|e| format!("{} not found: {e}", self.tool))
    }

    fn command(
        &self,
        tool: &Path,
        options: &[String],
        source: &Path,
        destination: &str,
    ) -> Command {
        let (source_arg, destination_arg) = transfer_args(source, destination);

        let mut cmd = Command::new(tool);
        cmd.args(options)
            .arg(source_arg)
            .arg(destination_arg)
            .env("RSYNC_RSH", self.credential.remote_shell())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl SyncExecutor for RsyncExecutor {
    fn run_sync(&self, options: &[String], source: &Path, destination: &str) -> SyncOutcome {
        let start = Instant::now();

        if !source.is_dir() {
            tracing::error!(source = %source.display(), "source directory does not exist");
            return SyncOutcome::hard(
                format!("Source directory does not exist: {}", source.display()),
                start.elapsed(),
            );
        }

        let tool = match self.resolve_tool() {
            Ok(tool) => tool,
            Err(detail) => return SyncOutcome::hard(detail, start.elapsed()),
        };

        let mut cmd = self.command(&tool, options, source, destination);
        tracing::info!(
            command = %format_command(&tool, options, source, destination),
            "starting rsync"
        );

        let captured = match run_captured(&mut cmd) {
            Ok(captured) => captured,
            Err(e) => {
                return SyncOutcome::hard(
                    format!("Failed to execute rsync: {e}"),
                    start.elapsed(),
                );
            }
        };

        let stats = parse_rsync_stats(&captured.stdout_tail);
        let mut report = SyncReport {
            exit_code: captured.code,
            files_transferred: stats.files_transferred,
            bytes_transferred: stats.bytes_transferred,
            source_bytes: None,
            duration: start.elapsed(),
        };

        match classify_exit(captured.code, &self.partial_exit_codes) {
            SyncClass::Success => {
                report.source_bytes = Some(directory_size(source));
                tracing::info!(
                    files = ?report.files_transferred,
                    bytes = ?report.bytes_transferred,
                    duration_ms = report.duration.as_millis() as u64,
                    "rsync completed"
                );
                SyncOutcome::Success(report)
            }
            SyncClass::Partial => {
                report.source_bytes = Some(directory_size(source));
                let detail = format!(
                    "rsync reported files still differing (exit {}): {}",
                    captured.code.unwrap_or(-1),
                    captured.detail()
                );
                tracing::warn!(exit_code = ?captured.code, "rsync finished with partial transfer");
                SyncOutcome::PartialFailure { report, detail }
            }
            SyncClass::Hard => {
                let status = match captured.code {
                    Some(code) => format!("return code: {code}"),
                    None => "terminated by signal".to_string(),
                };
                let detail = format!("rsync failed ({status}): {}", captured.detail());
                tracing::error!(exit_code = ?captured.code, "rsync failed");
                SyncOutcome::HardFailure { report, detail }
            }
        }
    }
}

// =============================================================================
// Output capture
// =============================================================================

/// What survived of a finished child process.
#[derive(Debug, Default)]
struct Captured {
    code: Option<i32>,
    stdout_tail: String,
    stderr_tail: String,
}

impl Captured {
    /// Prefer stderr (where rsync puts errors), fall back to stdout.
    fn detail(&self) -> String {
        let combined = match (self.stderr_tail.trim(), self.stdout_tail.trim()) {
            ("", "") => return "no output".to_string(),
            (err, "") => err.to_string(),
            ("", out) => out.to_string(),
            (err, out) => format!("{err}\n{out}"),
        };
        tail_within(&combined, DETAIL_LIMIT_BYTES).to_string()
    }
}

/// Spawn, stream both pipes to the log while keeping bounded tails, and reap.
/// The reader threads are scoped, so nothing outlives the child.
fn run_captured(cmd: &mut Command) -> std::io::Result<Captured> {
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (stdout_tail, stderr_tail) = std::thread::scope(|scope| {
        let err_reader = scope.spawn(move || drain(stderr, "stderr"));
        let out_tail = drain(stdout, "stdout");
        let err_tail = err_reader.join().unwrap_or_default();
        (out_tail, err_tail)
    });

    let status = child.wait()?;
    Ok(Captured {
        code: status.code(),
        stdout_tail,
        stderr_tail,
    })
}

fn drain<R: Read>(pipe: Option<R>, stream: &'static str) -> String {
    let Some(pipe) = pipe else {
        return String::new();
    };
    let mut reader = BufReader::new(pipe);
    let mut tail = TailBuffer::new(DETAIL_LIMIT_BYTES);
    let mut buf = Vec::new();
    // Read until EOF whatever the bytes are; closing the pipe early would
    // kill the writer with SIGPIPE.
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                tracing::debug!(stream, "{line}");
                tail.push(line.to_string());
            }
            Err(e) => {
                tracing::debug!(stream, error = %e, "output read failed, discarding the rest");
                let _ = std::io::copy(&mut reader, &mut std::io::sink());
                break;
            }
        }
    }
    tail.into_string()
}

/// Keeps the most recent lines up to roughly `limit` bytes.
#[derive(Debug)]
struct TailBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len() + 1;
            }
        }
    }

    fn into_string(self) -> String {
        let joined = Vec::from(self.lines).join("\n");
        tail_within(&joined, self.limit).to_string()
    }
}

/// Last `max_bytes` of `s`, cut on a char boundary.
fn tail_within(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Source and destination arguments, each with exactly one trailing slash so
/// the contents of source land inside destination.
fn transfer_args(source: &Path, destination: &str) -> (String, String) {
    let source = source.display().to_string();
    (
        format!("{}/", source.trim_end_matches('/')),
        format!("{}/", destination.trim_end_matches('/')),
    )
}

fn format_command(
    tool: &Path,
    options: &[String],
    source: &Path,
    destination: &str,
) -> String {
    let (source_arg, destination_arg) = transfer_args(source, destination);
    let mut parts = vec![tool.display().to_string()];
    parts.extend(options.iter().cloned());
    parts.push(source_arg);
    parts.push(destination_arg);
    shell_words::join(parts)
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics parsed from rsync `--stats` output.
#[derive(Debug, Default, PartialEq, Eq)]
struct RsyncStats {
    files_transferred: Option<u64>,
    bytes_transferred: Option<u64>,
}

/// Parse transfer statistics from rsync `--stats` output, if present.
fn parse_rsync_stats(output: &str) -> RsyncStats {
    let mut stats = RsyncStats::default();

    for line in output.lines() {
        let line = line.trim();

        // "Number of regular files transferred: 1,234"
        if line.starts_with("Number of regular files transferred:")
            && let Some(num_str) = line.split(':').nth(1)
        {
            stats.files_transferred = num_str.trim().replace(',', "").parse().ok();
        }

        // "Total transferred file size: 1,234 bytes" (also "1.23M bytes" with -h)
        if line.starts_with("Total transferred file size:")
            && let Some(size_part) = line.split(':').nth(1)
        {
            let size_str = size_part
                .split_whitespace()
                .next()
                .unwrap_or("")
                .replace(',', "");
            stats.bytes_transferred = parse_size(&size_str);
        }
    }

    stats
}

/// Parse `1234` or rsync `-h` style `1.50K`, `2.31M`, `1.02G` (powers of 1000).
fn parse_size(s: &str) -> Option<u64> {
    let (number, multiplier) = match s.chars().last()? {
        'K' | 'k' => (&s[..s.len() - 1], 1_000f64),
        'M' => (&s[..s.len() - 1], 1_000_000f64),
        'G' => (&s[..s.len() - 1], 1_000_000_000f64),
        'T' => (&s[..s.len() - 1], 1_000_000_000_000f64),
        _ => (s, 1f64),
    };
    let value: f64 = number.parse().ok()?;
    (value >= 0.0).then(|| (value * multiplier).round() as u64)
}

/// Total size of regular files below `root`. Unreadable entries are skipped.
pub fn directory_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Human readable byte count, e.g. `1.5 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
