//! Out-of-band run notifications.
//!
//! The orchestrator hands every finished run to a [`Notifier`] exactly once.
//! Delivery problems are the notifier's to report; they are logged by the
//! caller and never change the run's outcome.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use super::orchestrator::{Outcome, RunResult, Stage, StageTiming};
use super::sync::format_bytes;

/// Timeout for webhook requests.
const HTTP_TIMEOUT_SECS: u64 = 10;

/// Discord caps embed field values at 1024 characters; leave room for the fence.
const ERROR_FIELD_CHARS: usize = 1000;

const COLOR_SUCCESS: u32 = 0x00FF00;
const COLOR_FAILURE: u32 = 0xFF0000;

/// Notification derived from a [`RunResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub host: String,
    pub outcome: Outcome,
    pub stage_reached: Stage,
    pub stage_timings: Vec<StageTiming>,
    pub total_elapsed: Duration,
    pub detail: Option<String>,
    /// Local source size, when the transfer got far enough to measure it.
    pub size: Option<String>,
    pub summary: String,
}

impl NotificationEvent {
    pub fn from_result(result: &RunResult, host: &str) -> Self {
        let secs = result.total_elapsed.as_secs_f64();
        let summary = match result.outcome {
            Outcome::Success => format!("Backup to {host} succeeded in {secs:.1}s"),
            Outcome::SyncPartial => format!(
                "Backup to {host} finished with files still differing after {secs:.1}s"
            ),
            outcome => format!(
                "Backup to {host} failed ({outcome}) during {} after {secs:.1}s",
                result.stage_reached
            ),
        };

        Self {
            host: host.to_string(),
            outcome: result.outcome,
            stage_reached: result.stage_reached,
            stage_timings: result.stage_timings.clone(),
            total_elapsed: result.total_elapsed,
            detail: result.detail.clone(),
            size: result
                .sync
                .as_ref()
                .and_then(|report| report.source_bytes)
                .map(format_bytes),
            summary,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Delivers a notification somewhere outside the process.
pub trait Notifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()>;
}

/// Writes the summary to the log. Used when notifications are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        if event.is_success() {
            tracing::info!(outcome = %event.outcome, "{}", event.summary);
        } else {
            tracing::warn!(outcome = %event.outcome, "{}", event.summary);
        }
        Ok(())
    }
}

/// Posts a Discord embed to a webhook URL.
#[derive(Debug, Clone)]
pub struct DiscordNotifier {
    webhook_url: String,
    on_success: bool,
    on_failure: bool,
}

impl DiscordNotifier {
    pub fn new(webhook_url: impl Into<String>, on_success: bool, on_failure: bool) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            on_success,
            on_failure,
        }
    }

    /// Whether this event passes the `on_success` / `on_failure` filter.
    pub fn wants(&self, event: &NotificationEvent) -> bool {
        if event.is_success() {
            self.on_success
        } else {
            self.on_failure
        }
    }
}

impl Notifier for DiscordNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        if !self.wants(event) {
            tracing::debug!(outcome = %event.outcome, "discord notification filtered out");
            return Ok(());
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let payload = discord_payload(event, &timestamp);

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(concat!("nas-wake-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;

        let response = client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .context("sending discord webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("Discord webhook returned {}", response.status());
        }

        tracing::info!("Discord notification sent");
        Ok(())
    }
}

/// Discord webhook body for `event`, stamped with `timestamp`.
pub fn discord_payload(event: &NotificationEvent, timestamp: &str) -> Value {
    let success = event.is_success();
    let (title, color) = if success {
        ("✅ Backup Successful", COLOR_SUCCESS)
    } else {
        ("❌ Backup Failed", COLOR_FAILURE)
    };

    let status = if success { "Success" } else { "Failed" };

    let duration = format!("{:.1}s", event.total_elapsed.as_secs_f64());

    let mut fields = vec![
        json!({"name": "Status", "value": status, "inline": true}),
        json!({"name": "Duration", "value": duration, "inline": true}),
    ];
    if !success {
        let outcome = event.outcome.as_str();
        let stage = event.stage_reached.as_str();
        fields.push(json!({"name": "Outcome", "value": outcome, "inline": true}));
        fields.push(json!({"name": "Stage", "value": stage, "inline": true}));
    }
    if let Some(size) = &event.size {
        fields.push(json!({"name": "Size", "value": size, "inline": true}));
    }
    if let Some(detail) = &event.detail {
        fields.push(json!({
            "name": "Error",
            "value": format!("```{}```", truncate_to_chars(detail, ERROR_FIELD_CHARS)),
            "inline": false
        }));
    }

    json!({
        "embeds": [{
            "title": title,
            "description": event.summary,
            "color": color,
            "fields": fields,
            "timestamp": timestamp,
            "footer": {"text": "NAS Wake Sync"}
        }]
    })
}

/// Truncate string to at most N characters, respecting char boundaries.
fn truncate_to_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
