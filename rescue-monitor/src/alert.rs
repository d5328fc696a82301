/**
 * ALERT SINKS - where a fired alert goes
 *
 * ROLE :
 * The pipeline decides *whether* to alert; a sink decides *how*. Playback
 * itself (sound, vibration) is outside this crate.
 *
 * HOW IT WORKS :
 * - `LogAlertSink`     : writes the alert to the log, nothing else
 * - `CommandAlertSink` : runs an external command per alert
 *     . argv parsed once with shell-words, `{location}` `{message_id}`
 *       `{reason}` substituted per alert
 *     . a new alert stops the previous process if it still runs
 *     . every process is killed after `max_duration`
 */

use crate::models::{EpochMillis, Location};
use parking_lot::Mutex;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ALERT_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertReason {
    CancelledOrder,
    /// Manual trigger, bypasses the pipeline.
    Test,
}

impl AlertReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertReason::CancelledOrder => "cancelled_order",
            AlertReason::Test => "test",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub reason: AlertReason,
    pub message_id: Option<String>,
    pub location: Option<Location>,
    pub fired_at: EpochMillis,
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert command is empty")]
    EmptyCommand,
    #[error("alert command does not parse: {0}")]
    Parse(#[from] shell_words::ParseError),
    #[error("failed to start alert command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no async runtime available to supervise the alert command")]
    NoRuntime,
}

pub trait AlertSink: Send + Sync {
    /// Must return quickly; long-running work belongs in a spawned task.
    fn fire(&self, alert: &Alert) -> Result<(), AlertError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn fire(&self, alert: &Alert) -> Result<(), AlertError> {
        let location = alert.location.as_ref().map(|l| l.name.as_str()).unwrap_or("-");
        warn!(
            reason = alert.reason.as_str(),
            message_id = alert.message_id.as_deref().unwrap_or("-"),
            location,
            fired_at = alert.fired_at,
            "ALERT"
        );
        Ok(())
    }
}

pub struct CommandAlertSink {
    argv: Vec<String>,
    max_duration: Duration,
    // stop handle of the most recent process
    running: Mutex<Option<oneshot::Sender<()>>>,
}

impl CommandAlertSink {
    pub fn new(command: &str, max_duration: Duration) -> Result<Self, AlertError> {
        let argv = shell_words::split(command)?;
        if argv.is_empty() {
            return Err(AlertError::EmptyCommand);
        }
        Ok(Self {
            argv,
            max_duration,
            running: Mutex::new(None),
        })
    }

    fn render(&self, alert: &Alert) -> Vec<String> {
        let location = alert.location.as_ref().map(|l| l.name.as_str()).unwrap_or("");
        let message_id = alert.message_id.as_deref().unwrap_or("");
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{location}", location)
                    .replace("{message_id}", message_id)
                    .replace("{reason}", alert.reason.as_str())
            })
            .collect()
    }
}

impl AlertSink for CommandAlertSink {
    fn fire(&self, alert: &Alert) -> Result<(), AlertError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| AlertError::NoRuntime)?;
        let argv = self.render(alert);

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut running = self.running.lock();
        if let Some(previous) = running.take() {
            // already exited if the receiver is gone
            if previous.send(()).is_ok() {
                debug!("previous alert command stopped");
            }
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        *running = Some(stop_tx);
        drop(running);

        info!(program = %argv[0], pid, reason = alert.reason.as_str(), "alert command started");
        runtime.spawn(supervise(child, stop_rx, self.max_duration));
        Ok(())
    }
}

async fn supervise(
    mut child: tokio::process::Child,
    stop: oneshot::Receiver<()>,
    max_duration: Duration,
) {
    let pid = child.id();
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => debug!(pid, %status, "alert command exited"),
                Err(e) => warn!(pid, error = %e, "failed to wait for alert command"),
            }
            return;
        }
        _ = stop => {
            debug!(pid, "alert command superseded");
        }
        _ = tokio::time::sleep(max_duration) => {
            info!(pid, after_secs = max_duration.as_secs(), "alert command auto-stopped");
        }
    }

    if let Err(e) = child.kill().await {
        warn!(pid, error = %e, "failed to kill alert command");
    }
}
