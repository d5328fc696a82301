/**
 * HEALTH - process counters and the periodic liveness heartbeat
 *
 * ROLE :
 * The persisted reconnect counter mixes failed attempts and dropped
 * connections. `HealthTracker` keeps them apart for this process only, and
 * the heartbeat bundles them with the persisted snapshot.
 *
 * HOW IT WORKS :
 * - Atomic counters, cheap to clone and share
 * - `LivenessReport::heartbeat_line` renders the one-line status:
 *   CONNECTED | SCREEN_ON | Loc: X | Cancelled: n | Claimed: n | Reconnects: n
 * - Power state comes from a `PowerProbe` (none on a server: Unknown)
 * - Reports go to a `HeartbeatSink`; `HeartbeatLog` logs and keeps the last one
 */

use crate::models::StateSummary;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    connect_failures: Arc<AtomicU64>,
    connection_losses: Arc<AtomicU64>,
    sessions_opened: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connect_failures: Arc::new(AtomicU64::new(0)),
            connection_losses: Arc::new(AtomicU64::new(0)),
            sessions_opened: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_lost(&self) {
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessHealth {
        ProcessHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: memory_usage_mb(),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connection_losses: self.connection_losses.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: Option<f32>,
    pub connect_failures: u64,
    pub connection_losses: u64,
    pub sessions_opened: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    ScreenOn,
    ScreenOff,
    Unknown,
}

impl PowerState {
    fn label(self) -> &'static str {
        match self {
            PowerState::ScreenOn => "SCREEN_ON",
            PowerState::ScreenOff => "SCREEN_OFF",
            PowerState::Unknown => "SCREEN_UNKNOWN",
        }
    }
}

pub trait PowerProbe: Send + Sync {
    fn power_state(&self) -> PowerState;
}

/// Hosts without a display.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPowerProbe;

impl PowerProbe for NoPowerProbe {
    fn power_state(&self) -> PowerState {
        PowerState::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessReport {
    pub connected: bool,
    pub power: PowerState,
    pub state: Option<StateSummary>,
    pub process: ProcessHealth,
    pub status_line: String,
}

impl LivenessReport {
    pub fn new(
        connected: bool,
        power: PowerState,
        state: Option<StateSummary>,
        process: ProcessHealth,
    ) -> Self {
        let status_line = match &state {
            Some(s) => format!("Monitoring: {}", s.location.name),
            None => "Not monitoring".to_string(),
        };
        Self {
            connected,
            power,
            state,
            process,
            status_line,
        }
    }

    pub fn heartbeat_line(&self) -> String {
        let link = if self.connected { "CONNECTED" } else { "DISCONNECTED" };
        match &self.state {
            Some(s) => format!(
                "{link} | {} | Loc: {} | Cancelled: {} | Claimed: {} | Reconnects: {}",
                self.power.label(),
                s.location.name,
                s.cancelled_count,
                s.claimed_count,
                s.reconnect_count
            ),
            None => format!("{link} | {} | inactive", self.power.label()),
        }
    }
}

pub trait HeartbeatSink: Send + Sync {
    fn emit(&self, report: &LivenessReport);
}

#[derive(Default)]
pub struct HeartbeatLog {
    last: Mutex<Option<LivenessReport>>,
}

impl HeartbeatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<LivenessReport> {
        self.last.lock().clone()
    }
}

impl HeartbeatSink for HeartbeatLog {
    fn emit(&self, report: &LivenessReport) {
        info!(
            uptime = report.process.uptime_seconds,
            status = %report.status_line,
            "heartbeat: {}",
            report.heartbeat_line()
        );
        *self.last.lock() = Some(report.clone());
    }
}

/// Resident memory from `/proc/self/status`. `None` where unavailable.
pub fn memory_usage_mb() -> Option<f32> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss_mb(&status)
}

fn parse_vm_rss_mb(status: &str) -> Option<f32> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb as f32 / 1024.0)
}
