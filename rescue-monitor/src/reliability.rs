/**
 * RELIABILITY LOOP - the periodic driver of a monitoring session
 *
 * ROLE :
 * Keeps the subscription alive for as long as the persisted state says
 * monitoring is on, and stops everything as soon as it says otherwise.
 *
 * HOW IT WORKS :
 * Every tick (30s by default):
 *   1. read the persisted state; absent -> shut the supervisor down, exit
 *   2. ensure the supervisor is connected with the stored channel config
 *   3. purge expired dedup entries when the purge interval elapsed
 *   4. emit a liveness heartbeat
 * Errors inside a tick are logged and retried on the next one. Only state
 * absence (or an external supervisor shutdown) ends the loop.
 */

use crate::clock::Clock;
use crate::dedup::{DedupSet, DEFAULT_RETENTION};
use crate::health::{HealthTracker, HeartbeatSink, LivenessReport, PowerProbe};
use crate::models::{EpochMillis, MonitorStatus};
use crate::state::MonitorStateStore;
use crate::supervisor::{ConnectOutcome, ConnectionSupervisor};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub tick_interval: Duration,
    pub dedup_retention: Duration,
    pub dedup_purge_interval: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            dedup_retention: DEFAULT_RETENTION,
            dedup_purge_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Deactivated,
    SupervisorClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Persisted state disappeared.
    Deactivated,
    /// Someone else closed the supervisor while monitoring stays on
    /// (process shutdown).
    SupervisorClosed,
}

pub struct ReliabilityLoop<T: Transport> {
    supervisor: Arc<ConnectionSupervisor<T>>,
    state: Arc<MonitorStateStore>,
    dedup: Arc<DedupSet>,
    health: HealthTracker,
    power: Arc<dyn PowerProbe>,
    heartbeat: Arc<dyn HeartbeatSink>,
    clock: Arc<dyn Clock>,
    settings: LoopSettings,
    last_purge: Mutex<Option<EpochMillis>>,
}

impl<T: Transport> ReliabilityLoop<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        supervisor: Arc<ConnectionSupervisor<T>>,
        state: Arc<MonitorStateStore>,
        dedup: Arc<DedupSet>,
        health: HealthTracker,
        power: Arc<dyn PowerProbe>,
        heartbeat: Arc<dyn HeartbeatSink>,
        clock: Arc<dyn Clock>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            supervisor,
            state,
            dedup,
            health,
            power,
            heartbeat,
            clock,
            settings,
            last_purge: Mutex::new(None),
        }
    }

    /// One iteration of the loop.
    pub async fn tick(&self) -> TickOutcome {
        let state = match self.state.read() {
            Ok(MonitorStatus::Active(state)) => state,
            Ok(MonitorStatus::Inactive) => {
                info!("monitoring no longer active, stopping");
                self.supervisor.shutdown().await;
                return TickOutcome::Deactivated;
            }
            Err(e) => {
                error!(error = %e, "failed to read monitor state, retrying next tick");
                return TickOutcome::Continue;
            }
        };

        match self.supervisor.ensure_connected(&state.channel_config).await {
            ConnectOutcome::Closed => return TickOutcome::SupervisorClosed,
            ConnectOutcome::Failed(e) => debug!(error = %e, "tick ended disconnected"),
            ConnectOutcome::Connected(session) => debug!(session, "tick opened a session"),
            ConnectOutcome::AlreadyConnected => {}
        }

        self.purge_if_due();
        self.emit_heartbeat();
        TickOutcome::Continue
    }

    /// Liveness snapshot from a fresh state read.
    pub fn liveness(&self) -> LivenessReport {
        let summary = match self.state.current() {
            Ok(state) => state.map(|s| s.summary()),
            Err(e) => {
                warn!(error = %e, "state unreadable for heartbeat");
                None
            }
        };
        LivenessReport::new(
            self.supervisor.is_connected(),
            self.power.power_state(),
            summary,
            self.health.snapshot(),
        )
    }

    fn emit_heartbeat(&self) {
        self.heartbeat.emit(&self.liveness());
    }

    /// Purges expired dedup entries if the purge interval elapsed.
    /// Returns the number removed.
    pub fn purge_if_due(&self) -> usize {
        let now = self.clock.now_ms();
        let interval = i64::try_from(self.settings.dedup_purge_interval.as_millis()).unwrap_or(i64::MAX);
        {
            let last = self.last_purge.lock();
            if let Some(last) = *last {
                if now.saturating_sub(last) < interval {
                    return 0;
                }
            }
        }
        self.purge(now)
    }

    fn purge(&self, now: EpochMillis) -> usize {
        *self.last_purge.lock() = Some(now);
        match self.dedup.purge_expired(now, self.settings.dedup_retention) {
            Ok(removed) => removed,
            Err(e) => {
                error!(error = %e, "dedup purge failed");
                0
            }
        }
    }

    /// Runs until monitoring is deactivated or the supervisor is closed.
    pub async fn run(&self) -> LoopExit {
        info!(
            tick_secs = self.settings.tick_interval.as_secs(),
            "reliability loop started"
        );
        self.purge(self.clock.now_ms());

        let mut closed = self.supervisor.closed_signal();
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        TickOutcome::Continue => {}
                        TickOutcome::Deactivated => return LoopExit::Deactivated,
                        TickOutcome::SupervisorClosed => return self.exit_after_close(),
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        return self.exit_after_close();
                    }
                }
            }
        }
    }

    fn exit_after_close(&self) -> LoopExit {
        let exit = if self.state.is_active() {
            LoopExit::SupervisorClosed
        } else {
            LoopExit::Deactivated
        };
        info!(?exit, "reliability loop stopped");
        exit
    }
}
