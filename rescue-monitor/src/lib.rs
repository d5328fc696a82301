//! rescue-monitor - watches an MQTT channel for cancelled orders near a
//! location and raises a throttled alert for each fresh, unseen one.
//!
//! The crate is organised leaves first:
//! - [`storage`]: key/value persistence backends
//! - [`state`]: the persisted monitoring record and its counters
//! - [`dedup`], [`staleness`], [`cooldown`], [`event`]: the message filters
//! - [`pipeline`]: the per-message processing chain
//! - [`transport`], [`supervisor`]: the MQTT connection and its supervision
//! - [`reliability`]: the periodic control loop
//! - [`service`]: the facade handed to the outside world
//! - [`http`]: the REST control API served by the daemon

pub mod alert;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod dedup;
pub mod event;
pub mod health;
pub mod http;
pub mod models;
pub mod pipeline;
pub mod reliability;
pub mod service;
pub mod staleness;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod transport;

pub use alert::{Alert, AlertReason, AlertSink};
pub use clock::{Clock, SystemClock};
pub use models::{ChannelConfig, EpochMillis, Location, MonitorState, MonitorStatus};
pub use pipeline::{MessagePipeline, Outcome};
pub use service::RescueMonitor;
pub use state::MonitorStateStore;
