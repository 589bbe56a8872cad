//! Event buses for module activity, metrics and logs
//!
//! Every bus is backed by a durable log under `<state_root>/logs/`. Publishing
//! appends a framed line and fans the record out to live subscribers; late
//! subscribers catch up by tailing the log.
//!
//! # Architecture
//!
//! ```text
//!            Module Supervisor
//!     stdout events        stderr / raw lines
//!    ┌──────┴───────┐              │
//!    ↓              ↓              ↓
//! ActivityBus   MetricsBus     ModuleLogs
//!  submit()      submit()       append()
//!    │     (merge + dedup)        │
//!    ↓              ↓              ↓
//! activity.log  metrics.log   modules/<name>.log ──→ all.log
//!    │              │              │
//!    └── broadcast + tail ─────────┘
//!                   ↓
//!       subscribers (CLI, reward loop, ...)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use station::events::{EventBuses, NewActivity, SubscribeOptions};
//!
//! let buses = EventBuses::open(&paths, &config, &collaborators);
//! let mut sub = buses.activity.subscribe(SubscribeOptions::from_last_n(0));
//! buses.activity.submit(NewActivity::info("spark", "Spark started"))?;
//! while let Some(event) = sub.next().await {
//!     println!("{}: {}", event.source, event.message);
//! }
//! ```

mod activity;
mod bus;
mod logs;
mod metrics;
mod types;

use std::sync::Arc;

pub use activity::ActivityBus;
pub use bus::{Bus, DEFAULT_CHANNEL_CAPACITY, SubscribeOptions, Subscription, parse_line, read_records};
pub use logs::ModuleLogs;
pub use metrics::MetricsBus;
pub use types::{
    ActivityEvent, ActivityKind, LogRecord, MergedMetrics, MetricsSnapshot, MetricsUpdate, NewActivity, PartialMetrics,
};

use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::log::EventLog;
use crate::paths::StatePaths;
use crate::throttle::ReportThrottle;

/// All buses for one state root, shared by the supervisor and the CLI
#[derive(Clone)]
pub struct EventBuses {
    pub activity: Arc<ActivityBus>,
    pub metrics: Arc<MetricsBus>,
    pub logs: Arc<ModuleLogs>,
}

impl EventBuses {
    pub fn open(paths: &StatePaths, config: &Config, collaborators: &Collaborators) -> Self {
        let all = Arc::new(EventLog::open(paths.all_log()));
        let activity = ActivityBus::new(
            EventLog::with_mirror(paths.activity_log(), "activity", all.clone()),
            config.tail.clone(),
        );
        let metrics = MetricsBus::new(
            EventLog::open(paths.metrics_log()),
            config.tail.clone(),
            ReportThrottle::new(config.supervisor.report_window()),
            collaborators.errors.clone(),
            collaborators.telemetry.clone(),
        );
        let logs = ModuleLogs::new(paths.clone(), all, config.tail.clone());

        Self {
            activity: Arc::new(activity),
            metrics: Arc::new(metrics),
            logs: Arc::new(logs),
        }
    }
}
