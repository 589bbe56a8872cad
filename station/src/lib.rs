//! Station - host agent for worker modules
//!
//! Station launches third-party worker processes ("modules"), records what they
//! report in durable append-only logs, republishes those records to live
//! subscribers and keeps a private Ed25519 identity that every module receives
//! as its station id.
//!
//! # Modules
//!
//! - [`supervisor`] - module process lifecycle, update checks and restarts
//! - [`events`] - activity, metrics and module log buses
//! - [`log`] - framed log lines, rotating writer and tailer
//! - [`identity`] - encrypted identity keystore
//! - [`collaborators`] - interfaces to source, reward and reporting services
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod collaborators;
pub mod config;
pub mod events;
pub mod identity;
pub mod lock;
pub mod log;
pub mod paths;
pub mod retry;
pub mod supervisor;
pub mod throttle;

// Re-export commonly used types
pub use collaborators::{Collaborators, ErrorReporter, RewardLookup, SourceResolver, SourceUpdate, TimeSeriesSink};
pub use config::{Config, ConfigError, ModuleConfig};
pub use events::{
    ActivityBus, ActivityEvent, ActivityKind, EventBuses, MergedMetrics, MetricsBus, MetricsSnapshot, MetricsUpdate,
    ModuleLogs, NewActivity, PartialMetrics, SubscribeOptions,
};
pub use identity::{IdentityOptions, Keypair, KeystoreError, get_or_create_identity};
pub use lock::{LockError, RunLock};
pub use paths::StatePaths;
pub use supervisor::{Supervisor, SupervisorContext, SupervisorError, SupervisorOptions};
