//! Module supervision
//!
//! Launches every configured module with the station identity in its
//! environment, routes stdout events to the activity and metrics buses and raw
//! output to the module logs, restarts the whole group when a source update is
//! detected and stops it when a module exits or the host shuts down.

mod event;
mod process;
mod runner;

pub use event::ModuleEvent;
pub use process::{ExitOutcome, ModuleMessage, ModuleProcess, ModuleState, RunningModule, module_env};
pub use runner::{Supervisor, SupervisorContext, SupervisorError, SupervisorOptions, lookup_rewards};
