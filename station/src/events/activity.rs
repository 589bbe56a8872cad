//! Activity bus - module lifecycle and status notifications

use std::io;

use tracing::debug;

use super::bus::{Bus, SubscribeOptions, Subscription};
use super::types::{ActivityEvent, NewActivity};
use crate::config::TailConfig;
use crate::log::EventLog;

pub struct ActivityBus {
    bus: Bus<ActivityEvent>,
}

impl ActivityBus {
    pub fn new(log: EventLog, tail: TailConfig) -> Self {
        Self {
            bus: Bus::new(log, tail),
        }
    }

    /// Stamp missing id/timestamp, persist and fan out
    pub fn submit(&self, activity: NewActivity) -> io::Result<ActivityEvent> {
        let event = activity.stamp();
        debug!(source = %event.source, kind = event.kind.as_str(), message = %event.message, "ActivityBus::submit");
        self.bus.publish(&event)?;
        Ok(event)
    }

    pub fn info(&self, source: &str, message: impl Into<String>) -> io::Result<ActivityEvent> {
        self.submit(NewActivity::info(source, message))
    }

    pub fn error(&self, source: &str, message: impl Into<String>) -> io::Result<ActivityEvent> {
        self.submit(NewActivity::error(source, message))
    }

    pub fn subscribe(&self, options: SubscribeOptions) -> Subscription<ActivityEvent> {
        self.bus.subscribe(options)
    }

    pub fn snapshot(&self) -> io::Result<Vec<ActivityEvent>> {
        self.bus.snapshot()
    }
}
