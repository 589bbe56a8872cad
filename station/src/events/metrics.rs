//! Metrics bus - per-subnet job counters merged into one global snapshot
//!
//! [`MetricsBus::submit`] is the only place the merge state changes. Each call
//! overlays a partial update on the subnet's last snapshot, records the job
//! delta, sums every subnet and publishes the result only when the sum actually
//! changed.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::bus::{Bus, SubscribeOptions, Subscription};
use super::types::{MergedMetrics, MetricsSnapshot, MetricsUpdate, PartialMetrics};
use crate::collaborators::{ErrorReporter, TimeSeriesSink};
use crate::config::TailConfig;
use crate::log::EventLog;
use crate::throttle::ReportThrottle;

#[derive(Debug, Default)]
struct SubnetState {
    /// Latest submitted values, used for the merged sum
    latest: MetricsSnapshot,
    /// Highest job count seen, used for delta computation
    high_water: u64,
}

#[derive(Debug, Default)]
struct MergeState {
    subnets: BTreeMap<String, SubnetState>,
    last_emitted: Option<MergedMetrics>,
}

pub struct MetricsBus {
    bus: Bus<MetricsUpdate>,
    state: Mutex<MergeState>,
    anomalies: ReportThrottle,
    errors: Arc<dyn ErrorReporter>,
    telemetry: Arc<dyn TimeSeriesSink>,
}

impl MetricsBus {
    pub fn new(
        log: EventLog,
        tail: TailConfig,
        anomalies: ReportThrottle,
        errors: Arc<dyn ErrorReporter>,
        telemetry: Arc<dyn TimeSeriesSink>,
    ) -> Self {
        Self {
            bus: Bus::new(log, tail),
            state: Mutex::new(MergeState::default()),
            anomalies,
            errors,
            telemetry,
        }
    }

    /// Merge `partial` into `subnet` and publish the new global snapshot if it changed
    ///
    /// Returns the published update, or `None` when the merged totals are unchanged.
    pub fn submit(&self, subnet: &str, partial: PartialMetrics) -> io::Result<Option<MetricsUpdate>> {
        debug!(subnet, ?partial, "MetricsBus::submit: called");
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let entry = state.subnets.entry(subnet.to_string()).or_default();
        let next = entry.latest.apply(&partial);

        let delta = i128::from(next.total_jobs_completed) - i128::from(entry.high_water);
        if delta > 0 {
            self.telemetry.write_point(
                "jobs-completed",
                &[("subnet", subnet)],
                &[("value", i64::try_from(delta).unwrap_or(i64::MAX))],
            );
            entry.high_water = next.total_jobs_completed;
        } else if delta < 0 {
            warn!(
                subnet,
                previous = entry.high_water,
                reported = next.total_jobs_completed,
                "MetricsBus: job count went backwards"
            );
            if self.anomalies.should_report() {
                let message = format!(
                    "totalJobsCompleted for {} decreased from {} to {}",
                    subnet, entry.high_water, next.total_jobs_completed
                );
                self.errors.report("negative jobs-completed delta", &message);
            }
        }
        entry.latest = next;

        // TODO: rewards are summed across subnets even though only one subnet reports them today;
        // revisit once a second subnet schedules rewards.
        let merged = state
            .subnets
            .values()
            .fold(MetricsSnapshot::default(), |acc, s| acc.saturating_add(&s.latest));

        if state.last_emitted.as_ref() == Some(&merged) {
            debug!(subnet, "MetricsBus::submit: merged metrics unchanged");
            return Ok(None);
        }

        let update = MetricsUpdate::new(&merged);
        state.last_emitted = Some(merged);
        self.bus.publish(&update)?;
        Ok(Some(update))
    }

    /// Last emitted merged snapshot, falling back to the newest stored record
    pub fn latest(&self) -> MergedMetrics {
        if let Some(m) = &self.state.lock().unwrap_or_else(|p| p.into_inner()).last_emitted {
            return m.clone();
        }
        match self.bus.snapshot() {
            Ok(records) => records.last().map(MetricsUpdate::metrics).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "MetricsBus::latest: failed to read metrics log");
                MergedMetrics::default()
            }
        }
    }

    pub fn subscribe(&self, options: SubscribeOptions) -> Subscription<MetricsUpdate> {
        self.bus.subscribe(options)
    }

    pub fn snapshot(&self) -> io::Result<Vec<MetricsUpdate>> {
        self.bus.snapshot()
    }
}
