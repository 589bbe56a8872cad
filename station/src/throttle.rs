//! Rate limiting for outbound error reports

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default reporting window (4 hours)
pub const DEFAULT_REPORT_WINDOW: Duration = Duration::from_secs(4 * 60 * 60);

/// Allows at most one report per window, measured from the last allowed report
#[derive(Debug)]
pub struct ReportThrottle {
    window: Duration,
    last_report: Mutex<Option<Instant>>,
}

impl Default for ReportThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_WINDOW)
    }
}

impl ReportThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_report: Mutex::new(None),
        }
    }

    /// Whether a report may be sent now. Records the report when it returns true.
    pub fn should_report(&self) -> bool {
        self.should_report_at(Instant::now())
    }

    pub fn should_report_at(&self, now: Instant) -> bool {
        let mut last = self.last_report.lock().unwrap_or_else(|p| p.into_inner());
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
