//! Event types persisted by the activity and metrics buses
//!
//! Every record is stored as one compact JSON payload inside a framed log line.
//! `id` and `timestamp` may be missing from hand-written or legacy lines: the
//! timestamp then comes from the frame and a fresh id is assigned on read.

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A record that can live in a bus log
pub trait LogRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Identity used to deliver each record exactly once
    fn id(&self) -> Uuid;

    /// Parse a JSON payload, filling gaps from the enclosing frame
    fn from_payload(payload: &str, frame_timestamp: Option<DateTime<Local>>) -> serde_json::Result<Self>;
}

/// Kind of activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Info,
    Error,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Info => "info",
            ActivityKind::Error => "error",
        }
    }
}

/// A stored activity notification about a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Local>,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// Module name
    pub source: String,
    pub message: String,
}

#[derive(Deserialize)]
struct ActivityPayload {
    id: Option<Uuid>,
    timestamp: Option<DateTime<Local>>,
    #[serde(rename = "type")]
    kind: ActivityKind,
    source: String,
    message: String,
}

impl LogRecord for ActivityEvent {
    fn id(&self) -> Uuid {
        self.id
    }

    fn from_payload(payload: &str, frame_timestamp: Option<DateTime<Local>>) -> serde_json::Result<Self> {
        let p: ActivityPayload = serde_json::from_str(payload)?;
        Ok(Self {
            id: p.id.unwrap_or_else(Uuid::now_v7),
            timestamp: p.timestamp.or(frame_timestamp).unwrap_or_else(Local::now),
            kind: p.kind,
            source: p.source,
            message: p.message,
        })
    }
}

/// An activity about to be submitted; missing `id`/`timestamp` are stamped by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivity {
    pub id: Option<Uuid>,
    pub timestamp: Option<DateTime<Local>>,
    pub kind: ActivityKind,
    pub source: String,
    pub message: String,
}

impl NewActivity {
    pub fn new(kind: ActivityKind, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: None,
            kind,
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn info(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ActivityKind::Info, source, message)
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ActivityKind::Error, source, message)
    }

    pub(crate) fn stamp(self) -> ActivityEvent {
        ActivityEvent {
            id: self.id.unwrap_or_else(Uuid::now_v7),
            timestamp: self.timestamp.unwrap_or_else(Local::now),
            kind: self.kind,
            source: self.source,
            message: self.message,
        }
    }
}

/// Work counters for one subnet, or their sum across subnets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_jobs_completed: u64,
    #[serde(with = "u128_string")]
    pub rewards_scheduled: u128,
}

/// Element-wise sum of all known subnet snapshots
pub type MergedMetrics = MetricsSnapshot;

impl MetricsSnapshot {
    pub fn new(total_jobs_completed: u64, rewards_scheduled: u128) -> Self {
        Self {
            total_jobs_completed,
            rewards_scheduled,
        }
    }

    /// Overlay the fields present in `partial`
    pub fn apply(&self, partial: &PartialMetrics) -> Self {
        Self {
            total_jobs_completed: partial.total_jobs_completed.unwrap_or(self.total_jobs_completed),
            rewards_scheduled: partial.rewards_scheduled.unwrap_or(self.rewards_scheduled),
        }
    }

    pub fn saturating_add(&self, other: &Self) -> Self {
        Self {
            total_jobs_completed: self.total_jobs_completed.saturating_add(other.total_jobs_completed),
            rewards_scheduled: self.rewards_scheduled.saturating_add(other.rewards_scheduled),
        }
    }
}

/// A partial update for one subnet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialMetrics {
    pub total_jobs_completed: Option<u64>,
    pub rewards_scheduled: Option<u128>,
}

impl PartialMetrics {
    pub fn jobs(total_jobs_completed: u64) -> Self {
        Self {
            total_jobs_completed: Some(total_jobs_completed),
            rewards_scheduled: None,
        }
    }

    pub fn with_rewards(mut self, rewards_scheduled: u128) -> Self {
        self.rewards_scheduled = Some(rewards_scheduled);
        self
    }
}

/// A merged metrics change, as stored in the metrics log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub id: Uuid,
    pub timestamp: DateTime<Local>,
    pub total_jobs_completed: u64,
    #[serde(with = "u128_string")]
    pub rewards_scheduled: u128,
}

impl MetricsUpdate {
    pub fn new(metrics: &MergedMetrics) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Local::now(),
            total_jobs_completed: metrics.total_jobs_completed,
            rewards_scheduled: metrics.rewards_scheduled,
        }
    }

    pub fn metrics(&self) -> MergedMetrics {
        MetricsSnapshot::new(self.total_jobs_completed, self.rewards_scheduled)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsPayload {
    id: Option<Uuid>,
    timestamp: Option<DateTime<Local>>,
    #[serde(default)]
    total_jobs_completed: u64,
    #[serde(default, with = "u128_string")]
    rewards_scheduled: u128,
}

impl LogRecord for MetricsUpdate {
    fn id(&self) -> Uuid {
        self.id
    }

    fn from_payload(payload: &str, frame_timestamp: Option<DateTime<Local>>) -> serde_json::Result<Self> {
        let p: MetricsPayload = serde_json::from_str(payload)?;
        Ok(Self {
            id: p.id.unwrap_or_else(Uuid::now_v7),
            timestamp: p.timestamp.or(frame_timestamp).unwrap_or_else(Local::now),
            total_jobs_completed: p.total_jobs_completed,
            rewards_scheduled: p.rewards_scheduled,
        })
    }
}

/// Big reward amounts travel as decimal strings; plain JSON numbers are accepted on read
mod u128_string {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        deserializer.deserialize_any(U128Visitor)
    }

    struct U128Visitor;

    impl Visitor<'_> for U128Visitor {
        type Value = u128;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a non-negative integer or decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
            Ok(v as u128)
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<u128, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
            u128::try_from(v).map_err(|_| E::custom("negative amount"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
            v.trim().parse().map_err(|_| E::custom(format!("invalid amount '{}'", v)))
        }
    }
}
