//! Event Bus - durable pub/sub shared by the activity and metrics streams
//!
//! A [`Bus`] writes every published record to its [`EventLog`] and broadcasts it
//! to in-process subscribers right away. Subscribers additionally tail the log,
//! which is how they see records written before they subscribed or by another
//! process. Both paths are merged and deduplicated by record id, so each record
//! is delivered exactly once, in append order.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use futures::Stream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::LogRecord;
use crate::config::TailConfig;
use crate::log::{EventLog, LineStream, TailOptions, parse_timestamp, read_all, split_frame, tail};

/// Default broadcast capacity (records)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Options for [`Bus::subscribe`]
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Records already in the log to replay first
    pub from_last_n: usize,
    pub cancel: CancellationToken,
}

impl SubscribeOptions {
    pub fn from_last_n(n: usize) -> Self {
        Self {
            from_last_n: n,
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Durable pub/sub over one log file
pub struct Bus<R: LogRecord> {
    log: EventLog,
    tx: broadcast::Sender<R>,
    tail: TailConfig,
}

impl<R: LogRecord> Bus<R> {
    pub fn new(log: EventLog, tail: TailConfig) -> Self {
        debug!(path = ?log.path(), "Bus::new: creating bus");
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { log, tx, tail }
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    /// Broadcast `record` to live subscribers, then append it to the log
    pub fn publish(&self, record: &R) -> io::Result<()> {
        let json = serde_json::to_string(record).map_err(io::Error::other)?;
        debug!(id = %record.id(), "Bus::publish");
        // No subscribers is fine
        let _ = self.tx.send(record.clone());
        self.log.append(&json)
    }

    /// Live sequence of records: the last `from_last_n` stored ones, then every new one
    pub fn subscribe(&self, options: SubscribeOptions) -> Subscription<R> {
        debug!(path = ?self.path(), from_last_n = options.from_last_n, "Bus::subscribe: new subscriber");
        let local = self.tx.subscribe();
        let lines = tail(
            self.path(),
            TailOptions {
                from_last_n: options.from_last_n,
                cancel: options.cancel.child_token(),
                mode: self.tail.mode,
                poll_interval: self.tail.poll_interval(),
            },
        );
        Subscription {
            local: Some(local),
            lines,
            seen: DeliveredIds::default(),
            cancel: options.cancel,
        }
    }

    /// Every record currently stored in the log
    pub fn snapshot(&self) -> io::Result<Vec<R>> {
        read_records(self.path())
    }
}

/// Parse one framed log line into a record
pub fn parse_line<R: LogRecord>(line: &str) -> serde_json::Result<R> {
    match split_frame(line) {
        Some((stamp, payload)) => R::from_payload(payload, parse_timestamp(stamp)),
        None => R::from_payload(line, None),
    }
}

/// Parse a whole log file, skipping lines that do not decode
pub fn read_records<R: LogRecord>(path: &Path) -> io::Result<Vec<R>> {
    let content = read_all(path)?;
    let mut records = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line::<R>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(?path, line, error = %e, "read_records: skipping unparsable line"),
        }
    }
    debug!(?path, count = records.len(), "read_records: loaded records");
    Ok(records)
}

/// A live subscription returned by [`Bus::subscribe`]
pub struct Subscription<R: LogRecord> {
    local: Option<broadcast::Receiver<R>>,
    lines: LineStream,
    seen: DeliveredIds,
    cancel: CancellationToken,
}

impl<R: LogRecord> Subscription<R> {
    /// Next record, or `None` once cancelled
    pub async fn next(&mut self) -> Option<R> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                line = self.lines.next_line() => {
                    let line = line?;
                    match parse_line::<R>(&line) {
                        Ok(record) => {
                            // Publish broadcasts before appending, so once the local queue is
                            // empty nothing the tail yields can still arrive locally
                            let local_pending = self.local.as_ref().is_some_and(|rx| !rx.is_empty());
                            if self.seen.from_tail(record.id(), local_pending) {
                                return Some(record);
                            }
                        }
                        Err(e) => warn!(line, error = %e, "Subscription: skipping unparsable line"),
                    }
                }
                received = recv_local(&mut self.local) => match received {
                    Ok(record) => {
                        if self.seen.from_local(record.id()) {
                            return Some(record);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The tail still carries everything that was missed
                        warn!(missed = n, "Subscription: lagged behind local broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.local = None;
                    }
                },
            }
        }
    }

    /// Stop the subscription and release its file watch. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.lines.cancel();
    }

    /// Adapt into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = R> {
        futures::stream::unfold(self, |mut sub| async move { sub.next().await.map(|r| (r, sub)) })
    }
}

impl<R: LogRecord> Drop for Subscription<R> {
    fn drop(&mut self) {
        self.lines.cancel();
    }
}

async fn recv_local<R: Clone>(local: &mut Option<broadcast::Receiver<R>>) -> Result<R, broadcast::error::RecvError> {
    match local {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Ids delivered by one path and still expected on the other
#[derive(Debug, Default)]
struct DeliveredIds {
    /// Delivered from the broadcast, not yet read back from the log
    awaiting_tail: HashSet<Uuid>,
    /// Delivered from the log, still queued in the broadcast receiver
    awaiting_local: HashSet<Uuid>,
}

impl DeliveredIds {
    /// Returns false if the tail already delivered `id`
    fn from_local(&mut self, id: Uuid) -> bool {
        if self.awaiting_local.remove(&id) {
            return false;
        }
        self.awaiting_tail.insert(id);
        true
    }

    /// Returns false if the broadcast already delivered `id`. With nothing
    /// queued locally, no earlier tail delivery can still be duplicated.
    fn from_tail(&mut self, id: Uuid, local_pending: bool) -> bool {
        if !local_pending {
            self.awaiting_local.clear();
        }
        if self.awaiting_tail.remove(&id) {
            return false;
        }
        if local_pending {
            self.awaiting_local.insert(id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{ActivityEvent, NewActivity};
    use crate::log::TailMode;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_tail() -> TailConfig {
        TailConfig {
            mode: TailMode::Poll,
            poll_interval_ms: 20,
        }
    }

    async fn next<R: LogRecord>(sub: &mut Subscription<R>) -> Option<R> {
        tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("timed out waiting for record")
    }

    #[test]
    fn test_delivered_ids_forget_after_both_paths() {
        let mut ids = DeliveredIds::default();
        let first = Uuid::now_v7();
        assert!(ids.from_local(first));
        assert!(!ids.from_tail(first, false));
        assert!(ids.awaiting_tail.is_empty());

        let second = Uuid::now_v7();
        assert!(ids.from_tail(second, true));
        assert!(!ids.from_local(second));
        assert!(ids.awaiting_local.is_empty());

        // Another writer's record never shows up locally
        let foreign = Uuid::now_v7();
        assert!(ids.from_tail(foreign, true));
        assert!(ids.from_tail(Uuid::now_v7(), false));
        assert!(ids.awaiting_local.is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_exactly_once() {
        let temp = tempdir().unwrap();
        let bus: Bus<ActivityEvent> = Bus::new(EventLog::open(temp.path().join("activity.log")), fast_tail());
        let mut sub = bus.subscribe(SubscribeOptions::from_last_n(0));

        let first = NewActivity::info("spark", "one").stamp();
        let second = NewActivity::info("spark", "two").stamp();
        bus.publish(&first).unwrap();
        bus.publish(&second).unwrap();

        assert_eq!(next(&mut sub).await.unwrap().id, first.id);
        assert_eq!(next(&mut sub).await.unwrap().id, second.id);

        // Give the tail time to re-read both lines; they must not be delivered again
        let extra = tokio::time::timeout(Duration::from_millis(300), sub.next()).await;
        assert!(extra.is_err(), "duplicate delivery: {:?}", extra);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_is_delivered_exactly_once() {
        let temp = tempdir().unwrap();
        let bus: Bus<ActivityEvent> = Bus::new(EventLog::open(temp.path().join("activity.log")), fast_tail());
        let mut sub = bus.subscribe(SubscribeOptions::from_last_n(0));

        let published: Vec<Uuid> = (0..6000)
            .map(|i| {
                let event = NewActivity::info("spark", format!("burst {}", i)).stamp();
                bus.publish(&event).unwrap();
                event.id
            })
            .collect();

        let mut received = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), sub.next()).await {
            received.push(event.id);
        }

        assert_eq!(received.len(), published.len());
        assert_eq!(received, published);
    }

    #[tokio::test]
    async fn test_into_stream() {
        use futures::StreamExt;

        let temp = tempdir().unwrap();
        let bus: Bus<ActivityEvent> = Bus::new(EventLog::open(temp.path().join("activity.log")), fast_tail());
        for i in 0..3 {
            bus.publish(&NewActivity::info("spark", format!("event {}", i)).stamp()).unwrap();
        }

        let stream = bus.subscribe(SubscribeOptions::from_last_n(3)).into_stream();
        let messages: Vec<_> = tokio::time::timeout(Duration::from_secs(5), stream.take(3).collect::<Vec<_>>())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["event 0", "event 1", "event 2"]);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_from_log() {
        let temp = tempdir().unwrap();
        let bus: Bus<ActivityEvent> = Bus::new(EventLog::open(temp.path().join("activity.log")), fast_tail());
        let stored = NewActivity::info("spark", "before").stamp();
        bus.publish(&stored).unwrap();

        let mut sub = bus.subscribe(SubscribeOptions::from_last_n(5));
        assert_eq!(next(&mut sub).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_records_from_other_writers_are_delivered() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("activity.log");
        let bus: Bus<ActivityEvent> = Bus::new(EventLog::open(&path), fast_tail());
        let mut sub = bus.subscribe(SubscribeOptions::from_last_n(0));

        let other = EventLog::open(&path);
        other.append("garbage that is not json").unwrap();
        other
            .append(r#"{"source":"Saturn","type":"info","message":"beep boop"}"#)
            .unwrap();

        let event = next(&mut sub).await.unwrap();
        assert_eq!(event.source, "Saturn");
        assert_eq!(event.message, "beep boop");
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let temp = tempdir().unwrap();
        let bus: Bus<ActivityEvent> = Bus::new(EventLog::open(temp.path().join("activity.log")), fast_tail());
        let cancel = CancellationToken::new();
        let mut sub = bus.subscribe(SubscribeOptions::from_last_n(0).with_cancel(cancel.clone()));

        cancel.cancel();
        bus.publish(&NewActivity::info("spark", "after cancel").stamp()).unwrap();
        assert!(next(&mut sub).await.is_none());
        sub.cancel();
    }

    #[test]
    fn test_snapshot_skips_bad_lines() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("activity.log");
        std::fs::write(
            &path,
            "[3/14/2023, 10:38:14 AM] {\"source\":\"Saturn\",\"type\":\"info\",\"message\":\"beep boop\"}\n\
             [3/14/2023, 10:38:15 AM] {broken\n\n",
        )
        .unwrap();

        let records: Vec<ActivityEvent> = read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "beep boop");
    }
}
