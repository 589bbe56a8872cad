//! Log tailer
//!
//! [`tail`] turns a log path into a live [`LineStream`]: the last few lines
//! already on disk are replayed, then every appended line is yielded in order
//! until the stream is cancelled or dropped. The file is re-resolved by path on
//! every wake-up so rotation (replace or truncate) is picked up transparently.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lines replayed from the existing file when a tail starts
pub const DEFAULT_REPLAY_LINES: usize = 10;

/// Buffered lines between the tail task and its consumer
const CHANNEL_CAPACITY: usize = 1024;

/// Interval used in [`TailMode::Poll`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Slow poll that runs alongside native notifications to catch missed events
const SAFETY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How file changes are detected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TailMode {
    /// Native notifications where reliable, polling otherwise
    #[default]
    Auto,
    Notify,
    Poll,
}

impl TailMode {
    fn resolve(self) -> Self {
        match self {
            TailMode::Auto if cfg!(target_os = "macos") => TailMode::Poll,
            TailMode::Auto => TailMode::Notify,
            other => other,
        }
    }
}

/// Options for [`tail`]
#[derive(Debug, Clone)]
pub struct TailOptions {
    pub from_last_n: usize,
    pub cancel: CancellationToken,
    pub mode: TailMode,
    pub poll_interval: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            from_last_n: DEFAULT_REPLAY_LINES,
            cancel: CancellationToken::new(),
            mode: TailMode::Auto,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl TailOptions {
    pub fn from_last_n(mut self, n: usize) -> Self {
        self.from_last_n = n;
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn mode(mut self, mode: TailMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Live sequence of lines from a tailed file
///
/// Ends with `None` once cancelled. Dropping the stream cancels the tail.
#[derive(Debug)]
pub struct LineStream {
    rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl LineStream {
    /// Next line, or `None` once the tail is cancelled
    pub async fn next_line(&mut self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            line = self.rx.recv() => line,
        }
    }

    /// Stop tailing. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for LineStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start tailing `path`
///
/// The replay snapshot is taken before this returns, so anything appended
/// afterwards is guaranteed to be delivered. Must be called inside a tokio runtime.
pub fn tail(path: impl AsRef<Path>, options: TailOptions) -> LineStream {
    let path = path.as_ref().to_path_buf();
    debug!(?path, from_last_n = options.from_last_n, mode = ?options.mode, "tail: called");

    let mut cursor = TailCursor::new(path.clone());
    let replay = cursor.replay(options.from_last_n).unwrap_or_else(|e| {
        warn!(?path, error = %e, "tail: failed to read existing lines");
        Vec::new()
    });

    let (tx, rx) = mpsc::channel(replay.len() + CHANNEL_CAPACITY);
    let cancel = options.cancel.clone();
    for line in replay {
        if let Err(e) = tx.try_send(line) {
            warn!(?path, error = %e, "tail: failed to queue replayed line");
            break;
        }
    }

    let (wake_tx, wake_rx) = mpsc::unbounded_channel();
    let watcher = match options.mode.resolve() {
        TailMode::Poll => None,
        _ => match watch_parent(&path, wake_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(?path, error = %e, "tail: native file watch unavailable, falling back to polling");
                None
            }
        },
    };

    let interval = if watcher.is_some() {
        SAFETY_POLL_INTERVAL
    } else {
        options.poll_interval
    };

    tokio::spawn(run_tail(cursor, watcher, wake_rx, interval, tx, cancel.clone()));

    LineStream { rx, cancel }
}

async fn run_tail(
    mut cursor: TailCursor,
    watcher: Option<RecommendedWatcher>,
    mut wake_rx: mpsc::UnboundedReceiver<()>,
    interval: Duration,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    debug!(path = ?cursor.path, ?interval, native = watcher.is_some(), "run_tail: started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'outer: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            Some(()) = wake_rx.recv() => {}
            _ = ticker.tick() => {}
        }

        let lines = match cursor.read_new() {
            Ok(lines) => lines,
            Err(e) => {
                warn!(path = ?cursor.path, error = %e, "run_tail: read failed");
                continue;
            }
        };

        for line in lines {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'outer,
                sent = tx.send(line) => {
                    if sent.is_err() {
                        break 'outer;
                    }
                }
            }
        }
    }

    drop(watcher);
    debug!(path = ?cursor.path, "run_tail: stopped");
}

fn watch_parent(path: &Path, wake_tx: mpsc::UnboundedSender<()>) -> notify::Result<RecommendedWatcher> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path.file_name().map(|n| n.to_os_string());

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            let relevant = event.paths.is_empty()
                || event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if relevant {
                let _ = wake_tx.send(());
            }
        }
        Err(e) => warn!(error = %e, "tail watcher error"),
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity(u64, u64);

#[cfg(unix)]
fn file_identity(meta: &fs::Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    FileIdentity(meta.dev(), meta.ino())
}

#[cfg(not(unix))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity(Option<std::time::SystemTime>);

#[cfg(not(unix))]
fn file_identity(meta: &fs::Metadata) -> FileIdentity {
    FileIdentity(meta.created().ok())
}

/// Read position within the file currently at `path`
#[derive(Debug)]
struct TailCursor {
    path: PathBuf,
    offset: u64,
    identity: Option<FileIdentity>,
    partial: Vec<u8>,
}

impl TailCursor {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            identity: None,
            partial: Vec::new(),
        }
    }

    /// Position at the end of the current file and return its last `n` complete lines
    fn replay(&mut self, n: usize) -> io::Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let meta = file.metadata()?;
        let mut bytes = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut bytes)?;

        self.identity = Some(file_identity(&meta));
        self.offset = bytes.len() as u64;

        let lines = self.split_lines(&bytes);
        let skip = lines.len().saturating_sub(n);
        Ok(lines.into_iter().skip(skip).collect())
    }

    /// Lines appended since the last read, following rotation if it happened
    fn read_new(&mut self) -> io::Result<Vec<String>> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let identity = file_identity(&meta);
        if self.identity != Some(identity) || meta.len() < self.offset {
            if self.identity.is_some() {
                debug!(path = ?self.path, "TailCursor: file rotated, reading from start");
            }
            self.identity = Some(identity);
            self.offset = 0;
            self.partial.clear();
        }

        if meta.len() == self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        self.offset += bytes.len() as u64;

        Ok(self.split_lines(&bytes))
    }

    fn split_lines(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);
        let Some(last_newline) = self.partial.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        complete[..complete.len() - 1]
            .split(|&b| b == b'\n')
            .map(|l| {
                let l = l.strip_suffix(b"\r").unwrap_or(l);
                String::from_utf8_lossy(l).into_owned()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use tempfile::tempdir;

    fn append(path: &Path, text: &str) {
        let mut f = fs::OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    async fn next(stream: &mut LineStream) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), stream.next_line())
            .await
            .expect("timed out waiting for line")
    }

    fn poll_options() -> TailOptions {
        TailOptions {
            poll_interval: Duration::from_millis(20),
            ..TailOptions::default()
        }
        .mode(TailMode::Poll)
    }

    #[tokio::test]
    async fn test_replays_last_lines() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("activity.log");
        append(&path, "a\nb\nc\nd\n");

        let mut stream = tail(&path, poll_options().from_last_n(2));
        assert_eq!(next(&mut stream).await.as_deref(), Some("c"));
        assert_eq!(next(&mut stream).await.as_deref(), Some("d"));
    }

    #[tokio::test]
    async fn test_yields_appended_lines_in_order() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("activity.log");
        append(&path, "old\n");

        let mut stream = tail(&path, poll_options().from_last_n(0));
        append(&path, "one\ntwo\n");
        append(&path, "thr");
        append(&path, "ee\n");

        assert_eq!(next(&mut stream).await.as_deref(), Some("one"));
        assert_eq!(next(&mut stream).await.as_deref(), Some("two"));
        assert_eq!(next(&mut stream).await.as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn test_waits_for_missing_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("later.log");

        let mut stream = tail(&path, poll_options());
        append(&path, "created\n");

        assert_eq!(next(&mut stream).await.as_deref(), Some("created"));
    }

    #[tokio::test]
    async fn test_follows_rotation() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("metrics.log");
        append(&path, "before rotation\n");

        let mut stream = tail(&path, poll_options().from_last_n(0));
        append(&path, "delivered\n");
        assert_eq!(next(&mut stream).await.as_deref(), Some("delivered"));

        fs::rename(&path, temp.path().join("metrics.log.1")).unwrap();
        append(&path, "fresh file\n");
        assert_eq!(next(&mut stream).await.as_deref(), Some("fresh file"));
    }

    #[tokio::test]
    async fn test_follows_truncation() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("module.log");
        append(&path, "a long first line that will be truncated\n");

        let mut stream = tail(&path, poll_options().from_last_n(0));
        fs::write(&path, "short\n").unwrap();
        assert_eq!(next(&mut stream).await.as_deref(), Some("short"));
    }

    #[tokio::test]
    async fn test_native_mode_yields_lines() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("all.log");
        append(&path, "");

        let mut stream = tail(&path, TailOptions::default().mode(TailMode::Notify).from_last_n(0));
        append(&path, "notified\n");
        assert_eq!(next(&mut stream).await.as_deref(), Some("notified"));
    }

    #[tokio::test]
    async fn test_cancellation_ends_stream() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("activity.log");
        append(&path, "x\n");

        let cancel = CancellationToken::new();
        let mut stream = tail(&path, poll_options().cancel(cancel.clone()));
        cancel.cancel();
        cancel.cancel();

        assert_eq!(next(&mut stream).await, None);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_malformed_lines_pass_through() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("activity.log");
        append(&path, "not json at all\n");

        let mut stream = tail(&path, poll_options());
        assert_eq!(next(&mut stream).await.as_deref(), Some("not json at all"));
    }

    #[tokio::test]
    async fn test_unbounded_replay_request_returns_whole_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("activity.log");
        append(&path, "a\nb\nc\n");

        let mut stream = tail(&path, poll_options().from_last_n(usize::MAX));
        assert_eq!(next(&mut stream).await.as_deref(), Some("a"));
        assert_eq!(next(&mut stream).await.as_deref(), Some("b"));
        assert_eq!(next(&mut stream).await.as_deref(), Some("c"));

        append(&path, "d\n");
        assert_eq!(next(&mut stream).await.as_deref(), Some("d"));
    }
}
