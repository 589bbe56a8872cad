//! Durable, rotating, append-only log writer
//!
//! Lines are framed by [`super::line`] and flushed on every append so that any
//! reader opening the file afterwards sees them. Once the active file grows past
//! [`ROTATE_AT_BYTES`] it is gzip-compressed into a single historical file and a
//! fresh file is started in its place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, error};

use super::line::frame_lines;

/// Size threshold that triggers rotation (10 MiB)
pub const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;

/// Append-only log file with optional mirroring into a combined log
pub struct EventLog {
    path: PathBuf,
    rotate_at: u64,
    mirror: Option<(String, Arc<EventLog>)>,
    file: Mutex<Option<File>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.path)
            .field("rotate_at", &self.rotate_at)
            .field("mirror", &self.mirror.as_ref().map(|(label, log)| (label, &log.path)))
            .finish()
    }
}

impl EventLog {
    /// Create a log writing to `path`. The file and its parent directory are created lazily.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLog::open: called");
        Self {
            path,
            rotate_at: ROTATE_AT_BYTES,
            mirror: None,
            file: Mutex::new(None),
        }
    }

    /// Create a log whose lines are also copied into `mirror`, prefixed with `label`
    pub fn with_mirror(path: impl AsRef<Path>, label: impl Into<String>, mirror: Arc<EventLog>) -> Self {
        let mut log = Self::open(path);
        log.mirror = Some((label.into(), mirror));
        log
    }

    /// Override the rotation threshold
    pub fn rotate_at(mut self, bytes: u64) -> Self {
        self.rotate_at = bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the compressed historical file
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".1.gz");
        self.path.with_file_name(name)
    }

    /// Append `text`, one framed line per logical line
    pub fn append(&self, text: &str) -> io::Result<()> {
        let lines = frame_lines(&Local::now(), text);
        self.write_lines(&lines)?;

        if let Some((label, mirror)) = &self.mirror {
            let mirrored: Vec<String> = lines.iter().map(|l| mirror_line(label, l)).collect();
            if let Err(e) = mirror.write_lines(&mirrored) {
                error!(path = ?mirror.path, error = %e, "EventLog::append: failed to mirror lines");
            }
        }
        Ok(())
    }

    fn write_lines(&self, lines: &[String]) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        self.rotate_if_needed(&mut guard);

        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            *guard = Some(file);
        }

        let Some(file) = guard.as_mut() else {
            return Err(io::Error::other("log file unavailable"));
        };

        let mut writer = BufWriter::new(&*file);
        for line in lines {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Rotate when the active file exceeds the threshold. Errors are logged, never returned.
    fn rotate_if_needed(&self, guard: &mut Option<File>) {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                // File vanished underneath us; reopen on the next write
                *guard = None;
                return;
            }
        };
        if size < self.rotate_at {
            return;
        }

        debug!(path = ?self.path, size, "EventLog: rotating");
        *guard = None;
        if let Err(e) = self.rotate() {
            error!(path = ?self.path, error = %e, "EventLog: rotation failed");
        }
    }

    fn rotate(&self) -> io::Result<()> {
        let target = self.rotated_path();
        let tmp = target.with_extension("gz.tmp");
        {
            let mut input = BufReader::new(File::open(&self.path)?);
            let output = File::create(&tmp)?;
            let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?.flush()?;
        }
        fs::rename(&tmp, &target)?;
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

fn mirror_line(label: &str, framed: &str) -> String {
    match super::line::split_frame(framed) {
        Some((stamp, text)) => format!("[{}] {}: {}", stamp, label, text),
        None => format!("{}: {}", label, framed),
    }
}

/// Read a whole log file, returning an empty string when it does not exist
pub fn read_all(path: impl AsRef<Path>) -> io::Result<String> {
    match fs::read_to_string(path.as_ref()) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}
