//! Durable event logs
//!
//! - [`EventLog`] appends framed lines and rotates the file once it grows too large
//! - [`tail`] follows a log path and yields new lines as they land
//! - [`LogLine`] is the `[timestamp] text` framing shared by both

mod line;
mod tail;
mod writer;

pub use line::{LogLine, TIMESTAMP_FORMAT, format_timestamp, frame_lines, parse_timestamp, split_frame};
pub use tail::{DEFAULT_POLL_INTERVAL, DEFAULT_REPLAY_LINES, LineStream, TailMode, TailOptions, tail};
pub use writer::{EventLog, ROTATE_AT_BYTES, read_all};
