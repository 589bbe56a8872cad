//! Log line framing
//!
//! Every physical line in a station log looks like
//! `[3/14/2023, 10:38:14 AM] <payload>`. Payloads never contain raw newlines:
//! multi-line text is split into one frame per line, all sharing a timestamp.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

/// Timestamp layout used inside the frame brackets (US locale, local time)
pub const TIMESTAMP_FORMAT: &str = "%-m/%-d/%Y, %-I:%M:%S %p";

/// A single framed log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

impl LogLine {
    pub fn new(timestamp: DateTime<Local>, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            text: text.into(),
        }
    }

    /// Render as `[<timestamp>] <text>` without a trailing newline
    pub fn format(&self) -> String {
        format!("[{}] {}", format_timestamp(&self.timestamp), self.text)
    }

    /// Parse a framed line. Returns `None` when the frame or its timestamp is malformed.
    pub fn parse(line: &str) -> Option<Self> {
        let (stamp, text) = split_frame(line)?;
        let timestamp = parse_timestamp(stamp)?;
        Some(Self::new(timestamp, text))
    }
}

/// Split `[stamp] text` into its two halves without interpreting the stamp
pub fn split_frame(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('[')?;
    let close = rest.find("] ")?;
    Some((&rest[..close], &rest[close + 2..]))
}

/// Frame `text` as one line per logical line, all stamped with `timestamp`
pub fn frame_lines(timestamp: &DateTime<Local>, text: &str) -> Vec<String> {
    let stamp = format_timestamp(timestamp);
    text.split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .map(|l| format!("[{}] {}", stamp, l))
        .collect()
}

pub fn format_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(stamp: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(stamp.trim(), TIMESTAMP_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use proptest::prelude::*;

    #[test]
    fn test_parse_known_line() {
        let line = r#"[3/14/2023, 10:38:14 AM] {"source":"Saturn","type":"info","message":"beep boop"}"#;
        let parsed = LogLine::parse(line).unwrap();
        assert_eq!(parsed.timestamp.hour(), 10);
        assert_eq!(parsed.timestamp.minute(), 38);
        assert_eq!(parsed.text, r#"{"source":"Saturn","type":"info","message":"beep boop"}"#);
    }

    #[test]
    fn test_parse_pm_timestamp() {
        let parsed = LogLine::parse("[12/1/2024, 1:05:09 PM] hello").unwrap();
        assert_eq!(parsed.timestamp.hour(), 13);
        assert_eq!(parsed.text, "hello");
    }

    #[test]
    fn test_parse_rejects_unframed() {
        assert!(LogLine::parse("no frame here").is_none());
        assert!(LogLine::parse("[unterminated frame").is_none());
        assert!(LogLine::parse("[not a date] text").is_none());
    }

    #[test]
    fn test_split_frame_keeps_brackets_in_payload() {
        let (stamp, text) = split_frame("[1/2/2023, 3:04:05 AM] [module] said ] hi").unwrap();
        assert_eq!(stamp, "1/2/2023, 3:04:05 AM");
        assert_eq!(text, "[module] said ] hi");
    }

    #[test]
    fn test_frame_multiline_payload() {
        let now = Local::now();
        let lines = frame_lines(&now, "first\r\nsecond\nthird");
        assert_eq!(lines.len(), 3);
        let prefix = format!("[{}] ", format_timestamp(&now));
        assert_eq!(lines[0], format!("{}first", prefix));
        assert_eq!(lines[1], format!("{}second", prefix));
        assert_eq!(lines[2], format!("{}third", prefix));
    }

    proptest! {
        #[test]
        fn test_frames_never_contain_newlines(text in "[a-z \\n]{0,64}") {
            let now = Local::now();
            let lines = frame_lines(&now, &text);
            prop_assert_eq!(lines.len(), text.split('\n').count());
            for (framed, original) in lines.iter().zip(text.split('\n')) {
                prop_assert!(!framed.contains('\n'));
                let parsed = LogLine::parse(framed).unwrap();
                prop_assert_eq!(parsed.text, original);
            }
        }
    }
}
