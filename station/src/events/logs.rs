//! Per-module text logs, mirrored into the combined `all.log`

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::TailConfig;
use crate::log::{EventLog, LineStream, TailOptions, read_all, tail};
use crate::paths::StatePaths;

pub struct ModuleLogs {
    paths: StatePaths,
    all: Arc<EventLog>,
    logs: Mutex<HashMap<String, Arc<EventLog>>>,
    tail: TailConfig,
}

impl ModuleLogs {
    pub fn new(paths: StatePaths, all: Arc<EventLog>, tail: TailConfig) -> Self {
        Self {
            paths,
            all,
            logs: Mutex::new(HashMap::new()),
            tail,
        }
    }

    fn log_for(&self, module: &str) -> Arc<EventLog> {
        let mut logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        logs.entry(module.to_string())
            .or_insert_with(|| {
                debug!(module, "ModuleLogs: opening module log");
                Arc::new(EventLog::with_mirror(
                    self.paths.module_log(module),
                    module,
                    self.all.clone(),
                ))
            })
            .clone()
    }

    /// Append `text` to the module's log and to `all.log`
    pub fn append(&self, module: &str, text: &str) -> io::Result<()> {
        self.log_for(module).append(text)
    }

    /// Follow the module's log, replaying the last `from_last_n` lines first
    pub fn follow(&self, module: &str, options: TailOptions) -> LineStream {
        let options = TailOptions {
            mode: self.tail.mode,
            poll_interval: self.tail.poll_interval(),
            ..options
        };
        tail(self.paths.module_log(module), options)
    }

    /// Follow the combined log of every module
    pub fn follow_all(&self, options: TailOptions) -> LineStream {
        let options = TailOptions {
            mode: self.tail.mode,
            poll_interval: self.tail.poll_interval(),
            ..options
        };
        tail(self.all.path(), options)
    }

    /// Full contents of the module's log; empty if nothing was logged yet
    pub fn get(&self, module: &str) -> io::Result<String> {
        read_all(self.paths.module_log(module))
    }

    /// Full contents of the combined log
    pub fn get_all(&self) -> io::Result<String> {
        read_all(self.all.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogLine, TailMode};
    use std::time::Duration;
    use tempfile::tempdir;

    fn logs(paths: &StatePaths) -> ModuleLogs {
        ModuleLogs::new(
            paths.clone(),
            Arc::new(EventLog::open(paths.all_log())),
            TailConfig {
                mode: TailMode::Poll,
                poll_interval_ms: 20,
            },
        )
    }

    #[test]
    fn test_append_and_get() {
        let temp = tempdir().unwrap();
        let paths = StatePaths::new(temp.path(), temp.path().join("cache"));
        let logs = logs(&paths);

        assert_eq!(logs.get("spark").unwrap(), "");
        logs.append("spark", "hello\nworld").unwrap();
        logs.append("voyager", "other").unwrap();

        let spark = logs.get("spark").unwrap();
        let texts: Vec<_> = spark.lines().map(|l| LogLine::parse(l).unwrap().text).collect();
        assert_eq!(texts, vec!["hello", "world"]);

        let all = logs.get_all().unwrap();
        assert_eq!(all.lines().count(), 3);
        assert!(all.contains("voyager: other"));
    }

    #[tokio::test]
    async fn test_follow_yields_new_lines() {
        let temp = tempdir().unwrap();
        let paths = StatePaths::new(temp.path(), temp.path().join("cache"));
        let logs = logs(&paths);
        logs.append("spark", "old").unwrap();

        let mut stream = logs.follow("spark", TailOptions::default().from_last_n(1));
        logs.append("spark", "new").unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), stream.next_line()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), stream.next_line()).await.unwrap().unwrap();
        assert!(first.ends_with("] old"));
        assert!(second.ends_with("] new"));
    }
}
