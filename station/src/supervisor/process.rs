//! One module subprocess: spawn, output readers, exit waiter and kill

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ModuleConfig;

/// Lifecycle of a supervised module within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    NotStarted,
    SyncingSource,
    Running,
    Restarting,
    ExitedOk,
    ExitedError,
}

/// Messages from a module's background tasks to the supervisor loop
#[derive(Debug)]
pub enum ModuleMessage {
    Stdout { module: String, line: String },
    Stderr { module: String, line: String },
    Exited { module: String, status: ExitOutcome },
}

/// How a module process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
    /// Waiting on the child failed
    Unknown,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }
        Self::Unknown
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {}", code),
            Self::Signal(signal) => write!(f, "signal {}", signal_name(*signal)),
            Self::Unknown => write!(f, "unknown status"),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string())
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    signal.to_string()
}

/// Everything needed to launch a module
#[derive(Debug, Clone)]
pub struct ModuleProcess {
    pub name: String,
    pub executable: String,
    pub args: Vec<String>,
    pub source_dir: PathBuf,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub state: ModuleState,
}

impl ModuleProcess {
    pub fn new(config: &ModuleConfig, work_dir: PathBuf) -> Self {
        Self {
            name: config.name.clone(),
            executable: config.executable.clone(),
            args: config.args.clone(),
            source_dir: PathBuf::from(&config.source),
            work_dir,
            env: config.env.clone(),
            state: ModuleState::NotStarted,
        }
    }

    /// Arguments with `{source}` replaced by the synced source directory
    pub fn resolved_args(&self) -> Vec<String> {
        let source = self.source_dir.to_string_lossy();
        self.args.iter().map(|a| a.replace("{source}", &source)).collect()
    }

    /// Launch the process and its reader and waiter tasks
    ///
    /// `base_env` is applied first, so per-module `env` entries override it.
    pub fn spawn(
        &mut self,
        base_env: &BTreeMap<String, String>,
        tx: mpsc::UnboundedSender<ModuleMessage>,
    ) -> std::io::Result<RunningModule> {
        debug!(module = %self.name, executable = %self.executable, "ModuleProcess::spawn: called");
        std::fs::create_dir_all(&self.work_dir)?;

        let mut child = Command::new(&self.executable)
            .args(self.resolved_args())
            .envs(base_env)
            .envs(&self.env)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        info!(module = %self.name, ?pid, "Module started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, self.name.clone(), tx.clone(), |module, line| {
                ModuleMessage::Stdout { module, line }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, self.name.clone(), tx.clone(), |module, line| {
                ModuleMessage::Stderr { module, line }
            }));
        }

        let name = self.name.clone();
        let waiter = tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome::from_status(status),
                Err(e) => {
                    warn!(module = %name, error = %e, "failed to wait for module");
                    ExitOutcome::Unknown
                }
            };
            debug!(module = %name, %outcome, "module process ended");
            let _ = tx.send(ModuleMessage::Exited {
                module: name,
                status: outcome,
            });
            outcome
        });

        self.state = ModuleState::Running;
        Ok(RunningModule {
            name: self.name.clone(),
            pid,
            readers,
            waiter,
        })
    }
}

fn spawn_reader<R>(
    stream: R,
    module: String,
    tx: mpsc::UnboundedSender<ModuleMessage>,
    wrap: fn(String, String) -> ModuleMessage,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(wrap(module.clone(), line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(module = %module, error = %e, "failed to read module output");
                    break;
                }
            }
        }
    })
}

/// Handles to a live module process
pub struct RunningModule {
    pub name: String,
    pid: Option<u32>,
    readers: Vec<JoinHandle<()>>,
    waiter: JoinHandle<ExitOutcome>,
}

impl RunningModule {
    /// Detach output readers so nothing more is reported for this process
    pub fn detach_readers(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn kill(mut self, grace: Duration) -> ExitOutcome {
        debug!(module = %self.name, pid = ?self.pid, "RunningModule::kill: called");
        self.detach_readers();

        if self.waiter.is_finished() {
            return (&mut self.waiter).await.unwrap_or(ExitOutcome::Unknown);
        }

        if let Some(pid) = self.pid {
            send_signal(pid, Termination::Graceful);
        }
        match tokio::time::timeout(grace, &mut self.waiter).await {
            Ok(joined) => joined.unwrap_or(ExitOutcome::Unknown),
            Err(_) => {
                warn!(module = %self.name, pid = ?self.pid, "Module did not stop gracefully, sending SIGKILL");
                if let Some(pid) = self.pid {
                    send_signal(pid, Termination::Forced);
                }
                (&mut self.waiter).await.unwrap_or(ExitOutcome::Unknown)
            }
        }
    }
}

impl Drop for RunningModule {
    fn drop(&mut self) {
        self.detach_readers();
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

#[cfg(unix)]
fn send_signal(pid: u32, termination: Termination) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let signal = match termination {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    debug!(pid, ?signal, "send_signal: called");
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid, error = %e, "send_signal: process already gone");
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, termination: Termination) {
    debug!(pid, ?termination, "send_signal: using taskkill");
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output();
}

/// Environment every module receives
pub fn module_env(
    station_id: &str,
    wallet_address: &str,
    state_dir: &Path,
    cache_dir: &Path,
    source_dir: &Path,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("STATION_ID".to_string(), station_id.to_string()),
        ("FIL_WALLET_ADDRESS".to_string(), wallet_address.to_string()),
        ("STATE_ROOT".to_string(), state_dir.to_string_lossy().into_owned()),
        ("CACHE_ROOT".to_string(), cache_dir.to_string_lossy().into_owned()),
        ("MODULE_SOURCE".to_string(), source_dir.to_string_lossy().into_owned()),
    ])
}
