//! Supervisor - runs the configured modules as one restartable group
//!
//! One run cycles through:
//!
//! ```text
//! SyncSources → SpawnAll → Running ─┬─ update detected ─→ KillAll → SpawnAll (sources already fresh)
//!                                   ├─ module exited ───→ KillAll → Err(ModuleExited)
//!                                   └─ cancelled ───────→ KillAll → Ok(())
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::ModuleEvent;
use super::process::{ExitOutcome, ModuleMessage, ModuleProcess, ModuleState, RunningModule, module_env};
use crate::collaborators::{Collaborators, RewardLookup};
use crate::config::{ModuleConfig, SupervisorConfig};
use crate::events::{EventBuses, PartialMetrics};
use crate::identity::Keypair;
use crate::paths::StatePaths;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::throttle::ReportThrottle;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to sync source of module {module}: {reason}")]
    SourceSync { module: String, reason: String },

    #[error("failed to start module {module}: {source}")]
    Spawn {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("module {module} exited unexpectedly with {outcome}")]
    ModuleExited { module: String, outcome: ExitOutcome },
}

/// Timing knobs of a supervisor run
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub update_interval: Duration,
    pub kill_grace: Duration,
    pub report_window: Duration,
    pub reward_timeout: Duration,
    pub sync_retry: RetryPolicy,
    pub reward_retry: RetryPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for SupervisorOptions {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            update_interval: config.update_interval(),
            kill_grace: config.kill_grace(),
            report_window: config.report_window(),
            reward_timeout: config.reward_timeout(),
            sync_retry: RetryPolicy::default(),
            reward_retry: RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
        }
    }
}

/// Everything a supervisor run depends on
pub struct SupervisorContext {
    pub modules: Vec<ModuleConfig>,
    pub paths: StatePaths,
    pub identity: Keypair,
    pub wallet_address: String,
    pub buses: EventBuses,
    pub collaborators: Collaborators,
    pub options: SupervisorOptions,
}

/// Why the running phase ended
#[derive(Debug)]
enum Outcome {
    UpdateDetected,
    ModuleExited { module: String, outcome: ExitOutcome },
    Shutdown,
}

pub struct Supervisor {
    modules: Vec<ModuleConfig>,
    processes: Vec<ModuleProcess>,
    paths: StatePaths,
    station_id: String,
    wallet_address: String,
    buses: EventBuses,
    collaborators: Collaborators,
    options: SupervisorOptions,
    crash_reports: ReportThrottle,
}

impl Supervisor {
    pub fn new(ctx: SupervisorContext) -> Self {
        let processes = ctx
            .modules
            .iter()
            .map(|m| ModuleProcess::new(m, ctx.paths.module_state_dir(&m.name)))
            .collect();
        Self {
            processes,
            modules: ctx.modules,
            station_id: ctx.identity.public_key_hex(),
            paths: ctx.paths,
            wallet_address: ctx.wallet_address,
            buses: ctx.buses,
            collaborators: ctx.collaborators,
            crash_reports: ReportThrottle::new(ctx.options.report_window),
            options: ctx.options,
        }
    }

    pub fn module_states(&self) -> Vec<(String, ModuleState)> {
        self.processes.iter().map(|p| (p.name.clone(), p.state)).collect()
    }

    /// Run until cancelled (`Ok`) or until a module exits on its own (`Err`)
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        debug!(modules = self.modules.len(), "Supervisor::run: called");
        info!(modules = self.modules.len(), "Supervisor starting");

        let mut sources_fresh = false;
        loop {
            if !std::mem::take(&mut sources_fresh) {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Supervisor::run: cancelled during source sync");
                        return Ok(());
                    }
                    synced = self.sync_sources() => synced?,
                }
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            let running = self.spawn_all(tx).await?;
            let (jobs_tx, metrics_worker) = self.spawn_metrics_worker();

            let outcome = self.supervise(&cancel, &mut rx, &jobs_tx).await;
            debug!(?outcome, "Supervisor::run: running phase ended");
            drop(jobs_tx);

            self.kill_all(running).await;

            match outcome {
                Outcome::Shutdown => {
                    metrics_worker.abort();
                    for process in &mut self.processes {
                        process.state = ModuleState::ExitedOk;
                    }
                    info!("Supervisor stopped");
                    return Ok(());
                }
                Outcome::UpdateDetected => {
                    let _ = metrics_worker.await;
                    info!("Restarting modules with updated sources");
                    sources_fresh = true;
                }
                Outcome::ModuleExited { module, outcome } => {
                    metrics_worker.abort();
                    for process in &mut self.processes {
                        process.state = if process.name == module && !outcome.success() {
                            ModuleState::ExitedError
                        } else {
                            ModuleState::ExitedOk
                        };
                    }
                    let err = SupervisorError::ModuleExited { module, outcome };
                    error!(error = %err, "Module exited, stopping all modules");
                    if self.crash_reports.should_report() {
                        self.collaborators.errors.report("module exited", &err);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Initial sync: retried with backoff, fatal when retries run out
    async fn sync_sources(&mut self) -> Result<(), SupervisorError> {
        debug!("Supervisor::sync_sources: called");
        for (config, process) in self.modules.iter().zip(self.processes.iter_mut()) {
            process.state = ModuleState::SyncingSource;
            let sources = self.collaborators.sources.as_ref();
            let update = retry_with_backoff(self.options.sync_retry, "source sync", move || {
                sources.resolve_latest_source(config)
            })
            .await
            .map_err(|e| SupervisorError::SourceSync {
                module: config.name.clone(),
                reason: format!("{:#}", e),
            })?;
            debug!(module = %config.name, path = %update.local_path.display(), "Supervisor::sync_sources: synced");
            process.source_dir = update.local_path;
        }
        Ok(())
    }

    /// Periodic re-check; failures are logged and retried on the next tick
    async fn check_for_updates(&mut self) -> bool {
        debug!("Supervisor::check_for_updates: called");
        let mut changed = false;
        for (config, process) in self.modules.iter().zip(self.processes.iter_mut()) {
            match self.collaborators.sources.resolve_latest_source(config).await {
                Ok(update) if update.changed => {
                    info!(module = %config.name, "Module source changed");
                    process.source_dir = update.local_path;
                    changed = true;
                }
                Ok(_) => {}
                Err(e) => warn!(module = %config.name, error = %e, "Failed to check module for updates"),
            }
        }
        changed
    }

    async fn spawn_all(&mut self, tx: mpsc::UnboundedSender<ModuleMessage>) -> Result<Vec<RunningModule>, SupervisorError> {
        debug!("Supervisor::spawn_all: called");
        let mut running = Vec::with_capacity(self.processes.len());
        for process in &mut self.processes {
            let env = module_env(
                &self.station_id,
                &self.wallet_address,
                &self.paths.module_state_dir(&process.name),
                &self.paths.module_cache_dir(&process.name),
                &process.source_dir,
            );
            match process.spawn(&env, tx.clone()) {
                Ok(handle) => running.push(handle),
                Err(source) => {
                    process.state = ModuleState::ExitedError;
                    let module = process.name.clone();
                    error!(%module, error = %source, "Failed to start module");
                    for handle in running {
                        handle.kill(self.options.kill_grace).await;
                    }
                    return Err(SupervisorError::Spawn { module, source });
                }
            }
        }
        Ok(running)
    }

    async fn kill_all(&self, running: Vec<RunningModule>) {
        debug!(count = running.len(), "Supervisor::kill_all: called");
        let grace = self.options.kill_grace;
        let outcomes = futures::future::join_all(running.into_iter().map(|r| {
            let name = r.name.clone();
            async move { (name, r.kill(grace).await) }
        }))
        .await;
        for (module, outcome) in outcomes {
            debug!(%module, %outcome, "Supervisor::kill_all: module stopped");
        }
    }

    async fn supervise(
        &mut self,
        cancel: &CancellationToken,
        rx: &mut mpsc::UnboundedReceiver<ModuleMessage>,
        jobs_tx: &mpsc::UnboundedSender<(String, u64)>,
    ) -> Outcome {
        let every = self.options.update_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Shutdown requested, stopping modules");
                    return Outcome::Shutdown;
                }

                Some(message) = rx.recv() => {
                    match message {
                        ModuleMessage::Stdout { module, line } => self.handle_stdout(&module, &line, jobs_tx),
                        ModuleMessage::Stderr { module, line } => self.append_log(&module, &line),
                        ModuleMessage::Exited { module, status } => {
                            self.record_exit(&module, status);
                            return Outcome::ModuleExited { module, outcome: status };
                        }
                    }
                }

                _ = ticker.tick() => {
                    let changed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Outcome::Shutdown,
                        changed = self.check_for_updates() => changed,
                    };
                    if changed {
                        for process in &mut self.processes {
                            process.state = ModuleState::Restarting;
                        }
                        return Outcome::UpdateDetected;
                    }
                }
            }
        }
    }

    fn handle_stdout(&self, module: &str, line: &str, jobs_tx: &mpsc::UnboundedSender<(String, u64)>) {
        let event = match ModuleEvent::parse(line) {
            Ok(event) => event,
            Err(e) => {
                debug!(module, error = %e, "Supervisor: stdout line is not an event");
                self.append_log(module, line);
                return;
            }
        };
        debug!(module, ?event, "Supervisor: module event");

        let activity = &self.buses.activity;
        let submitted = match event {
            ModuleEvent::Started { message } => {
                activity.info(module, message.unwrap_or_else(|| format!("{} started", module)))
            }
            ModuleEvent::Info { message } => activity.info(module, message),
            ModuleEvent::Error { message } => activity.error(module, message),
            ModuleEvent::JobsCompleted { total } => {
                let _ = jobs_tx.send((module.to_string(), total));
                return;
            }
        };
        if let Err(e) = submitted {
            warn!(module, error = %e, "Failed to record module activity");
        }
    }

    fn append_log(&self, module: &str, line: &str) {
        if let Err(e) = self.buses.logs.append(module, line) {
            warn!(module, error = %e, "Failed to append module log");
        }
    }

    fn record_exit(&self, module: &str, outcome: ExitOutcome) {
        let message = format!("{} exited unexpectedly ({})", module, outcome);
        if let Err(e) = self.buses.activity.error(module, message) {
            warn!(module, error = %e, "Failed to record module exit");
        }
    }

    /// Job counters are enriched and merged in arrival order on one task
    fn spawn_metrics_worker(&self) -> (mpsc::UnboundedSender<(String, u64)>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, u64)>();
        let metrics = self.buses.metrics.clone();
        let rewards = self.collaborators.rewards.clone();
        let address = self.wallet_address.clone();
        let timeout = self.options.reward_timeout;
        let policy = self.options.reward_retry;

        let handle = tokio::spawn(async move {
            while let Some((module, total)) = rx.recv().await {
                let scheduled = lookup_rewards(rewards.as_ref(), &address, timeout, policy).await;
                let partial = PartialMetrics::jobs(total).with_rewards(scheduled);
                if let Err(e) = metrics.submit(&module, partial) {
                    warn!(%module, error = %e, "Failed to record module metrics");
                }
            }
        });
        (tx, handle)
    }
}

/// Best-effort reward lookup; zero when every attempt fails or times out
pub async fn lookup_rewards(rewards: &dyn RewardLookup, address: &str, timeout: Duration, policy: RetryPolicy) -> u128 {
    let result = retry_with_backoff(policy, "reward lookup", move || async move {
        match tokio::time::timeout(timeout, rewards.scheduled_rewards_for(address)).await {
            Ok(result) => result,
            Err(_) => Err(eyre::eyre!("timed out after {:?}", timeout)),
        }
    })
    .await;

    result.unwrap_or_else(|e| {
        warn!(error = %e, "Reward lookup failed, using zero");
        0
    })
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states: BTreeMap<_, _> = self.processes.iter().map(|p| (p.name.as_str(), p.state)).collect();
        f.debug_struct("Supervisor").field("modules", &states).finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::collaborators::{ErrorReporter, SourceResolver, SourceUpdate, TracingTimeSeries};
    use crate::config::{Config, TailConfig};
    use crate::events::{ActivityEvent, ActivityKind, SubscribeOptions, Subscription};
    use crate::log::TailMode;
    use async_trait::async_trait;
    use std::fmt;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::{TempDir, tempdir};

    /// Reports `changed` on the first resolve and on the resolve numbered `change_on`
    struct ScriptedResolver {
        path: PathBuf,
        calls: AtomicU32,
        change_on: Option<u32>,
        fail: bool,
    }

    #[async_trait]
    impl SourceResolver for ScriptedResolver {
        async fn resolve_latest_source(&self, _module: &ModuleConfig) -> eyre::Result<SourceUpdate> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(eyre::eyre!("registry unreachable"));
            }
            Ok(SourceUpdate {
                changed: call == 0 || Some(call) == self.change_on,
                local_path: self.path.clone(),
            })
        }
    }

    struct FixedRewards(Option<u128>);

    #[async_trait]
    impl RewardLookup for FixedRewards {
        async fn scheduled_rewards_for(&self, _address: &str) -> eyre::Result<u128> {
            self.0.ok_or_else(|| eyre::eyre!("rpc down"))
        }
    }

    struct SlowRewards;

    #[async_trait]
    impl RewardLookup for SlowRewards {
        async fn scheduled_rewards_for(&self, _address: &str) -> eyre::Result<u128> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        }
    }

    #[derive(Default)]
    struct RecordingReporter(Mutex<Vec<String>>);

    impl ErrorReporter for RecordingReporter {
        fn report(&self, context: &str, error: &dyn fmt::Display) {
            self.0.lock().unwrap().push(format!("{}: {}", context, error));
        }
    }

    struct Fixture {
        _temp: TempDir,
        supervisor: Supervisor,
        buses: EventBuses,
        reporter: Arc<RecordingReporter>,
        resolver: Arc<ScriptedResolver>,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn fixture(script: &str, change_on: Option<u32>, fail_sync: bool) -> Fixture {
        fixture_with_modules(&[("spark", script)], change_on, fail_sync)
    }

    fn fixture_with_modules(scripts: &[(&str, &str)], change_on: Option<u32>, fail_sync: bool) -> Fixture {
        let temp = tempdir().unwrap();
        let paths = StatePaths::new(temp.path().join("state"), temp.path().join("cache"));
        let source = temp.path().join("source");
        std::fs::create_dir_all(&source).unwrap();

        let resolver = Arc::new(ScriptedResolver {
            path: source,
            calls: AtomicU32::new(0),
            change_on,
            fail: fail_sync,
        });
        let reporter = Arc::new(RecordingReporter::default());
        let collaborators = Collaborators {
            sources: resolver.clone(),
            rewards: Arc::new(FixedRewards(Some(7))),
            errors: reporter.clone(),
            telemetry: Arc::new(TracingTimeSeries),
        };
        let config = Config {
            tail: TailConfig {
                mode: TailMode::Poll,
                poll_interval_ms: 20,
            },
            ..Config::default()
        };
        let buses = EventBuses::open(&paths, &config, &collaborators);

        let modules = scripts
            .iter()
            .map(|(name, script)| ModuleConfig {
                name: name.to_string(),
                executable: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                source: String::new(),
                env: BTreeMap::new(),
            })
            .collect();
        let supervisor = Supervisor::new(SupervisorContext {
            modules,
            paths,
            identity: Keypair::generate(),
            wallet_address: "f1abcdefghijklmnop".to_string(),
            buses: buses.clone(),
            collaborators,
            options: SupervisorOptions {
                update_interval: Duration::from_millis(100),
                kill_grace: Duration::from_secs(2),
                report_window: Duration::from_secs(4 * 60 * 60),
                reward_timeout: Duration::from_millis(100),
                sync_retry: fast_retry(),
                reward_retry: fast_retry(),
            },
        });

        Fixture {
            _temp: temp,
            supervisor,
            buses,
            reporter,
            resolver,
        }
    }

    async fn next_event(sub: &mut Subscription<ActivityEvent>) -> ActivityEvent {
        tokio::time::timeout(Duration::from_secs(10), sub.next())
            .await
            .expect("timed out waiting for activity")
            .expect("subscription ended")
    }

    #[tokio::test]
    async fn test_events_are_routed_until_shutdown() {
        let script = r#"echo '{"type":"started"}'
echo '{"type":"info","message":"hello"}'
echo 'plain output'
echo '{"type":"jobs-completed","total":3}'
exec sleep 30"#;
        let Fixture {
            _temp,
            mut supervisor,
            buses,
            ..
        } = fixture(script, None, false);
        let mut activity = buses.activity.subscribe(SubscribeOptions::from_last_n(0));
        let mut metrics = buses.metrics.subscribe(SubscribeOptions::from_last_n(0));

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let result = supervisor.run(cancel).await;
                (result, supervisor)
            }
        });

        let started = next_event(&mut activity).await;
        assert_eq!(started.source, "spark");
        assert_eq!(started.message, "spark started");
        let info = next_event(&mut activity).await;
        assert_eq!(info.message, "hello");
        assert_eq!(info.kind, ActivityKind::Info);

        let update = tokio::time::timeout(Duration::from_secs(10), metrics.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.total_jobs_completed, 3);
        assert_eq!(update.rewards_scheduled, 7);

        cancel.cancel();
        let (result, supervisor) = run.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(supervisor.module_states(), vec![("spark".to_string(), ModuleState::ExitedOk)]);
        assert!(buses.logs.get("spark").unwrap().contains("plain output"));
    }

    #[tokio::test]
    async fn test_module_exit_is_fatal_and_reported() {
        let Fixture {
            _temp,
            mut supervisor,
            buses,
            reporter,
            ..
        } = fixture("exit 1", None, false);

        let result = supervisor.run(CancellationToken::new()).await;
        match result {
            Err(SupervisorError::ModuleExited { module, outcome }) => {
                assert_eq!(module, "spark");
                assert_eq!(outcome, ExitOutcome::Code(1));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(supervisor.module_states(), vec![("spark".to_string(), ModuleState::ExitedError)]);

        let events = buses.activity.snapshot().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.kind, ActivityKind::Error);
        assert!(last.message.contains("exit code 1"));
        assert_eq!(reporter.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clean_exit_is_still_fatal() {
        let Fixture { _temp, mut supervisor, .. } = fixture("exit 0", None, false);
        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(SupervisorError::ModuleExited {
                outcome: ExitOutcome::Code(0),
                ..
            })
        ));
        assert_eq!(supervisor.module_states(), vec![("spark".to_string(), ModuleState::ExitedOk)]);
    }

    fn process_alive(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    #[tokio::test]
    async fn test_source_change_restarts_modules() {
        // `exec` keeps the reported pid for the lifetime of the module
        let script = r#"echo "{\"type\":\"started\",\"message\":\"$$\"}"
exec sleep 30"#;
        // Calls 0 and 1 are the initial sync; call 2 is spark on the first update tick
        let Fixture {
            _temp,
            mut supervisor,
            buses,
            resolver,
            ..
        } = fixture_with_modules(&[("spark", script), ("voyager", script)], Some(2), false);
        let mut activity = buses.activity.subscribe(SubscribeOptions::from_last_n(0));

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        let mut pids = Vec::new();
        for _ in 0..4 {
            let event = next_event(&mut activity).await;
            assert_eq!(event.kind, ActivityKind::Info, "unexpected activity: {:?}", event);
            pids.push(event.message.parse::<i32>().expect("started message carries the pid"));
        }
        let (first_run, second_run) = pids.split_at(2);

        // Every module of the first run was stopped before the restart
        for pid in first_run {
            assert!(!process_alive(*pid), "pid {} survived the restart", pid);
        }
        for pid in second_run {
            assert!(!first_run.contains(pid));
            assert!(process_alive(*pid));
        }
        assert!(resolver.calls.load(Ordering::SeqCst) >= 3);

        let errors: Vec<_> = buses
            .activity
            .snapshot()
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == ActivityKind::Error)
            .collect();
        assert!(errors.is_empty(), "restart recorded errors: {:?}", errors);

        cancel.cancel();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_initial_sync_failure_is_fatal() {
        let Fixture {
            _temp,
            mut supervisor,
            resolver,
            ..
        } = fixture("exec sleep 30", None, true);

        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(SupervisorError::SourceSync { .. })));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let Fixture { _temp, mut supervisor, .. } = fixture("exec sleep 30", None, false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(supervisor.run(cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_lookup_rewards_falls_back_to_zero() {
        let policy = fast_retry();
        let timeout = Duration::from_millis(50);
        assert_eq!(lookup_rewards(&FixedRewards(Some(5)), "f1x", timeout, policy).await, 5);
        assert_eq!(lookup_rewards(&FixedRewards(None), "f1x", timeout, policy).await, 0);
        assert_eq!(lookup_rewards(&SlowRewards, "f1x", timeout, policy).await, 0);
    }
}
