pub mod console;
pub mod error;
pub mod process;
pub mod state_machine;

pub use console::{ConsoleBuffer, ConsoleLine, LineSource};
pub use error::SupervisorError;
pub use process::{ProcessError, ProcessHandle};
pub use state_machine::{ExitKind, State};

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupManager, BackupScheduler};
use crate::host::HostCapabilities;
use crate::instance::{self, NewServer, ServerInstance};
use crate::plugin::{PluginInfo, PluginManager};
use crate::protocol::{StatusProbe, StatusSnapshot};
use crate::resource::{ResourceHistory, ResourceSample, ResourceSampler, ResourceUsage};
use process::ProcessOutput;
use state_machine::StateMachine;

/// Result of `stop()`. Stopping never fails hard; this says how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing was running
    NotRunning,
    /// Exited on its own after the `stop` command
    Graceful,
    /// Exited after a terminate signal
    Terminated,
    /// Ignored terminate too; killed and released without waiting
    Killed,
}

impl StopOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Killed)
    }
}

/// Timing knobs for stop/restart.
#[derive(Debug, Clone)]
pub struct StopPolicy {
    /// Number of `poll_interval` waits after sending `stop`
    pub graceful_polls: u32,
    pub poll_interval: Duration,
    /// Wait after the terminate signal
    pub kill_timeout: Duration,
    /// Pause between stop and start in `restart()`
    pub restart_pause: Duration,
    pub probe_timeout: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            graceful_polls: 30,
            poll_interval: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(10),
            restart_pause: Duration::from_secs(2),
            probe_timeout: crate::protocol::slp::DEFAULT_TIMEOUT,
        }
    }
}

// ─── Shared lifecycle state ──────────────────────────────────

struct Lifecycle {
    machine: StateMachine,
    /// Some iff running
    process: Option<Arc<ProcessHandle>>,
    started_at: Option<Instant>,
    /// Bumped on every spawn so a stale drain task cannot release a newer process
    generation: u64,
    cancel: Option<CancellationToken>,
}

/// State reachable from the background tasks.
struct Shared {
    name: String,
    lifecycle: Mutex<Lifecycle>,
    console: Arc<ConsoleBuffer>,
    usage: ResourceUsage,
    running: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Leave Running/Stopping for `generation`. Returns how it ended, or `None`
    /// when that process was already released.
    fn release(&self, generation: u64) -> Option<ExitKind> {
        let mut lc = self.lock();
        if lc.generation != generation || lc.process.is_none() {
            return None;
        }
        if let Some(token) = lc.cancel.take() {
            token.cancel();
        }
        self.usage.reset();
        if let Err(e) = lc.machine.transition(State::Stopped) {
            tracing::warn!("[{}] {}", self.name, e);
        }
        lc.process = None;
        lc.started_at = None;
        self.running.send_replace(false);
        lc.machine.last_exit
    }
}

/// Console drain: one per process lifetime. Exit of the java pid while still
/// Running is the crash signal, whether or not its output pipes have closed.
async fn drain_output(shared: Arc<Shared>, output: ProcessOutput, generation: u64) {
    let console = shared.console.clone();
    let status = output
        .pump_until_exit(move |source, line| {
            console.append(source, line);
        })
        .await;

    let released = shared.release(generation);
    let code = match &status {
        Ok(s) => s.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
        Err(e) => format!("unknown ({})", e),
    };

    match released {
        Some(ExitKind::Crashed) => {
            tracing::warn!("[{}] Server process exited unexpectedly (exit {})", shared.name, code);
            shared
                .console
                .system(format!("Server process exited unexpectedly (exit {})", code));
        }
        _ => {
            tracing::info!("[{}] Server process exited (exit {})", shared.name, code);
            shared.console.system(format!("Server stopped (exit {})", code));
        }
    }
}

// ─── ServerSupervisor ────────────────────────────────────────

/// Owns one instance's process lifecycle and wires console, sampler and probe.
pub struct ServerSupervisor {
    instance: ServerInstance,
    host: HostCapabilities,
    policy: StopPolicy,
    shared: Arc<Shared>,
    status: RwLock<Arc<StatusSnapshot>>,
    /// Serializes start/stop/restart
    control: tokio::sync::Mutex<()>,
    backups: BackupManager,
}

impl ServerSupervisor {
    pub fn new(instance: ServerInstance, host: HostCapabilities) -> Self {
        Self::with_policy(instance, host, StopPolicy::default())
    }

    pub fn with_policy(instance: ServerInstance, host: HostCapabilities, policy: StopPolicy) -> Self {
        let (running, running_rx) = watch::channel(false);
        let backups = BackupManager::new(instance.clone(), running_rx);
        Self {
            shared: Arc::new(Shared {
                name: instance.name().to_string(),
                lifecycle: Mutex::new(Lifecycle {
                    machine: StateMachine::new(),
                    process: None,
                    started_at: None,
                    generation: 0,
                    cancel: None,
                }),
                console: Arc::new(ConsoleBuffer::new()),
                usage: ResourceUsage::new(),
                running,
            }),
            instance,
            host,
            policy,
            status: RwLock::new(Arc::new(StatusSnapshot::default())),
            control: tokio::sync::Mutex::new(()),
            backups,
        }
    }

    pub fn name(&self) -> &str {
        self.instance.name()
    }

    pub fn instance(&self) -> &ServerInstance {
        &self.instance
    }

    pub fn host(&self) -> &HostCapabilities {
        &self.host
    }

    pub fn console(&self) -> &Arc<ConsoleBuffer> {
        &self.shared.console
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Launch the server. No-op when already running.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _control = self.control.lock().await;
        self.start_locked()
    }

    fn start_locked(&self) -> Result<(), SupervisorError> {
        {
            let mut lc = self.shared.lock();
            if lc.process.is_some() {
                return Ok(());
            }
            lc.machine
                .transition(State::Starting)
                .map_err(|e| SupervisorError::Internal(e.into()))?;
        }

        if let Err(e) = self.launch() {
            let mut lc = self.shared.lock();
            if let Err(te) = lc.machine.transition(State::Stopped) {
                tracing::warn!("[{}] {}", self.name(), te);
            }
            drop(lc);
            tracing::error!("[{}] Start failed: {}", self.name(), e);
            self.shared.console.system(format!("Failed to start: {}", e));
            return Err(e);
        }
        Ok(())
    }

    fn launch(&self) -> Result<(), SupervisorError> {
        let base_dir = self.instance.base_dir();
        let jar = self
            .instance
            .find_jar()
            .ok_or_else(|| SupervisorError::NoJarFound(base_dir.display().to_string()))?;
        self.instance.ensure_eula()?;

        let config = self.instance.load_config();
        let memory = config.memory_mb();
        let java = self.host.java_for(config.java_path.as_deref());
        let args = self.host.launch_args(memory, &jar);
        tracing::info!("[{}] Starting server with {} MB ({})", self.name(), memory, jar.display());

        let (handle, output) =
            ProcessHandle::spawn(&java, &args, base_dir).map_err(|e| SupervisorError::SpawnError {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;
        let pid = handle.pid();
        let token = CancellationToken::new();

        let generation = {
            let mut lc = self.shared.lock();
            lc.generation += 1;
            lc.process = Some(Arc::new(handle));
            lc.started_at = Some(Instant::now());
            lc.cancel = Some(token.clone());
            if let Err(e) = lc.machine.transition(State::Running) {
                tracing::warn!("[{}] {}", self.name(), e);
            }
            self.shared.running.send_replace(true);
            lc.generation
        };

        self.shared
            .console
            .system(format!("Server started with {} MB (pid {})", memory, pid));
        tokio::spawn(drain_output(self.shared.clone(), output, generation));
        ResourceSampler::new(pid, self.shared.usage.clone()).spawn(token);
        Ok(())
    }

    /// Graceful stop with bounded escalation. Local state is always Stopped afterwards.
    pub async fn stop(&self) -> StopOutcome {
        let _control = self.control.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> StopOutcome {
        let (handle, generation) = {
            let mut lc = self.shared.lock();
            let Some(handle) = lc.process.clone() else {
                return StopOutcome::NotRunning;
            };
            if let Err(e) = lc.machine.transition(State::Stopping) {
                tracing::warn!("[{}] {}", self.name(), e);
            }
            (handle, lc.generation)
        };

        tracing::info!("[{}] Stopping server", self.name());
        self.shared.console.system("Stopping server...");
        if let Err(e) = handle.send_line("stop").await {
            tracing::warn!("[{}] Could not send stop command: {}", self.name(), e);
        }

        let mut outcome = None;
        for _ in 0..self.policy.graceful_polls {
            if handle.wait_exit(self.policy.poll_interval).await {
                outcome = Some(StopOutcome::Graceful);
                break;
            }
        }

        let outcome = match outcome {
            Some(o) => o,
            None => {
                tracing::warn!(
                    "[{}] Still running after {} polls, terminating pid {}",
                    self.name(),
                    self.policy.graceful_polls,
                    handle.pid()
                );
                if let Err(e) = handle.terminate() {
                    tracing::warn!("[{}] {}", self.name(), e);
                }
                if handle.wait_exit(self.policy.kill_timeout).await {
                    StopOutcome::Terminated
                } else {
                    // 마지막 수단: 강제 종료 후 기다리지 않고 상태만 정리
                    if let Err(e) = handle.kill() {
                        tracing::warn!("[{}] {}", self.name(), e);
                    }
                    StopOutcome::Killed
                }
            }
        };

        self.shared.release(generation);
        tracing::info!("[{}] Stop finished: {:?}", self.name(), outcome);
        outcome
    }

    /// Stop, pause, start. Returns false when either half failed.
    pub async fn restart(&self) -> bool {
        let _control = self.control.lock().await;
        let outcome = self.stop_locked().await;
        if !outcome.is_success() {
            tracing::warn!("[{}] Restart aborted: stop ended with {:?}", self.name(), outcome);
            return false;
        }
        tokio::time::sleep(self.policy.restart_pause).await;
        self.start_locked().is_ok()
    }

    /// Write `text` to the server console. False when not running or the pipe broke.
    pub async fn send_command(&self, text: &str) -> bool {
        let Some(handle) = self.shared.lock().process.clone() else {
            return false;
        };
        match handle.send_line(text).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[{}] Failed to send command: {}", self.name(), e);
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().process.is_some()
    }

    pub fn state(&self) -> State {
        self.shared.lock().machine.state
    }

    pub fn last_exit(&self) -> Option<ExitKind> {
        self.shared.lock().machine.last_exit
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().process.as_ref().map(|p| p.pid())
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.shared
            .lock()
            .started_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Follow the running flag (used by backups and the CLI).
    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.shared.running.subscribe()
    }

    // ─── Resources ───────────────────────────────────────────

    pub fn resources(&self) -> ResourceSample {
        self.shared.usage.current()
    }

    pub fn resource_history(&self) -> ResourceHistory {
        self.shared.usage.history()
    }

    /// Configured heap size, which may differ from the running JVM's until restart.
    pub fn max_ram_mb(&self) -> u64 {
        self.instance.max_ram_mb()
    }

    // ─── Status probe ────────────────────────────────────────

    pub fn cached_status(&self) -> Arc<StatusSnapshot> {
        self.status.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Probe the game port while running; on failure (or when stopped) the
    /// last good snapshot is returned.
    pub async fn refresh_status(&self) -> Arc<StatusSnapshot> {
        if !self.is_running() {
            return self.cached_status();
        }
        let probe = StatusProbe::new(self.instance.ip(), self.instance.port()).with_timeout(self.policy.probe_timeout);
        match probe.query_async().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.status.write().unwrap_or_else(|p| p.into_inner()) = snapshot.clone();
                snapshot
            }
            Err(e) => {
                tracing::debug!("[{}] Status probe failed: {}", self.name(), e);
                self.cached_status()
            }
        }
    }

    pub async fn get_players(&self) -> Vec<String> {
        if !self.is_running() {
            return Vec::new();
        }
        self.refresh_status().await.players.clone()
    }

    /// Live value while running, `max-players` from server.properties otherwise.
    pub async fn get_max_players(&self) -> u32 {
        if self.is_running() {
            return self.refresh_status().await.max_players;
        }
        self.instance.max_players_from_properties()
    }

    pub async fn get_version(&self) -> String {
        self.refresh_status().await.version.clone()
    }

    // ─── Plugins ─────────────────────────────────────────────

    fn plugin_manager(&self) -> PluginManager {
        PluginManager::new(self.instance.plugins_dir())
    }

    pub fn list_plugins(&self) -> Result<Vec<PluginInfo>, SupervisorError> {
        let console = if self.is_running() {
            self.shared.console.contents()
        } else {
            Vec::new()
        };
        self.plugin_manager().list(&console)
    }

    pub fn install_plugin(&self, jar: &Path) -> Result<PluginInfo, SupervisorError> {
        self.plugin_manager().install(jar)
    }

    pub fn delete_plugin(&self, name: &str) -> Result<(), SupervisorError> {
        self.plugin_manager().delete(name)
    }

    /// Ask a running server to reload its plugins.
    pub async fn reload_plugins(&self) -> bool {
        self.send_command("reload confirm").await
    }
}

// ─── Registry ────────────────────────────────────────────────

/// All supervisors of one servers directory, created lazily by name.
pub struct SupervisorRegistry {
    servers_dir: PathBuf,
    host: HostCapabilities,
    policy: StopPolicy,
    supervisors: tokio::sync::RwLock<HashMap<String, Arc<ServerSupervisor>>>,
}

impl SupervisorRegistry {
    pub fn new(servers_dir: impl Into<PathBuf>, host: HostCapabilities) -> Self {
        Self::with_policy(servers_dir, host, StopPolicy::default())
    }

    pub fn with_policy(servers_dir: impl Into<PathBuf>, host: HostCapabilities, policy: StopPolicy) -> Self {
        Self {
            servers_dir: servers_dir.into(),
            host,
            policy,
            supervisors: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn servers_dir(&self) -> &Path {
        &self.servers_dir
    }

    pub fn host(&self) -> &HostCapabilities {
        &self.host
    }

    pub fn list(&self) -> Result<Vec<String>, SupervisorError> {
        instance::list_instances(&self.servers_dir).map_err(|e| SupervisorError::Internal(e.into()))
    }

    /// Supervisor for `name`, opening the instance directory on first use.
    pub async fn get(&self, name: &str) -> Result<Arc<ServerSupervisor>, SupervisorError> {
        if let Some(sup) = self.supervisors.read().await.get(name) {
            return Ok(sup.clone());
        }
        let mut map = self.supervisors.write().await;
        if let Some(sup) = map.get(name) {
            return Ok(sup.clone());
        }
        let instance = ServerInstance::open(&self.servers_dir, name)?;
        let sup = Arc::new(ServerSupervisor::with_policy(instance, self.host.clone(), self.policy.clone()));
        map.insert(name.to_string(), sup.clone());
        Ok(sup)
    }

    /// Start path used by the control surfaces: refuses when the game port is taken.
    pub async fn start(&self, name: &str) -> Result<Arc<ServerSupervisor>, SupervisorError> {
        let sup = self.get(name).await?;
        if !sup.is_running() {
            let port = sup.instance().port();
            if instance::port_in_use(port) {
                return Err(SupervisorError::PortInUse(port));
            }
        }
        sup.start().await?;
        Ok(sup)
    }

    pub async fn create(&self, new: &NewServer) -> Result<Arc<ServerSupervisor>, SupervisorError> {
        let created = instance::create_instance(&self.servers_dir, new)?;
        self.get(created.name()).await
    }

    pub async fn import(&self, source: &Path, name: &str) -> Result<Arc<ServerSupervisor>, SupervisorError> {
        let imported = instance::import_instance(&self.servers_dir, source, name)?;
        self.get(imported.name()).await
    }

    pub async fn running(&self) -> Vec<Arc<ServerSupervisor>> {
        self.supervisors
            .read()
            .await
            .values()
            .filter(|s| s.is_running())
            .cloned()
            .collect()
    }

    /// Spawn a backup scheduler for every known instance.
    pub async fn start_schedulers(&self, token: CancellationToken) -> Result<usize, SupervisorError> {
        let names = self.list()?;
        let mut started = 0;
        for name in names {
            match self.get(&name).await {
                Ok(sup) => {
                    BackupScheduler::new(sup.backups().clone()).spawn(token.child_token());
                    started += 1;
                }
                Err(e) => tracing::warn!("Skipping backup schedule for '{}': {}", name, e),
            }
        }
        Ok(started)
    }

    /// Stop every running server concurrently.
    pub async fn stop_all(&self) -> Vec<(String, StopOutcome)> {
        let mut set = tokio::task::JoinSet::new();
        for sup in self.running().await {
            set.spawn(async move {
                let outcome = sup.stop().await;
                (sup.name().to_string(), outcome)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("Stop task failed: {}", e),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (tempfile::TempDir, ServerSupervisor) {
        let dir = tempfile::tempdir().unwrap();
        let inst = ServerInstance::new("unit", dir.path());
        (dir, ServerSupervisor::new(inst, HostCapabilities::new(false, "java")))
    }

    #[test]
    fn test_stop_outcome_success() {
        assert!(StopOutcome::NotRunning.is_success());
        assert!(StopOutcome::Graceful.is_success());
        assert!(StopOutcome::Terminated.is_success());
        assert!(!StopOutcome::Killed.is_success());
    }

    #[tokio::test]
    async fn test_fresh_supervisor_is_stopped() {
        let (_dir, sup) = supervisor();
        assert!(!sup.is_running());
        assert_eq!(sup.state(), State::Stopped);
        assert_eq!(sup.pid(), None);
        assert_eq!(sup.uptime_seconds(), 0);
        assert_eq!(sup.resources(), ResourceSample::default());
        assert!(!sup.send_command("say hi").await);
        assert_eq!(sup.stop().await, StopOutcome::NotRunning);
        assert!(sup.get_players().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_without_jar() {
        let (dir, sup) = supervisor();
        std::fs::write(dir.path().join("server.properties"), "server-port=25566\nmax-players=7\n").unwrap();

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NoJarFound(_)));
        assert!(!sup.is_running());
        assert_eq!(sup.state(), State::Stopped);
        assert_eq!(sup.instance().port(), 25566);
        assert_eq!(sup.get_max_players().await, 7);
        // no eula written when the start failed before it
        assert!(!dir.path().join("eula.txt").exists());
    }

    #[tokio::test]
    async fn test_spawn_error_leaves_stopped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.jar"), b"").unwrap();
        let inst = ServerInstance::new("unit", dir.path());
        let sup = ServerSupervisor::new(inst, HostCapabilities::new(false, "/definitely/not/java"));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnError { .. }));
        assert!(!sup.is_running());
        assert_eq!(sup.state(), State::Stopped);
        assert!(dir.path().join("eula.txt").exists());
        // the retry goes through the same path
        assert!(sup.start().await.is_err());
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("alpha")).unwrap();
        let registry = SupervisorRegistry::new(dir.path(), HostCapabilities::new(false, "java"));

        assert_eq!(registry.list().unwrap(), vec!["alpha"]);
        let a = registry.get("alpha").await.unwrap();
        let b = registry.get("alpha").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            registry.get("missing").await,
            Err(SupervisorError::InstanceNotFound(_))
        ));
        assert!(matches!(
            registry.get("../alpha").await,
            Err(SupervisorError::InvalidName(_))
        ));
        assert!(registry.running().await.is_empty());
        assert!(registry.stop_all().await.is_empty());
    }
}
