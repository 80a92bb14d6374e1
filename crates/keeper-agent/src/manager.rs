use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    process::Stdio,
    sync::Arc,
};

use keeper_process::{
    AppId, AppStatus, HandleOrigin, HealthSnapshot, HealthStatus, StopReason, SupervisorEvent,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    command,
    config::SupervisorConfig,
    error::{LaunchError, StopError, format_error_chain},
    handle::ProcessHandle,
    health::{HealthSampler, unix_ms_now},
    log_sink::LogSink,
    log_tailer::{self, LogChunk, LogTailer},
    os::{self, OsSignaller, ProcessSignaller, Signal},
    port_sniffer,
    state::StateStore,
};

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct LaunchRequest {
    pub install_path: PathBuf,
    pub command: String,
    /// `command` is already an argument list for the runner itself.
    #[serde(default)]
    pub targets_runner: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Background tasks owned by one registry entry. Dropping the entry stops them.
#[derive(Debug, Default)]
pub(crate) struct EntryTimers {
    log_poll: Option<JoinHandle<()>>,
    health_poll: Option<JoinHandle<()>>,
    exit_watch: Option<JoinHandle<()>>,
    kill_fallback: Option<JoinHandle<()>>,
}

impl EntryTimers {
    /// Everything except the exit watcher, which may be the caller.
    fn cancel_pollers(&mut self) {
        for t in [
            self.log_poll.take(),
            self.health_poll.take(),
            self.kill_fallback.take(),
        ]
        .into_iter()
        .flatten()
        {
            t.abort();
        }
    }
}

impl Drop for EntryTimers {
    fn drop(&mut self) {
        self.cancel_pollers();
        if let Some(t) = self.exit_watch.take() {
            t.abort();
        }
    }
}

#[derive(Debug)]
pub(crate) struct RegistryEntry {
    /// Distinguishes this run from a later one under the same app id, so
    /// stale timers never act on a relaunched process.
    pub(crate) generation: u64,
    pub(crate) handle: ProcessHandle,
    install_path: PathBuf,
    log_path: PathBuf,
    started_at_unix_ms: u64,
    port: Option<u16>,
    last_health: Option<HealthSnapshot>,
    sampler: Arc<Mutex<HealthSampler>>,
    tailer: Arc<Mutex<LogTailer>>,
    timers: EntryTimers,
}

impl RegistryEntry {
    fn stopping(&self) -> bool {
        self.timers.kill_fallback.is_some()
    }

    fn status(&self, app_id: &AppId) -> AppStatus {
        AppStatus {
            app_id: app_id.clone(),
            pid: self.handle.pid(),
            port: self.port,
            install_path: self.install_path.display().to_string(),
            origin: self.handle.origin(),
            started_at_unix_ms: self.started_at_unix_ms,
            stopping: self.stopping(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) entries: HashMap<AppId, RegistryEntry>,
    next_generation: u64,
}

impl Registry {
    pub(crate) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: SupervisorConfig,
    pub(crate) store: StateStore,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    signaller: Arc<dyn ProcessSignaller>,
}

/// Owns every supervised process.
///
/// All registry mutations happen under one async mutex, which is what makes
/// "at most one entry per app" and "exactly one stop per entry" hold.
#[derive(Clone, Debug)]
pub struct ProcessManager {
    pub(crate) inner: Arc<Mutex<Registry>>,
    pub(crate) shared: Arc<Shared>,
}

/// Everything needed to put a process under supervision.
pub(crate) struct Attach {
    pub(crate) app_id: AppId,
    pub(crate) handle: ProcessHandle,
    pub(crate) install_path: PathBuf,
    pub(crate) log_path: PathBuf,
    pub(crate) started_at_unix_ms: u64,
    pub(crate) port: Option<u16>,
    pub(crate) tailer: LogTailer,
}

impl ProcessManager {
    pub fn new(
        config: SupervisorConfig,
        store: StateStore,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        Self::with_signaller(config, store, Arc::new(OsSignaller))
    }

    pub fn with_signaller(
        config: SupervisorConfig,
        store: StateStore,
        signaller: Arc<dyn ProcessSignaller>,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            shared: Arc::new(Shared {
                config,
                store,
                events,
                signaller,
            }),
        };
        (manager, rx)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &StateStore {
        &self.shared.store
    }

    pub(crate) fn emit(&self, event: SupervisorEvent) {
        // Nobody listening is fine.
        let _ = self.shared.events.send(event);
    }

    /// Starts `req.command` for `app_id` and returns its pid.
    ///
    /// On any error the registry is left without an entry for the app.
    pub async fn launch(&self, app_id: &AppId, req: LaunchRequest) -> Result<u32, LaunchError> {
        let mut reg = self.inner.lock().await;
        if reg.entries.contains_key(app_id) {
            return Err(LaunchError::AlreadyRunning(app_id.clone()));
        }
        let resolved =
            command::resolve(&req.command, req.targets_runner, &self.shared.config.runner)?;

        let log_path = self.shared.config.log_path(app_id);
        let sink = LogSink::open(&log_path).map_err(|source| LaunchError::LogSink {
            app_id: app_id.clone(),
            source,
        })?;
        let (stdout, stderr) = sink.stdio().map_err(|source| LaunchError::LogSink {
            app_id: app_id.clone(),
            source,
        })?;

        let mut cmd = tokio::process::Command::new(&resolved.program);
        cmd.args(&resolved.args)
            .current_dir(&req.install_path)
            .envs(&req.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        os::detach(&mut cmd);

        let child = cmd.spawn().map_err(|source| LaunchError::SpawnFailed {
            app_id: app_id.clone(),
            program: resolved.program.clone(),
            source,
        })?;
        let handle = match ProcessHandle::spawned(child) {
            Ok(h) => h,
            Err(mut child) => {
                let _ = child.start_kill();
                return Err(LaunchError::NoPid(app_id.clone()));
            }
        };
        let pid = handle.pid();
        let started_at_unix_ms = unix_ms_now();

        self.shared
            .store
            .record_started(
                app_id,
                pid,
                &req.install_path,
                sink.start_offset(),
                started_at_unix_ms,
            )
            .await;

        let generation = reg.next_generation();
        let entry = self.attach(
            generation,
            Attach {
                app_id: app_id.clone(),
                handle,
                install_path: req.install_path,
                log_path,
                started_at_unix_ms,
                port: None,
                tailer: LogTailer::new(sink.path(), sink.start_offset()),
            },
        );
        reg.entries.insert(app_id.clone(), entry);

        tracing::info!(%app_id, pid, command = %resolved.display(), "launched app");
        self.emit(SupervisorEvent::Started {
            app_id: app_id.clone(),
            pid,
        });
        Ok(pid)
    }

    /// Builds the registry entry and starts its log, health and exit tasks.
    /// Must be called with the registry lock held; the tasks block on it
    /// until the entry is inserted.
    pub(crate) fn attach(&self, generation: u64, a: Attach) -> RegistryEntry {
        let pid = a.handle.pid();
        let sampler = Arc::new(Mutex::new(HealthSampler::new(
            pid,
            Instant::now(),
            self.shared.config.zombie_grace,
        )));
        let tailer = Arc::new(Mutex::new(a.tailer));

        let timers = EntryTimers {
            log_poll: Some(self.spawn_log_poll(&a.app_id, generation, tailer.clone())),
            health_poll: Some(self.spawn_health_poll(
                &a.app_id,
                generation,
                &a.handle,
                sampler.clone(),
            )),
            exit_watch: Some(self.spawn_exit_watch(&a.app_id, generation, &a.handle)),
            kill_fallback: None,
        };

        RegistryEntry {
            generation,
            handle: a.handle,
            install_path: a.install_path,
            log_path: a.log_path,
            started_at_unix_ms: a.started_at_unix_ms,
            port: a.port,
            last_health: None,
            sampler,
            tailer,
            timers,
        }
    }

    fn spawn_log_poll(
        &self,
        app_id: &AppId,
        generation: u64,
        tailer: Arc<Mutex<LogTailer>>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let app_id = app_id.clone();
        let interval = self.shared.config.log_poll_interval;
        tokio::spawn(async move {
            // Wait out the caller's lock so no line precedes Started/Restored.
            drop(manager.inner.lock().await);
            loop {
                let ports = {
                    let mut tailer = tailer.lock().await;
                    let replayed = tailer.is_replaying();
                    // Output of earlier runs is shown but never sniffed.
                    let sniff = !tailer.before_checkpoint();
                    let lines = match tailer.poll().await {
                        Ok(lines) => lines,
                        Err(e) => {
                            tracing::debug!(
                                %app_id,
                                offset = tailer.offset(),
                                error = %e,
                                "log poll failed"
                            );
                            Vec::new()
                        }
                    };
                    // Emitted while the tailer is held so the final drain on
                    // stop can never overtake these lines.
                    let mut ports = Vec::new();
                    for line in lines {
                        if sniff && let Some(port) = port_sniffer::sniff(&line) {
                            ports.push(port);
                        }
                        manager.emit(SupervisorEvent::Log {
                            app_id: app_id.clone(),
                            line,
                            replayed,
                        });
                    }
                    ports
                };
                for port in ports {
                    if !manager.port_detected(&app_id, generation, port).await {
                        return;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Records a sniffed port. Returns `false` once the entry is gone.
    async fn port_detected(&self, app_id: &AppId, generation: u64, port: u16) -> bool {
        let mut reg = self.inner.lock().await;
        let Some(entry) = reg
            .entries
            .get_mut(app_id)
            .filter(|e| e.generation == generation)
        else {
            return false;
        };
        if entry.port == Some(port) {
            return true;
        }
        entry.port = Some(port);
        self.shared.store.record_port(app_id, port).await;
        tracing::info!(%app_id, port, "detected port");
        self.emit(SupervisorEvent::PortChanged {
            app_id: app_id.clone(),
            port,
        });
        true
    }

    fn spawn_health_poll(
        &self,
        app_id: &AppId,
        generation: u64,
        handle: &ProcessHandle,
        sampler: Arc<Mutex<HealthSampler>>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let app_id = app_id.clone();
        let reporter = handle.reporter();
        let adopted = handle.origin() == HandleOrigin::Adopted;
        let interval = self.shared.config.health_poll_interval;
        tokio::spawn(async move {
            loop {
                let snapshot = sampler.lock().await.sample().await;
                {
                    let mut reg = manager.inner.lock().await;
                    let Some(entry) = reg
                        .entries
                        .get_mut(&app_id)
                        .filter(|e| e.generation == generation)
                    else {
                        return;
                    };
                    entry.last_health = Some(snapshot.clone());
                }
                // Spawned children are reaped natively; only adopted ones
                // need the probe to notice they are gone.
                if adopted && snapshot.status == HealthStatus::Zombie {
                    tracing::info!(%app_id, pid = snapshot.pid, "adopted process vanished");
                    reporter.report(StopReason::Vanished);
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    fn spawn_exit_watch(
        &self,
        app_id: &AppId,
        generation: u64,
        handle: &ProcessHandle,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let app_id = app_id.clone();
        let mut rx = handle.subscribe();
        tokio::spawn(async move {
            let reason = match rx.wait_for(Option::is_some).await {
                Ok(r) => *r,
                Err(_) => return,
            };
            let Some(reason) = reason else {
                return;
            };
            manager.finish(&app_id, generation, reason).await;
        })
    }

    /// The single termination path: removes the entry, flushes its log and
    /// emits exactly one `Stopped`.
    async fn finish(&self, app_id: &AppId, generation: u64, reason: StopReason) {
        let mut reg = self.inner.lock().await;
        if reg.entries.get(app_id).map(|e| e.generation) != Some(generation) {
            return;
        }
        let Some(mut entry) = reg.entries.remove(app_id) else {
            return;
        };
        entry.timers.cancel_pollers();

        {
            let mut tailer = entry.tailer.lock().await;
            let replayed = tailer.is_replaying();
            match tailer.drain().await {
                Ok(lines) => {
                    for line in lines {
                        self.emit(SupervisorEvent::Log {
                            app_id: app_id.clone(),
                            line,
                            replayed,
                        });
                    }
                }
                Err(e) => tracing::warn!(%app_id, error = %e, "final log read failed"),
            }
        }

        self.shared.store.clear_runtime(app_id).await;

        let pid = entry.handle.pid();
        tracing::info!(%app_id, pid, ?reason, "app stopped");
        self.emit(SupervisorEvent::Stopped {
            app_id: app_id.clone(),
            pid,
            reason,
        });
        drop(reg);
        // Last: this also aborts the exit watcher we may be running on.
        drop(entry);
    }

    /// Asks the app to stop and arms the forceful fallback.
    ///
    /// Returns once the request is sent; `Stopped` follows asynchronously.
    /// On error the entry is left exactly as it was.
    pub async fn terminate(&self, app_id: &AppId) -> Result<(), StopError> {
        let mut reg = self.inner.lock().await;
        let Some(entry) = reg.entries.get_mut(app_id) else {
            return Err(StopError::NotRunning(app_id.clone()));
        };
        if entry.stopping() {
            return Err(StopError::AlreadyStopping(app_id.clone()));
        }
        let pid = entry.handle.pid();
        if pid == 0 {
            return Err(StopError::NoPid(app_id.clone()));
        }

        let signaller = self.shared.signaller.clone();
        let delay = if signaller.supports_graceful() {
            entry
                .handle
                .request_termination(signaller.clone(), Signal::Graceful)
                .await
                .map_err(|source| StopError::SignalFailed {
                    app_id: app_id.clone(),
                    pid,
                    source,
                })?;
            self.shared.config.kill_fallback
        } else {
            self.shared.config.flush_window
        };

        let generation = entry.generation;
        let manager = self.clone();
        let target = app_id.clone();
        entry.timers.kill_fallback = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.force_kill(&target, generation).await;
        }));

        tracing::info!(%app_id, pid, fallback_ms = delay.as_millis() as u64, "stop requested");
        Ok(())
    }

    async fn force_kill(&self, app_id: &AppId, generation: u64) {
        let pid = {
            let reg = self.inner.lock().await;
            let Some(entry) = reg
                .entries
                .get(app_id)
                .filter(|e| e.generation == generation)
            else {
                return;
            };
            if entry.handle.has_exited() {
                return;
            }
            entry.handle.pid()
        };
        // Sent without the registry lock.
        tracing::warn!(%app_id, pid, "app did not stop in time; killing");
        if let Err(e) = os::deliver(self.shared.signaller.clone(), pid, Signal::Force).await {
            tracing::warn!(%app_id, pid, error = %format_error_chain(&e), "forceful kill failed");
        }
    }

    /// Latest health of a running app, sampling once if no periodic sample
    /// exists yet.
    pub async fn health(&self, app_id: &AppId) -> Option<HealthSnapshot> {
        let sampler = {
            let reg = self.inner.lock().await;
            let entry = reg.entries.get(app_id)?;
            if let Some(h) = &entry.last_health {
                return Some(h.clone());
            }
            entry.sampler.clone()
        };
        let snapshot = sampler.lock().await.sample().await;
        Some(snapshot)
    }

    pub async fn health_all(&self) -> BTreeMap<AppId, HealthSnapshot> {
        let mut out = BTreeMap::new();
        let mut pending = Vec::new();
        {
            let reg = self.inner.lock().await;
            for (app_id, entry) in &reg.entries {
                match &entry.last_health {
                    Some(h) => {
                        out.insert(app_id.clone(), h.clone());
                    }
                    None => pending.push((app_id.clone(), entry.sampler.clone())),
                }
            }
        }
        for (app_id, sampler) in pending {
            let snapshot = sampler.lock().await.sample().await;
            out.insert(app_id, snapshot);
        }
        out
    }

    pub async fn status(&self, app_id: &AppId) -> Option<AppStatus> {
        let reg = self.inner.lock().await;
        reg.entries.get(app_id).map(|e| e.status(app_id))
    }

    pub async fn list(&self) -> Vec<AppStatus> {
        let reg = self.inner.lock().await;
        let mut out: Vec<AppStatus> = reg.entries.iter().map(|(id, e)| e.status(id)).collect();
        out.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        out
    }

    /// Stops the app if it is running and forgets its persisted record.
    pub async fn remove(&self, app_id: &AppId) -> Result<(), StopError> {
        match self.terminate(app_id).await {
            Ok(()) | Err(StopError::NotRunning(_)) | Err(StopError::AlreadyStopping(_)) => {}
            Err(e) => return Err(e),
        }
        if self.shared.store.remove(app_id).await.is_some() {
            tracing::info!(%app_id, "removed app record");
        }
        Ok(())
    }

    /// Pages through an app's log file; works whether or not it is running.
    pub async fn read_log(
        &self,
        app_id: &AppId,
        cursor: u64,
        limit_bytes: u64,
    ) -> std::io::Result<LogChunk> {
        let path = {
            let reg = self.inner.lock().await;
            reg.entries
                .get(app_id)
                .map(|e| e.log_path.clone())
                .unwrap_or_else(|| self.shared.config.log_path(app_id))
        };
        log_tailer::read_log(&path, cursor, limit_bytes).await
    }

    /// Stops supervising everything without signalling anyone. The children
    /// keep running and are adopted again by the next recovery pass.
    pub async fn detach_all(&self) -> usize {
        let mut reg = self.inner.lock().await;
        let n = reg.entries.len();
        for (app_id, entry) in reg.entries.drain() {
            tracing::debug!(%app_id, pid = entry.handle.pid(), "detaching");
        }
        if n > 0 {
            tracing::info!(count = n, "detached running apps");
        }
        n
    }
}
