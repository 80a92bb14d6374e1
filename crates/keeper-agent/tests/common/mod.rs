#![allow(dead_code)]

use std::{
    io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use keeper_agent::{
    LaunchRequest, ProcessManager, StateStore, SupervisorConfig,
    command::RunnerProfile,
    os::{OsSignaller, ProcessSignaller, Signal},
};
use keeper_process::SupervisorEvent;
use tokio::sync::mpsc::UnboundedReceiver;

/// Short intervals and a runner that simply execs its arguments.
pub fn test_config(root: &Path) -> SupervisorConfig {
    let mut cfg = SupervisorConfig::with_data_root(root);
    cfg.runner = RunnerProfile {
        program: "env".to_string(),
        run_prefix: Vec::new(),
        exec_subcommand: None,
    };
    cfg.log_poll_interval = Duration::from_millis(50);
    cfg.health_poll_interval = Duration::from_millis(100);
    cfg.zombie_grace = Duration::from_millis(200);
    cfg.kill_fallback = Duration::from_millis(500);
    cfg.flush_window = Duration::from_millis(50);
    cfg
}

pub fn request(root: &Path, command: &str) -> LaunchRequest {
    LaunchRequest {
        install_path: root.to_path_buf(),
        command: command.to_string(),
        ..Default::default()
    }
}

/// Counts signals by kind and delivers them for real.
#[derive(Debug)]
pub struct CountingSignaller {
    pub graceful: AtomicUsize,
    pub force: AtomicUsize,
    graceful_supported: bool,
    force_delay: Duration,
}

impl Default for CountingSignaller {
    fn default() -> Self {
        Self {
            graceful: AtomicUsize::new(0),
            force: AtomicUsize::new(0),
            graceful_supported: true,
            force_delay: Duration::ZERO,
        }
    }
}

impl CountingSignaller {
    /// Behaves like a platform with only a forceful kill.
    pub fn without_graceful() -> Self {
        Self {
            graceful_supported: false,
            ..Self::default()
        }
    }

    /// Blocks the calling thread this long before each forceful kill.
    pub fn with_force_delay(mut self, delay: Duration) -> Self {
        self.force_delay = delay;
        self
    }

    pub fn graceful(&self) -> usize {
        self.graceful.load(Ordering::SeqCst)
    }

    pub fn forced(&self) -> usize {
        self.force.load(Ordering::SeqCst)
    }
}

impl ProcessSignaller for CountingSignaller {
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        match signal {
            Signal::Graceful => {
                self.graceful.fetch_add(1, Ordering::SeqCst);
            }
            Signal::Force => {
                self.force.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(self.force_delay);
            }
        }
        OsSignaller.signal(pid, signal)
    }

    fn supports_graceful(&self) -> bool {
        self.graceful_supported
    }
}

pub fn manager(
    root: &Path,
    store: StateStore,
) -> (ProcessManager, UnboundedReceiver<SupervisorEvent>, Arc<CountingSignaller>) {
    let signaller = Arc::new(CountingSignaller::default());
    let (m, rx) = ProcessManager::with_signaller(test_config(root), store, signaller.clone());
    (m, rx, signaller)
}

/// Receives events until one matches, returning everything seen on the way.
pub async fn wait_for(
    rx: &mut UnboundedReceiver<SupervisorEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&SupervisorEvent) -> bool,
) -> Vec<SupervisorEvent> {
    let mut seen = Vec::new();
    let res = tokio::time::timeout(timeout, async {
        while let Some(ev) = rx.recv().await {
            let hit = pred(&ev);
            seen.push(ev);
            if hit {
                return true;
            }
        }
        false
    })
    .await;
    assert!(
        matches!(res, Ok(true)),
        "expected event not received; saw {seen:#?}"
    );
    seen
}

/// Drains whatever is already queued without waiting.
pub fn drain(rx: &mut UnboundedReceiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

pub fn is_stopped(ev: &SupervisorEvent) -> bool {
    matches!(ev, SupervisorEvent::Stopped { .. })
}
