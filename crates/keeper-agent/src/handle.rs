use std::sync::Arc;

use keeper_process::{HandleOrigin, StopReason};
use tokio::{process::Child, sync::watch, task::JoinHandle};

use crate::os::{self, ProcessSignaller, Signal};

/// A supervised process, either spawned by us or adopted after a restart.
///
/// Termination is reported through a watch channel. The first report wins;
/// later ones (a health probe racing the exit waiter, say) are ignored.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    origin: HandleOrigin,
    exit_tx: Arc<watch::Sender<Option<StopReason>>>,
    waiter: Option<JoinHandle<()>>,
}

/// Cloneable half used by background tasks to report termination.
#[derive(Debug, Clone)]
pub struct TerminationReporter {
    exit_tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl TerminationReporter {
    /// Returns `true` if this was the first report.
    pub fn report(&self, reason: StopReason) -> bool {
        self.exit_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        })
    }
}

impl ProcessHandle {
    /// Wraps a freshly spawned child. Fails (handing the child back) when the
    /// OS did not give us a pid.
    pub fn spawned(mut child: Child) -> Result<Self, Child> {
        let Some(pid) = child.id() else {
            return Err(child);
        };
        let (tx, _rx) = watch::channel(None);
        let exit_tx = Arc::new(tx);
        let reporter = TerminationReporter {
            exit_tx: exit_tx.clone(),
        };
        let waiter = tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => match status.code() {
                    Some(code) => StopReason::Exited { code: Some(code) },
                    None => StopReason::Signalled,
                },
                Err(e) => {
                    tracing::warn!(pid, error = %e, "wait on child failed");
                    StopReason::Vanished
                }
            };
            reporter.report(reason);
        });
        Ok(Self {
            pid,
            origin: HandleOrigin::Spawned,
            exit_tx,
            waiter: Some(waiter),
        })
    }

    /// A process we did not start and cannot wait on; its exit is only ever
    /// noticed by liveness probes.
    pub fn adopted(pid: u32) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            pid,
            origin: HandleOrigin::Adopted,
            exit_tx: Arc::new(tx),
            waiter: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn origin(&self) -> HandleOrigin {
        self.origin
    }

    pub async fn request_termination(
        &self,
        signaller: Arc<dyn ProcessSignaller>,
        signal: Signal,
    ) -> std::io::Result<()> {
        os::deliver(signaller, self.pid, signal).await
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StopReason>> {
        self.exit_tx.subscribe()
    }

    pub fn reporter(&self) -> TerminationReporter {
        TerminationReporter {
            exit_tx: self.exit_tx.clone(),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // The child itself keeps running; only our waiter goes away.
        if let Some(w) = self.waiter.take() {
            w.abort();
        }
    }
}
