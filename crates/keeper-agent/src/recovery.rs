//! Re-adopting processes that outlived a previous supervisor run.

use keeper_process::{AppId, SupervisorEvent};

use crate::{
    handle::ProcessHandle,
    health::unix_ms_now,
    log_tailer::LogTailer,
    manager::{Attach, ProcessManager},
    os,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    /// Apps found alive and taken back under supervision.
    pub adopted: Vec<AppId>,
    /// Apps whose recorded pid was dead; their pid and port were cleared.
    pub cleared: Vec<AppId>,
}

impl ProcessManager {
    /// Reconciles persisted records against the live process table.
    ///
    /// Run once before accepting commands. Apps already in the registry are
    /// left alone, so running it twice changes nothing.
    pub async fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        for record in self.shared.store.list().await {
            let Some(pid) = record.pid else {
                continue;
            };
            let app_id = record.app_id.clone();

            let mut reg = self.inner.lock().await;
            if reg.entries.contains_key(&app_id) {
                continue;
            }

            if !os::probe_alive(pid).await {
                drop(reg);
                self.shared.store.clear_runtime(&app_id).await;
                tracing::info!(%app_id, pid, "recorded process is gone; cleared runtime state");
                report.cleared.push(app_id);
                continue;
            }

            let log_path = self.shared.config.log_path(&app_id);
            let history_end = tokio::fs::metadata(&log_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            // A file shorter than the recorded offset was rotated; all of it
            // belongs to the current run.
            let run_start = record
                .log_offset
                .filter(|offset| *offset <= history_end)
                .unwrap_or(0);
            let tailer = LogTailer::new(&log_path, 0)
                .replaying_until(history_end)
                .with_checkpoint(run_start);

            let generation = reg.next_generation();
            let entry = self.attach(
                generation,
                Attach {
                    app_id: app_id.clone(),
                    handle: ProcessHandle::adopted(pid),
                    install_path: record.install_path.clone(),
                    log_path,
                    started_at_unix_ms: record.started_at_unix_ms.unwrap_or_else(unix_ms_now),
                    port: record.port,
                    tailer,
                },
            );
            reg.entries.insert(app_id.clone(), entry);

            tracing::info!(%app_id, pid, port = ?record.port, "re-adopted running app");
            self.emit(SupervisorEvent::Restored {
                app_id: app_id.clone(),
                pid,
                port: record.port,
            });
            report.adopted.push(app_id);
        }

        report
    }
}
