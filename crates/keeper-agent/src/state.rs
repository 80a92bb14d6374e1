use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use keeper_process::AppId;
use tokio::{io::AsyncWriteExt, sync::Mutex};

/// What we last knew about an app's process. Only ever a hypothesis: recovery
/// re-checks the pid against the live process table before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeStateRecord {
    pub app_id: AppId,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub install_path: PathBuf,
    #[serde(default)]
    pub started_at_unix_ms: Option<u64>,
    /// Log file length when this run started; its output begins here.
    #[serde(default)]
    pub log_offset: Option<u64>,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct StateFile {
    #[serde(default)]
    apps: Vec<RuntimeStateRecord>,
}

/// Persisted per-app runtime records.
///
/// Every change is written through to disk. Write failures are logged and
/// otherwise ignored; the in-memory view stays authoritative for this run.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<AppId, RuntimeStateRecord>>,
}

impl StateStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Loads `path` if it exists; a missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let file: StateFile = serde_json::from_slice(&raw)
                    .with_context(|| format!("parse state file {}", path.display()))?;
                file.apps
                    .into_iter()
                    .map(|r| (r.app_id.clone(), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read state file {}", path.display()));
            }
        };
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, app_id: &AppId) -> Option<RuntimeStateRecord> {
        self.records.lock().await.get(app_id).cloned()
    }

    pub async fn list(&self) -> Vec<RuntimeStateRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn upsert(&self, record: RuntimeStateRecord) {
        let mut records = self.records.lock().await;
        records.insert(record.app_id.clone(), record);
        self.persist(&records).await;
    }

    /// A fresh process replaces whatever was known before, port included.
    pub async fn record_started(
        &self,
        app_id: &AppId,
        pid: u32,
        install_path: &Path,
        log_offset: u64,
        started_at_unix_ms: u64,
    ) {
        self.upsert(RuntimeStateRecord {
            app_id: app_id.clone(),
            pid: Some(pid),
            port: None,
            install_path: install_path.to_path_buf(),
            started_at_unix_ms: Some(started_at_unix_ms),
            log_offset: Some(log_offset),
        })
        .await;
    }

    pub async fn record_port(&self, app_id: &AppId, port: u16) {
        let mut records = self.records.lock().await;
        let Some(rec) = records.get_mut(app_id) else {
            return;
        };
        if rec.port == Some(port) {
            return;
        }
        rec.port = Some(port);
        self.persist(&records).await;
    }

    /// Clears pid and port together; the record itself (install path) stays.
    pub async fn clear_runtime(&self, app_id: &AppId) {
        let mut records = self.records.lock().await;
        let Some(rec) = records.get_mut(app_id) else {
            return;
        };
        if rec.pid.is_none() && rec.port.is_none() {
            return;
        }
        rec.pid = None;
        rec.port = None;
        rec.started_at_unix_ms = None;
        rec.log_offset = None;
        self.persist(&records).await;
    }

    pub async fn remove(&self, app_id: &AppId) -> Option<RuntimeStateRecord> {
        let mut records = self.records.lock().await;
        let removed = records.remove(app_id);
        if removed.is_some() {
            self.persist(&records).await;
        }
        removed
    }

    async fn persist(&self, records: &BTreeMap<AppId, RuntimeStateRecord>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_state_file(path, records).await {
            tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "failed to persist runtime state");
        }
    }
}

async fn write_state_file(
    path: &Path,
    records: &BTreeMap<AppId, RuntimeStateRecord>,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create state dir")?;
    }
    let file = StateFile {
        apps: records.values().cloned().collect(),
    };
    let data = serde_json::to_vec_pretty(&file).context("serialize state")?;

    let tmp = path.with_extension("json.tmp");
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create temp state file")?;
    f.write_all(&data).await.context("write temp state file")?;
    f.flush().await.context("flush temp state file")?;
    drop(f);

    tokio::fs::rename(&tmp, path)
        .await
        .context("replace state file")?;
    Ok(())
}
