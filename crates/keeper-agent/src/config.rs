use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use keeper_process::AppId;

use crate::command::RunnerProfile;

const DEFAULT_DATA_ROOT: &str = "./keeper-data";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:7420";

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_root: PathBuf,
    pub runner: RunnerProfile,
    pub log_poll_interval: Duration,
    pub health_poll_interval: Duration,
    pub zombie_grace: Duration,
    pub kill_fallback: Duration,
    /// Delay before an unconditional kill on platforms with no graceful signal.
    pub flush_window: Duration,
    pub http_addr: SocketAddr,
}

impl SupervisorConfig {
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            runner: RunnerProfile::default(),
            log_poll_interval: Duration::from_millis(500),
            health_poll_interval: Duration::from_millis(3000),
            zombie_grace: Duration::from_millis(5000),
            kill_fallback: Duration::from_secs(5),
            flush_window: Duration::from_millis(500),
            http_addr: DEFAULT_HTTP_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 7420))),
        }
    }

    pub fn from_env() -> Self {
        let data_root = env_string("KEEPER_DATA_ROOT").unwrap_or_else(|| DEFAULT_DATA_ROOT.into());
        let mut cfg = Self::with_data_root(data_root);

        if let Some(program) = env_string("KEEPER_RUNNER") {
            cfg.runner = RunnerProfile::for_program(program);
        }
        if let Some(v) = env_u64("KEEPER_LOG_POLL_MS") {
            cfg.log_poll_interval = Duration::from_millis(v.clamp(50, 10_000));
        }
        if let Some(v) = env_u64("KEEPER_HEALTH_POLL_MS") {
            cfg.health_poll_interval = Duration::from_millis(v.clamp(250, 60_000));
        }
        if let Some(v) = env_u64("KEEPER_ZOMBIE_GRACE_MS") {
            cfg.zombie_grace = Duration::from_millis(v.min(120_000));
        }
        if let Some(v) = env_u64("KEEPER_KILL_FALLBACK_SEC") {
            cfg.kill_fallback = Duration::from_secs(v.clamp(1, 60));
        }
        if let Some(v) = env_u64("KEEPER_FLUSH_WINDOW_MS") {
            cfg.flush_window = Duration::from_millis(v.min(10_000));
        }
        if let Some(addr) = env_string("KEEPER_HTTP_ADDR") {
            match addr.parse() {
                Ok(a) => cfg.http_addr = a,
                Err(err) => tracing::warn!(%addr, %err, "ignoring invalid KEEPER_HTTP_ADDR"),
            }
        }
        cfg
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_root.join("state.json")
    }

    pub fn log_path(&self, app_id: &AppId) -> PathBuf {
        log_path_in(&self.log_dir(), app_id)
    }
}

pub(crate) fn log_path_in(dir: &Path, app_id: &AppId) -> PathBuf {
    dir.join(format!("{}.log", sanitize_file_stem(app_id.as_str())))
}

/// Maps an opaque app id onto a single safe path component.
fn sanitize_file_stem(id: &str) -> String {
    let s: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let s = s.trim_start_matches('.');
    if s.is_empty() { "app".to_string() } else { s.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_is_keyed_by_app_id() {
        let cfg = SupervisorConfig::with_data_root("/data");
        assert_eq!(
            cfg.log_path(&AppId::new("flask-app")),
            PathBuf::from("/data/logs/flask-app.log")
        );
        assert_eq!(cfg.state_path(), PathBuf::from("/data/state.json"));
    }

    #[test]
    fn log_path_cannot_escape_log_dir() {
        let cfg = SupervisorConfig::with_data_root("/data");
        let p = cfg.log_path(&AppId::new("../../etc/passwd"));
        assert_eq!(p.parent(), Some(Path::new("/data/logs")));
        assert_eq!(sanitize_file_stem("..."), "app");
    }

    #[test]
    fn defaults_are_in_range() {
        let cfg = SupervisorConfig::with_data_root("/data");
        assert_eq!(cfg.kill_fallback, Duration::from_secs(5));
        assert!(cfg.zombie_grace > Duration::ZERO);
        assert_eq!(cfg.runner.program, "uv");
        assert_eq!(cfg.http_addr.port(), 7420);
    }
}
