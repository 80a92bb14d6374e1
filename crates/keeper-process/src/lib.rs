use specta::Type;

/// Caller-chosen identifier of a logical app.
///
/// Stable across supervisor restarts; never derived from a pid.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(transparent)]
pub struct AppId(pub String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How the supervisor came to track a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum HandleOrigin {
    /// Spawned by this supervisor run; exit is observed natively.
    Spawned,
    /// Taken over by pid after a supervisor restart; exit is only observed by polling.
    Adopted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Running,
    Zombie,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub is_alive: bool,
    /// Aggregate over the whole process tree. Absent until two samples exist.
    pub cpu_percent: Option<f32>,
    /// Resident memory summed over the whole process tree.
    pub memory_bytes: Option<u64>,
    pub status: HealthStatus,
    pub sampled_at_unix_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct AppStatus {
    pub app_id: AppId,
    pub pid: u32,
    pub port: Option<u16>,
    pub install_path: String,
    pub origin: HandleOrigin,
    pub started_at_unix_ms: u64,
    pub stopping: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// Native exit status observed for a spawned child.
    Exited { code: Option<i32> },
    /// Spawned child terminated by a signal.
    Signalled,
    /// The pid stopped answering liveness probes.
    Vanished,
}

/// Notifications emitted by the supervisor, in the order they were decided.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Log {
        app_id: AppId,
        line: String,
        /// Line came from replaying an adopted app's existing log file.
        replayed: bool,
    },
    Started {
        app_id: AppId,
        pid: u32,
    },
    /// An already-running process was adopted during recovery.
    Restored {
        app_id: AppId,
        pid: u32,
        port: Option<u16>,
    },
    PortChanged {
        app_id: AppId,
        port: u16,
    },
    Stopped {
        app_id: AppId,
        pid: u32,
        reason: StopReason,
    },
}

impl SupervisorEvent {
    pub fn app_id(&self) -> &AppId {
        match self {
            SupervisorEvent::Log { app_id, .. }
            | SupervisorEvent::Started { app_id, .. }
            | SupervisorEvent::Restored { app_id, .. }
            | SupervisorEvent::PortChanged { app_id, .. }
            | SupervisorEvent::Stopped { app_id, .. } => app_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_id_serializes_as_plain_string() {
        let id = AppId::new("flask-demo");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"flask-demo\"");
    }

    #[test]
    fn stopped_event_is_tagged() {
        let ev = SupervisorEvent::Stopped {
            app_id: AppId::new("a"),
            pid: 42,
            reason: StopReason::Exited { code: Some(0) },
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "stopped");
        assert_eq!(v["reason"]["kind"], "exited");
        assert_eq!(ev.app_id().as_str(), "a");
    }
}
