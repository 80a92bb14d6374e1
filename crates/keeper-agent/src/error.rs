use keeper_process::AppId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,
    #[error("failed to parse command: {0}")]
    Parse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("app already running: {0}")]
    AlreadyRunning(AppId),
    #[error("command is empty")]
    EmptyCommand,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("failed to open log file for {app_id}")]
    LogSink {
        app_id: AppId,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {program} for {app_id}")]
    SpawnFailed {
        app_id: AppId,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned process for {0} has no pid")]
    NoPid(AppId),
}

impl From<CommandError> for LaunchError {
    fn from(value: CommandError) -> Self {
        match value {
            CommandError::Empty => LaunchError::EmptyCommand,
            CommandError::Parse(msg) => LaunchError::InvalidCommand(msg),
        }
    }
}

impl LaunchError {
    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::AlreadyRunning(_) => "already_running",
            LaunchError::EmptyCommand => "empty_command",
            LaunchError::InvalidCommand(_) => "invalid_command",
            LaunchError::LogSink { .. } => "log_sink_failed",
            LaunchError::SpawnFailed { .. } => "spawn_failed",
            LaunchError::NoPid(_) => "no_pid",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("app not running: {0}")]
    NotRunning(AppId),
    #[error("app already stopping: {0}")]
    AlreadyStopping(AppId),
    #[error("process for {0} has no pid")]
    NoPid(AppId),
    #[error("failed to signal pid {pid} of {app_id}")]
    SignalFailed {
        app_id: AppId,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

impl StopError {
    pub fn code(&self) -> &'static str {
        match self {
            StopError::NotRunning(_) => "not_running",
            StopError::AlreadyStopping(_) => "already_stopping",
            StopError::NoPid(_) => "no_pid",
            StopError::SignalFailed { .. } => "signal_failed",
        }
    }
}

/// Formats an error and all of its sources on one line.
pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_map_to_launch_errors() {
        assert!(matches!(
            LaunchError::from(CommandError::Empty),
            LaunchError::EmptyCommand
        ));
        assert!(matches!(
            LaunchError::from(CommandError::Parse("x".into())),
            LaunchError::InvalidCommand(_)
        ));
    }

    #[test]
    fn error_chain_includes_os_cause() {
        let err = StopError::SignalFailed {
            app_id: AppId::new("web"),
            pid: 7,
            source: std::io::Error::from_raw_os_error(libc::EPERM),
        };
        let s = format_error_chain(&err);
        assert!(s.starts_with("failed to signal pid 7 of web: "));
        assert_eq!(err.code(), "signal_failed");
    }
}
