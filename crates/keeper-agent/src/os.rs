//! Platform primitives: liveness probes, signal delivery and detaching a child
//! from the supervisor's session.

use std::io;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process tree to exit (SIGTERM).
    Graceful,
    /// Unconditional termination (SIGKILL / TerminateProcess).
    Force,
}

/// Delivers termination signals to a process tree.
///
/// The manager only ever kills through this seam, so tests can observe it.
pub trait ProcessSignaller: Send + Sync + std::fmt::Debug {
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// Whether a graceful signal exists; without one, shutdown waits a flush
    /// window and then kills.
    fn supports_graceful(&self) -> bool {
        cfg!(unix)
    }
}

/// Runs `signaller` on the blocking pool; implementations may shell out.
pub async fn deliver(
    signaller: std::sync::Arc<dyn ProcessSignaller>,
    pid: u32,
    signal: Signal,
) -> io::Result<()> {
    tokio::task::spawn_blocking(move || signaller.signal(pid, signal))
        .await
        .map_err(io::Error::other)?
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignaller;

impl ProcessSignaller for OsSignaller {
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        send_signal(pid, signal)
    }
}

#[cfg(unix)]
fn raw_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// Signals the process group led by `pid`, falling back to the pid itself.
/// A process that is already gone is not an error.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let Some(p) = raw_pid(pid) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"));
    };
    let sig = match signal {
        Signal::Graceful => libc::SIGTERM,
        Signal::Force => libc::SIGKILL,
    };

    // Children are started as session leaders, so pgid == pid.
    if unsafe { libc::kill(-p, sig) } == 0 {
        return Ok(());
    }
    let group_err = io::Error::last_os_error();
    if group_err.raw_os_error() != Some(libc::ESRCH) {
        return Err(group_err);
    }

    if unsafe { libc::kill(p, sig) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, _signal: Signal) -> io::Result<()> {
    // Tree kill is unconditional here; there is no graceful variant.
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    if status.success() || !probe_alive_blocking(pid) {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}

/// Whether `pid` currently names a live (non-zombie) process.
#[cfg(unix)]
pub async fn probe_alive(pid: u32) -> bool {
    let Some(p) = raw_pid(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(p, 0) };
    let exists = rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid).await
}

#[cfg(not(unix))]
pub async fn probe_alive(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || probe_alive_blocking(pid))
        .await
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
async fn is_zombie(pid: u32) -> bool {
    crate::health::read_proc_stat(pid)
        .await
        .is_some_and(|s| s.state == 'Z' || s.state == 'X')
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn probe_alive_blocking(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system.process(target).is_some()
}

/// Detaches the child so the supervisor's own termination does not reach it.
pub fn detach(cmd: &mut tokio::process::Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    #[cfg(windows)]
    {
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }
}
