//! Supervises long-running app processes: launch, log capture, port
//! detection, health sampling, shutdown, and re-adoption after a restart.

pub mod api;
pub mod command;
pub mod config;
pub mod error;
pub mod handle;
pub mod health;
pub mod log_sink;
pub mod log_tailer;
pub mod manager;
pub mod os;
pub mod port_sniffer;
pub mod recovery;
pub mod state;

pub use config::SupervisorConfig;
pub use manager::{LaunchRequest, ProcessManager};
pub use recovery::RecoveryReport;
pub use state::StateStore;
