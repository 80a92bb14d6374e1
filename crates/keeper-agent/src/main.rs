use anyhow::Context;
use keeper_agent::{ProcessManager, StateStore, SupervisorConfig, api};
use keeper_process::SupervisorEvent;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(cfg: &SupervisorConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let file = tracing_appender::rolling::daily(cfg.data_root.join("agent"), "keeper-agent.log");
    let (writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    guard
}

fn log_event(ev: &SupervisorEvent) {
    let app_id = ev.app_id();
    match ev {
        SupervisorEvent::Log { line, replayed, .. } => {
            tracing::debug!(%app_id, replayed, "{line}")
        }
        SupervisorEvent::Started { pid, .. } => tracing::info!(%app_id, pid, "event: started"),
        SupervisorEvent::Restored { pid, port, .. } => {
            tracing::info!(%app_id, pid, ?port, "event: restored")
        }
        SupervisorEvent::PortChanged { port, .. } => {
            tracing::info!(%app_id, port, "event: port changed")
        }
        SupervisorEvent::Stopped { pid, reason, .. } => {
            tracing::info!(%app_id, pid, ?reason, "event: stopped")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = SupervisorConfig::from_env();
    let _log_guard = init_tracing(&cfg);

    let store = StateStore::open(cfg.state_path())
        .await
        .context("open runtime state")?;
    tracing::info!(path = ?store.path(), "runtime state loaded");
    let addr = cfg.http_addr;
    let (manager, mut events) = ProcessManager::new(cfg, store);

    tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            log_event(&ev);
        }
    });

    let report = manager.recover().await;
    tracing::info!(
        adopted = report.adopted.len(),
        cleared = report.cleared.len(),
        "recovery finished"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "keeper-agent HTTP listening");

    axum::serve(listener, api::router(manager.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    // Children keep running; the next start adopts them again.
    manager.detach_all().await;
    Ok(())
}
