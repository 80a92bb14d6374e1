#![cfg(unix)]

mod common;

use std::{io::Write, path::PathBuf, time::Duration};

use common::{drain, is_stopped, manager, request, wait_for};
use keeper_agent::{ProcessManager, StateStore, error::LaunchError, state::RuntimeStateRecord};
use keeper_process::{AppId, HandleOrigin, StopReason, SupervisorEvent};

const WAIT: Duration = Duration::from_secs(10);

fn record(app: &AppId, pid: u32, port: Option<u16>, install_path: PathBuf) -> RuntimeStateRecord {
    RuntimeStateRecord {
        app_id: app.clone(),
        pid: Some(pid),
        port,
        install_path,
        started_at_unix_ms: None,
        log_offset: None,
    }
}

fn append(path: &std::path::Path, s: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(s.as_bytes()).unwrap();
}

#[tokio::test]
async fn live_process_is_adopted_with_its_port() {
    let dir = tempfile::tempdir().unwrap();
    let app = AppId::new("survivor");
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();

    let state_path = dir.path().join("state.json");
    let store = StateStore::open(&state_path).await.unwrap();
    store
        .upsert(record(&app, pid, Some(8000), dir.path().to_path_buf()))
        .await;
    drop(store);

    let store = StateStore::open(&state_path).await.unwrap();
    let (m, mut rx, _) = manager(dir.path(), store);
    append(&m.config().log_path(&app), "from before the restart\n");

    let report = m.recover().await;
    assert_eq!(report.adopted, vec![app.clone()]);
    assert!(report.cleared.is_empty());

    let seen = wait_for(&mut rx, WAIT, |e| matches!(e, SupervisorEvent::Log { .. })).await;
    assert_eq!(
        seen[0],
        SupervisorEvent::Restored {
            app_id: app.clone(),
            pid,
            port: Some(8000)
        }
    );
    assert!(!seen.iter().any(|e| matches!(e, SupervisorEvent::Started { .. })));
    assert!(matches!(
        seen.last(),
        Some(SupervisorEvent::Log { line, replayed: true, .. }) if line == "from before the restart"
    ));

    let status = m.status(&app).await.unwrap();
    assert_eq!(status.pid, pid);
    assert_eq!(status.port, Some(8000));
    assert_eq!(status.origin, HandleOrigin::Adopted);

    // A second pass sees the app already supervised and does nothing.
    assert_eq!(m.recover().await, Default::default());
    let err = m.launch(&app, request(dir.path(), "sleep 30")).await.unwrap_err();
    assert!(matches!(err, LaunchError::AlreadyRunning(_)));

    append(&m.config().log_path(&app), "still going\n");
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, SupervisorEvent::Log { line, replayed: false, .. } if line == "still going")
    })
    .await;

    // The adopted process dies behind our back; only probing can notice.
    child.kill().unwrap();
    child.wait().unwrap();
    let seen = wait_for(&mut rx, WAIT, is_stopped).await;
    assert!(matches!(
        seen.last(),
        Some(SupervisorEvent::Stopped { pid: p, reason: StopReason::Vanished, .. }) if *p == pid
    ));
    let rec = m.store().get(&app).await.unwrap();
    assert_eq!((rec.pid, rec.port), (None, None));
}

#[tokio::test]
async fn dead_pid_is_cleared_without_events() {
    let dir = tempfile::tempdir().unwrap();
    let app = AppId::new("gone");
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();

    let store = StateStore::in_memory();
    store
        .upsert(record(&app, pid, Some(9000), dir.path().to_path_buf()))
        .await;
    let (m, mut rx, _) = manager(dir.path(), store);

    let report = m.recover().await;
    assert_eq!(report.cleared, vec![app.clone()]);
    assert!(report.adopted.is_empty());
    assert!(m.status(&app).await.is_none());

    let rec = m.store().get(&app).await.unwrap();
    assert_eq!((rec.pid, rec.port), (None, None));
    assert_eq!(rec.install_path, dir.path().to_path_buf());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn records_without_pid_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let app = AppId::new("idle");
    let store = StateStore::in_memory();
    store
        .upsert(RuntimeStateRecord {
            pid: None,
            ..record(&app, 0, None, dir.path().to_path_buf())
        })
        .await;
    let (m, _rx, _) = manager(dir.path(), store);

    assert_eq!(m.recover().await, Default::default());
    assert!(m.store().get(&app).await.is_some());
}

#[tokio::test]
async fn adopted_process_can_be_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let app = AppId::new("survivor");
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();

    let store = StateStore::in_memory();
    store
        .upsert(record(&app, pid, None, dir.path().to_path_buf()))
        .await;
    let signals = std::sync::Arc::new(common::CountingSignaller::default());
    let mut cfg = common::test_config(dir.path());
    // Leave the probe plenty of time to notice before escalation would kick in.
    cfg.kill_fallback = Duration::from_secs(5);
    let (m, mut rx) = ProcessManager::with_signaller(cfg, store, signals.clone());
    m.recover().await;

    m.terminate(&app).await.unwrap();
    // Not our child, so reap it here once the signal lands.
    let reaper = std::thread::spawn(move || child.wait().unwrap());
    let seen = wait_for(&mut rx, WAIT, is_stopped).await;
    assert!(matches!(
        seen.last(),
        Some(SupervisorEvent::Stopped { reason: StopReason::Vanished, .. })
    ));
    assert!(!reaper.join().unwrap().success());
    assert_eq!(signals.forced(), 0);
}

#[tokio::test]
async fn replay_refreshes_port_from_current_run_only() {
    let dir = tempfile::tempdir().unwrap();
    let app = AppId::new("flask");
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();

    // An earlier run announced another port in the same file.
    let log_path = common::test_config(dir.path()).log_path(&app);
    append(&log_path, " * Running on http://127.0.0.1:1111\n");
    let run_start = std::fs::metadata(&log_path).unwrap().len();
    append(&log_path, " * Running on http://127.0.0.1:2222\n");

    let store = StateStore::in_memory();
    store
        .upsert(RuntimeStateRecord {
            log_offset: Some(run_start),
            ..record(&app, pid, None, dir.path().to_path_buf())
        })
        .await;
    let (m, mut rx, _) = manager(dir.path(), store);
    m.recover().await;

    let seen = wait_for(&mut rx, WAIT, |e| {
        matches!(e, SupervisorEvent::PortChanged { .. })
    })
    .await;
    let replayed: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            SupervisorEvent::Log { line, replayed: true, .. } => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(replayed.len(), 2, "whole file is replayed: {seen:#?}");
    assert!(matches!(
        seen.last(),
        Some(SupervisorEvent::PortChanged { port: 2222, .. })
    ));
    assert_eq!(m.status(&app).await.unwrap().port, Some(2222));

    child.kill().unwrap();
    child.wait().unwrap();
    wait_for(&mut rx, WAIT, is_stopped).await;
}

#[tokio::test]
async fn rotated_log_is_sniffed_from_the_start() {
    let dir = tempfile::tempdir().unwrap();
    let app = AppId::new("rotated");
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();

    // The recorded offset points past the end of the rotated file.
    let log_path = common::test_config(dir.path()).log_path(&app);
    append(&log_path, "");
    let store = StateStore::in_memory();
    store
        .upsert(RuntimeStateRecord {
            log_offset: Some(10_000),
            ..record(&app, pid, Some(8000), dir.path().to_path_buf())
        })
        .await;
    let (m, mut rx, _) = manager(dir.path(), store);
    m.recover().await;
    wait_for(&mut rx, WAIT, |e| matches!(e, SupervisorEvent::Restored { .. })).await;

    append(&log_path, " * Running on http://127.0.0.1:4242\n");
    let seen = wait_for(&mut rx, WAIT, |e| {
        matches!(e, SupervisorEvent::PortChanged { .. })
    })
    .await;
    assert!(matches!(
        seen.last(),
        Some(SupervisorEvent::PortChanged { port: 4242, .. })
    ));
    assert_eq!(m.status(&app).await.unwrap().port, Some(4242));
    assert_eq!(m.store().get(&app).await.unwrap().port, Some(4242));

    child.kill().unwrap();
    child.wait().unwrap();
    wait_for(&mut rx, WAIT, is_stopped).await;
}
