use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use keeper_process::{HealthSnapshot, HealthStatus};
use tokio::time::Instant;

use crate::os;

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Liveness classification of a tracked root pid.
///
/// A dead pid is only called a zombie once it has been watched for longer
/// than `grace`; before that it may simply still be starting up.
pub fn classify(alive: bool, watched_for: Duration, grace: Duration) -> HealthStatus {
    if alive {
        HealthStatus::Running
    } else if watched_for > grace {
        HealthStatus::Zombie
    } else {
        HealthStatus::Unknown
    }
}

/// Resource usage summed over a process tree.
#[derive(Debug, Default, Clone)]
pub(crate) struct TreeUsage {
    /// Cumulative user+system CPU ticks per member that could be read.
    cpu_ticks: HashMap<u32, u64>,
    pub(crate) rss_bytes: Option<u64>,
}

/// Periodic health sampler for one root pid.
#[derive(Debug)]
pub struct HealthSampler {
    pid: u32,
    watched_since: Instant,
    grace: Duration,
    last: Option<(HashMap<u32, u64>, Instant)>,
    #[cfg(not(target_os = "linux"))]
    system: sysinfo::System,
}

impl HealthSampler {
    pub fn new(pid: u32, watched_since: Instant, grace: Duration) -> Self {
        Self {
            pid,
            watched_since,
            grace,
            last: None,
            #[cfg(not(target_os = "linux"))]
            system: sysinfo::System::new(),
        }
    }

    pub async fn sample(&mut self) -> HealthSnapshot {
        let alive = os::probe_alive(self.pid).await;
        let now = Instant::now();
        let status = classify(alive, now.duration_since(self.watched_since), self.grace);

        let (cpu_percent, memory_bytes) = if alive {
            let usage = self.tree_usage().await;
            let cpu = self
                .last
                .as_ref()
                .and_then(|(prev, prev_at)| cpu_percent(prev, *prev_at, &usage.cpu_ticks, now));
            self.last = Some((usage.cpu_ticks, now));
            (cpu, usage.rss_bytes)
        } else {
            self.last = None;
            (None, None)
        };

        HealthSnapshot {
            pid: self.pid,
            is_alive: alive,
            cpu_percent,
            memory_bytes,
            status,
            sampled_at_unix_ms: unix_ms_now(),
        }
    }

    #[cfg(target_os = "linux")]
    async fn tree_usage(&mut self) -> TreeUsage {
        sample_tree(self.pid).await
    }

    #[cfg(not(target_os = "linux"))]
    async fn tree_usage(&mut self) -> TreeUsage {
        let root = self.pid;
        let system = std::mem::replace(&mut self.system, sysinfo::System::new());
        match tokio::task::spawn_blocking(move || sysinfo_tree_usage(system, root)).await {
            Ok((system, usage)) => {
                self.system = system;
                usage
            }
            Err(_) => TreeUsage::default(),
        }
    }
}

/// Refreshes the whole table, so it must run off the async workers.
#[cfg(not(target_os = "linux"))]
fn sysinfo_tree_usage(mut system: sysinfo::System, root: u32) -> (sysinfo::System, TreeUsage) {
    use sysinfo::ProcessesToUpdate;

    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, proc_) in system.processes() {
        if let Some(parent) = proc_.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let pids = walk_tree(root, &children);
    let mut usage = TreeUsage::default();
    let mut rss = 0u64;
    let mut any = false;
    for pid in &pids {
        let Some(p) = system.process(sysinfo::Pid::from_u32(*pid)) else {
            continue;
        };
        any = true;
        rss = rss.saturating_add(p.memory());
        // Cumulative cpu time in ms, i.e. ticks at 1000/s.
        usage.cpu_ticks.insert(*pid, p.accumulated_cpu_time());
    }
    usage.rss_bytes = any.then_some(rss);
    (system, usage)
}

fn walk_tree(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut out = vec![root];
    let mut i = 0;
    while i < out.len() {
        if let Some(kids) = children.get(&out[i]) {
            for k in kids {
                if !out.contains(k) {
                    out.push(*k);
                }
            }
        }
        i += 1;
    }
    out
}

/// CPU percent across members present in both samples. Members that appeared
/// or vanished in between are ignored.
fn cpu_percent(
    prev: &HashMap<u32, u64>,
    prev_at: Instant,
    ticks: &HashMap<u32, u64>,
    now: Instant,
) -> Option<f32> {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return None;
    }
    let delta: u64 = ticks
        .iter()
        .filter_map(|(pid, t)| prev.get(pid).map(|p| t.saturating_sub(*p)))
        .sum();
    let cpu = (delta as f64 / ticks_per_sec() as f64) / dt * 100.0;
    cpu.is_finite().then_some(cpu.max(0.0) as f32)
}

#[cfg(target_os = "linux")]
pub(crate) fn ticks_per_sec() -> u64 {
    use std::sync::OnceLock;

    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn ticks_per_sec() -> u64 {
    1000
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    use std::sync::OnceLock;

    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcStat {
    pub(crate) state: char,
    pub(crate) ppid: u32,
    pub(crate) cpu_ticks: u64,
}

#[cfg(target_os = "linux")]
fn parse_proc_stat(s: &str) -> Option<ProcStat> {
    // comm may contain spaces and parens; fields resume after the last ')'.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let state = parts.first()?.chars().next()?;
    let ppid: u32 = parts.get(1)?.parse().ok()?;
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(ProcStat {
        state,
        ppid,
        cpu_ticks: utime.saturating_add(stime),
    })
}

#[cfg(target_os = "linux")]
pub(crate) async fn read_proc_stat(pid: u32) -> Option<ProcStat> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    parse_proc_stat(&s)
}

#[cfg(target_os = "linux")]
async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(target_os = "linux")]
async fn proc_table() -> HashMap<u32, ProcStat> {
    let mut out = HashMap::new();
    let Ok(mut dir) = tokio::fs::read_dir("/proc").await else {
        return out;
    };
    while let Ok(Some(ent)) = dir.next_entry().await {
        let Some(pid) = ent.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Processes exit between listing and reading; skip those.
        if let Some(stat) = read_proc_stat(pid).await {
            out.insert(pid, stat);
        }
    }
    out
}

/// Every pid in the tree rooted at `root`, root first.
#[cfg(target_os = "linux")]
pub async fn descendants(root: u32) -> Vec<u32> {
    let table = proc_table().await;
    tree_from_table(root, &table)
}

#[cfg(not(target_os = "linux"))]
pub async fn descendants(root: u32) -> Vec<u32> {
    tokio::task::spawn_blocking(move || {
        use sysinfo::{ProcessesToUpdate, System};

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, proc_) in system.processes() {
            if let Some(parent) = proc_.parent() {
                children.entry(parent.as_u32()).or_default().push(pid.as_u32());
            }
        }
        walk_tree(root, &children)
    })
    .await
    .unwrap_or_else(|_| vec![root])
}

#[cfg(target_os = "linux")]
fn tree_from_table(root: u32, table: &HashMap<u32, ProcStat>) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, stat) in table {
        children.entry(stat.ppid).or_default().push(*pid);
    }
    walk_tree(root, &children)
}

#[cfg(target_os = "linux")]
pub(crate) async fn sample_tree(root: u32) -> TreeUsage {
    let table = proc_table().await;
    let pids = tree_from_table(root, &table);

    let mut usage = TreeUsage::default();
    let mut rss = 0u64;
    let mut any_rss = false;
    for pid in &pids {
        let Some(stat) = table.get(pid) else {
            continue;
        };
        if stat.state == 'Z' {
            continue;
        }
        usage.cpu_ticks.insert(*pid, stat.cpu_ticks);
        if let Some(b) = read_proc_rss_bytes(*pid).await {
            rss = rss.saturating_add(b);
            any_rss = true;
        }
    }
    usage.rss_bytes = any_rss.then_some(rss);
    usage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_respects_grace() {
        let grace = Duration::from_secs(5);
        assert_eq!(classify(true, Duration::ZERO, grace), HealthStatus::Running);
        assert_eq!(classify(true, Duration::from_secs(60), grace), HealthStatus::Running);
        assert_eq!(classify(false, Duration::from_secs(1), grace), HealthStatus::Unknown);
        assert_eq!(classify(false, grace, grace), HealthStatus::Unknown);
        assert_eq!(classify(false, Duration::from_secs(6), grace), HealthStatus::Zombie);
    }

    #[test]
    fn walk_tree_collects_all_descendants_once() {
        let mut children = HashMap::new();
        children.insert(1, vec![2, 3]);
        children.insert(2, vec![4]);
        children.insert(4, vec![1]);
        children.insert(9, vec![10]);
        let mut tree = walk_tree(1, &children);
        tree.sort_unstable();
        assert_eq!(tree, vec![1, 2, 3, 4]);
    }

    #[test]
    fn cpu_percent_ignores_members_missing_from_one_sample() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let tps = ticks_per_sec();
        let prev = HashMap::from([(1, 0), (2, 0)]);
        let cur = HashMap::from([(1, tps / 2), (3, 10 * tps)]);
        let cpu = cpu_percent(&prev, t0, &cur, t1).unwrap();
        assert!((cpu - 50.0).abs() < 0.5, "{cpu}");
        assert_eq!(cpu_percent(&prev, t1, &cur, t1), None);
    }

    #[tokio::test]
    async fn missing_pid_is_unknown_then_zombie() {
        let grace = Duration::from_millis(200);
        let mut sampler = HealthSampler::new(2_000_000_000, Instant::now(), grace);

        let first = sampler.sample().await;
        assert!(!first.is_alive);
        assert_eq!(first.status, HealthStatus::Unknown);
        assert_eq!(first.memory_bytes, None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let later = sampler.sample().await;
        assert_eq!(later.status, HealthStatus::Zombie);
        assert_eq!(later.cpu_percent, None);
    }

    #[tokio::test]
    async fn own_process_is_running_with_memory() {
        let mut sampler = HealthSampler::new(std::process::id(), Instant::now(), Duration::ZERO);
        let first = sampler.sample().await;
        assert_eq!(first.status, HealthStatus::Running);
        assert_eq!(first.cpu_percent, None);
        if cfg!(target_os = "linux") {
            assert!(first.memory_bytes.unwrap_or(0) > 0);
        }
        let second = sampler.sample().await;
        assert!(second.cpu_percent.is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_stat_with_spaces_in_comm() {
        let line = "1234 (my (weird) app) S 1 1234 1234 0 -1 4194560 100 0 0 0 7 3 0 0 20 0 1 0 100 0 0";
        let st = parse_proc_stat(line).unwrap();
        assert_eq!(st.state, 'S');
        assert_eq!(st.ppid, 1);
        assert_eq!(st.cpu_ticks, 10);
    }
}
