use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

/// Aggregated usage of one process and every live descendant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeUsage {
    /// Sum of per-process CPU usage; may exceed 100 on multi-core hosts
    pub cpu_percent: f32,
    pub rss_bytes: u64,
    /// Number of processes that contributed to the sums
    pub processes: usize,
}

/// Sum CPU/RSS over `root` and its descendants from an already refreshed `System`.
///
/// Returns `None` when `root` itself is gone. Descendants that vanished between
/// refresh and scan simply do not contribute.
pub fn tree_usage(sys: &System, root: u32) -> Option<TreeUsage> {
    let root = Pid::from_u32(root);
    let root_proc = sys.process(root)?;

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut usage = TreeUsage {
        cpu_percent: root_proc.cpu_usage().max(0.0),
        rss_bytes: root_proc.memory(),
        processes: 1,
    };

    // 재귀 대신 BFS, PID 재사용으로 인한 순환도 방지
    let mut seen: HashSet<Pid> = HashSet::from([root]);
    let mut queue: VecDeque<Pid> = children.get(&root).cloned().unwrap_or_default().into();
    while let Some(pid) = queue.pop_front() {
        if !seen.insert(pid) {
            continue;
        }
        let Some(process) = sys.process(pid) else {
            continue;
        };
        usage.cpu_percent += process.cpu_usage().max(0.0);
        usage.rss_bytes += process.memory();
        usage.processes += 1;
        if let Some(grandchildren) = children.get(&pid) {
            queue.extend(grandchildren.iter().copied());
        }
    }

    Some(usage)
}

/// Number of logical cores, used to normalize summed CPU percentages for display.
pub fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ── Async wrappers ─────────────────────────────────────────
// sysinfo 시스템 콜은 동기적으로 OS 프로세스 테이블 전체를 스캔합니다.
// tokio 워커 스레드에서 직접 호출하면 런타임 전체가 블로킹되므로,
// spawn_blocking을 통해 전용 블로킹 스레드풀에서 실행합니다.

/// Refresh `sys` and measure the tree rooted at `root` on the blocking pool.
/// The `System` is handed back so CPU deltas accumulate across calls.
pub async fn sample_tree_async(mut sys: System, root: u32) -> (System, Option<TreeUsage>) {
    let joined = tokio::task::spawn_blocking(move || {
        sys.refresh_processes();
        let usage = tree_usage(&sys, root);
        (sys, usage)
    })
    .await;
    match joined {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("Process scan task failed: {}", e);
            (System::new(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_tree() {
        let mut sys = System::new();
        sys.refresh_processes();
        let usage = tree_usage(&sys, std::process::id()).expect("own process must be visible");
        assert!(usage.processes >= 1);
        assert!(usage.rss_bytes > 0);
        assert!(usage.cpu_percent >= 0.0);
    }

    #[test]
    fn test_missing_root() {
        let mut sys = System::new();
        sys.refresh_processes();
        // far above any pid_max
        assert!(tree_usage(&sys, u32::MAX - 1).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_descendants_are_counted() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let mut sys = System::new();
        sys.refresh_processes();
        let usage = tree_usage(&sys, std::process::id()).unwrap();
        let _ = child.kill();
        let _ = child.wait();
        assert!(usage.processes >= 2, "child should be part of the tree: {:?}", usage);
    }

    #[tokio::test]
    async fn test_sample_tree_async_keeps_system() {
        let (sys, usage) = sample_tree_async(System::new(), std::process::id()).await;
        assert!(usage.is_some());
        assert!(sys.process(Pid::from_u32(std::process::id())).is_some());
    }

    #[test]
    fn test_logical_cores() {
        assert!(logical_cores() >= 1);
    }
}
