//! Resource sampling for a running server's process tree.
//!
//! One sampler task per process lifetime writes into a shared `ResourceUsage`;
//! everything else only reads it. When the task ends (token cancelled or the
//! tracked process vanished) the current sample is reset to zero.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::process_monitor::{self, TreeUsage};

/// Target cadence of the sampler loop.
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(500);
/// Number of points kept per metric for trend display.
pub const HISTORY_POINTS: usize = 60;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Summed over the process tree, not normalized by core count
    pub cpu_percent: f32,
    pub ram_mb: f64,
    /// Unix timestamp (milliseconds); 0 for the reset sample
    pub timestamp: u64,
}

impl ResourceSample {
    pub fn from_tree(tree: TreeUsage) -> Self {
        Self {
            cpu_percent: tree.cpu_percent.max(0.0),
            ram_mb: tree.rss_bytes as f64 / BYTES_PER_MB,
            timestamp: now_millis(),
        }
    }

    /// CPU share of the whole machine, 0..=100.
    pub fn cpu_normalized(&self, cores: usize) -> f32 {
        (self.cpu_percent / cores.max(1) as f32).clamp(0.0, 100.0)
    }

    /// RAM as a percentage of the configured heap size.
    pub fn ram_percent(&self, max_ram_mb: u64) -> f64 {
        if max_ram_mb == 0 {
            return 0.0;
        }
        (self.ram_mb / max_ram_mb as f64 * 100.0).max(0.0)
    }
}

/// Two bounded rings, one per metric.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceHistory {
    cpu: VecDeque<f32>,
    ram: VecDeque<f64>,
}

impl ResourceHistory {
    pub fn push(&mut self, sample: &ResourceSample) {
        if self.cpu.len() == HISTORY_POINTS {
            self.cpu.pop_front();
        }
        if self.ram.len() == HISTORY_POINTS {
            self.ram.pop_front();
        }
        self.cpu.push_back(sample.cpu_percent);
        self.ram.push_back(sample.ram_mb);
    }

    pub fn cpu(&self) -> Vec<f32> {
        self.cpu.iter().copied().collect()
    }

    pub fn ram(&self) -> Vec<f64> {
        self.ram.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.cpu.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty()
    }

    pub fn clear(&mut self) {
        self.cpu.clear();
        self.ram.clear();
    }
}

#[derive(Default)]
struct UsageState {
    current: ResourceSample,
    history: ResourceHistory,
}

/// Shared cell holding the latest sample and its history.
#[derive(Clone, Default)]
pub struct ResourceUsage {
    inner: Arc<RwLock<UsageState>>,
}

impl ResourceUsage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, UsageState> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, UsageState> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn current(&self) -> ResourceSample {
        self.read().current
    }

    pub fn history(&self) -> ResourceHistory {
        self.read().history.clone()
    }

    pub fn record(&self, sample: ResourceSample) {
        let mut state = self.write();
        state.current = sample;
        state.history.push(&sample);
    }

    /// Record only while `token` is live, checked under the write lock so a
    /// concurrent cancel-then-reset always wins.
    fn record_unless_cancelled(&self, sample: ResourceSample, token: &CancellationToken) -> bool {
        let mut state = self.write();
        if token.is_cancelled() {
            return false;
        }
        state.current = sample;
        state.history.push(&sample);
        true
    }

    /// Zero the current sample. History is kept for the trend view.
    pub fn reset(&self) {
        self.write().current = ResourceSample::default();
    }
}

// ─── Sampler ─────────────────────────────────────────────────

pub struct ResourceSampler {
    pid: u32,
    period: Duration,
    usage: ResourceUsage,
}

impl ResourceSampler {
    pub fn new(pid: u32, usage: ResourceUsage) -> Self {
        Self {
            pid,
            period: SAMPLE_PERIOD,
            usage,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Start sampling on a background task that ends when `token` is cancelled
    /// or the tracked process disappears.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    async fn run(self, token: CancellationToken) {
        tracing::debug!("Resource sampler started for pid {}", self.pid);
        let mut sys = System::new();
        loop {
            let tick_start = Instant::now();

            let (returned, tree) = process_monitor::sample_tree_async(sys, self.pid).await;
            sys = returned;
            match tree {
                Some(tree) => {
                    if !self
                        .usage
                        .record_unless_cancelled(ResourceSample::from_tree(tree), &token)
                    {
                        break;
                    }
                }
                None => {
                    tracing::debug!("pid {} is gone, sampler exiting", self.pid);
                    break;
                }
            }

            // 측정에 걸린 시간만큼 대기 시간 단축
            let pause = self.period.saturating_sub(tick_start.elapsed());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        self.usage.reset();
        tracing::debug!("Resource sampler for pid {} stopped", self.pid);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f32, ram: f64) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            ram_mb: ram,
            timestamp: 1,
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let usage = ResourceUsage::new();
        for i in 0..100 {
            usage.record(sample(i as f32, i as f64));
        }
        let history = usage.history();
        assert_eq!(history.len(), HISTORY_POINTS);
        assert_eq!(history.cpu()[0], 40.0);
        assert_eq!(*history.ram().last().unwrap(), 99.0);
        assert_eq!(usage.current().cpu_percent, 99.0);
    }

    #[test]
    fn test_reset_zeroes_current_only() {
        let usage = ResourceUsage::new();
        usage.record(sample(12.5, 900.0));
        usage.reset();
        assert_eq!(usage.current(), ResourceSample::default());
        assert_eq!(usage.history().len(), 1);
    }

    #[test]
    fn test_percent_helpers() {
        let s = sample(400.0, 1024.0);
        assert_eq!(s.cpu_normalized(8), 50.0);
        assert_eq!(s.cpu_normalized(0), 100.0);
        assert_eq!(s.ram_percent(2048), 50.0);
        assert_eq!(s.ram_percent(0), 0.0);
    }

    #[test]
    fn test_from_tree_clamps_negative_cpu() {
        let s = ResourceSample::from_tree(TreeUsage {
            cpu_percent: -3.0,
            rss_bytes: 2 * 1024 * 1024,
            processes: 1,
        });
        assert_eq!(s.cpu_percent, 0.0);
        assert_eq!(s.ram_mb, 2.0);
    }

    #[tokio::test]
    async fn test_sampler_resets_after_cancel() {
        let usage = ResourceUsage::new();
        let token = CancellationToken::new();
        let task = ResourceSampler::new(std::process::id(), usage.clone())
            .with_period(Duration::from_millis(50))
            .spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let live = usage.current();
        assert!(live.ram_mb > 0.0);
        assert!(live.cpu_percent >= 0.0);

        token.cancel();
        task.await.unwrap();
        assert_eq!(usage.current(), ResourceSample::default());
    }

    #[tokio::test]
    async fn test_sampler_exits_when_process_missing() {
        let usage = ResourceUsage::new();
        let token = CancellationToken::new();
        let task = ResourceSampler::new(u32::MAX - 1, usage.clone()).spawn(token);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sampler should stop on its own")
            .unwrap();
        assert_eq!(usage.current().ram_mb, 0.0);
    }
}
