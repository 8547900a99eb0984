//! System resource probe.
//!
//! Sizes the concurrency of a runner from the CPU count and the free memory of
//! the machine, and optionally samples usage in the background to warn when
//! the machine gets saturated. The sampler is purely observational and never
//! holds back work that is already scheduled.

use crate::{
    config::ResourceConfig,
    events::Subscriber,
    executors::{BoundedRunner, RunnerHandle},
    task::{BatchError, BatchResult, Task},
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

/// Point-in-time read of the machine wide resources
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub memory_used_percent: f64,
    pub cpu_used_percent: f64,
    pub free_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub cpu_count: usize,
}

impl ResourceSnapshot {
    /// snapshot of an otherwise idle machine
    pub fn idle(cpu_count: usize, free_memory_bytes: u64, total_memory_bytes: u64) -> Self {
        let total = total_memory_bytes.max(free_memory_bytes);

        Self {
            memory_used_percent: used_percent(total - free_memory_bytes, total),
            cpu_used_percent: 0.0,
            free_memory_bytes,
            total_memory_bytes: total,
            cpu_count,
        }
    }
}

fn used_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Concurrency computed for one requested level of parallelism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyPlan {
    pub requested: usize,
    pub cpu_ceiling: usize,
    pub memory_ceiling: usize,
    pub effective: usize,
}

/// Source of resource readings, replaceable for tests
pub trait ResourceSource: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Reads the real machine through `sysinfo`
pub struct SystemSource {
    system: Mutex<System>,
}

impl SystemSource {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_memory(MemoryRefreshKind::nothing().with_ram())
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage()),
        );
        system.refresh_cpu_all();

        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSource for SystemSource {
    fn snapshot(&self) -> ResourceSnapshot {
        let mut system = self.system.lock();

        system.refresh_memory();
        // usage is relative to the previous refresh, the very first read is 0
        system.refresh_cpu_usage();

        let total = system.total_memory();
        let free = system.available_memory();
        let cpu_count = match system.cpus().len() {
            0 => thread::available_parallelism().map_or(1, |count| count.get()),
            count => count,
        };

        ResourceSnapshot {
            memory_used_percent: used_percent(total.saturating_sub(free), total),
            cpu_used_percent: f64::from(system.global_cpu_usage()),
            free_memory_bytes: free,
            total_memory_bytes: total,
            cpu_count,
        }
    }
}

/// Returns whatever snapshot was set last
#[derive(Debug)]
pub struct FixedSource(Mutex<ResourceSnapshot>);

impl FixedSource {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self(Mutex::new(snapshot))
    }

    pub fn set(&self, snapshot: ResourceSnapshot) {
        *self.0.lock() = snapshot;
    }
}

impl ResourceSource for FixedSource {
    fn snapshot(&self) -> ResourceSnapshot {
        *self.0.lock()
    }
}

/// Saturation found by the monitor, only ever logged
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceWarning {
    #[error("memory usage at {used:.1}% exceeds {threshold:.1}%")]
    Memory { used: f64, threshold: f64 },
    #[error("cpu usage at {used:.1}% exceeds {threshold:.1}%")]
    Cpu { used: f64, threshold: f64 },
}

fn find_warnings(snapshot: &ResourceSnapshot, config: &ResourceConfig) -> Vec<ResourceWarning> {
    let mut warnings = Vec::new();

    if snapshot.memory_used_percent > config.memory_warning_percent {
        warnings.push(ResourceWarning::Memory {
            used: snapshot.memory_used_percent,
            threshold: config.memory_warning_percent,
        });
    }

    if snapshot.cpu_used_percent > config.cpu_warning_percent {
        warnings.push(ResourceWarning::Cpu {
            used: snapshot.cpu_used_percent,
            threshold: config.cpu_warning_percent,
        });
    }

    warnings
}

/// Background sampler, stops when dropped
#[derive(Debug)]
pub struct MonitorGuard {
    handle: JoinHandle<()>,
    warnings: Arc<AtomicUsize>,
}

impl MonitorGuard {
    /// number of warnings emitted so far
    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }

    /// stop sampling and return the number of warnings emitted
    pub fn stop(self) -> usize {
        self.handle.abort();
        self.warnings()
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct ResourceProbe {
    source: Arc<dyn ResourceSource>,
    config: ResourceConfig,
    monitor: Mutex<Option<MonitorGuard>>,
}

impl ResourceProbe {
    /// probe reading the actual machine
    pub fn new(config: ResourceConfig) -> Self {
        Self::with_source(Arc::new(SystemSource::new()), config)
    }

    pub fn with_source(source: Arc<dyn ResourceSource>, config: ResourceConfig) -> Self {
        Self {
            source,
            config,
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.source.snapshot()
    }

    /// size a requested level of parallelism against the current machine state
    pub fn plan(&self, requested: usize) -> ConcurrencyPlan {
        let snapshot = self.snapshot();
        let requested = requested.max(1);
        // one core stays with the controlling process
        let cpu_ceiling = snapshot.cpu_count.saturating_sub(1).max(1);
        let budget = u128::from(snapshot.free_memory_bytes)
            * u128::from(self.config.memory_budget_percent)
            / 100;
        let per_task = u128::from(self.config.per_task_memory_bytes().max(1));
        let memory_ceiling = usize::try_from(budget / per_task)
            .unwrap_or(usize::MAX)
            .max(1);
        let effective = requested.min(cpu_ceiling).min(memory_ceiling).max(1);

        debug!(
            requested,
            cpu_ceiling, memory_ceiling, effective, "Computed concurrency plan"
        );

        ConcurrencyPlan {
            requested,
            cpu_ceiling,
            memory_ceiling,
            effective,
        }
    }

    pub fn safe_concurrency(&self, requested: usize) -> usize {
        self.plan(requested).effective
    }

    /// take one sample and log every threshold it exceeds
    pub fn check(&self) -> Vec<ResourceWarning> {
        let warnings = find_warnings(&self.snapshot(), &self.config);

        for warning in warnings.iter() {
            warn!("Resource pressure: {warning}");
        }

        warnings
    }

    /// spawn a sampler that lives as long as the returned guard, needs a tokio runtime
    pub fn spawn_monitor(&self, interval: Duration) -> MonitorGuard {
        let source = self.source.clone();
        let config = self.config.clone();
        let warnings = Arc::new(AtomicUsize::new(0));
        let counter = warnings.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                for warning in find_warnings(&source.snapshot(), &config) {
                    warn!("Resource pressure: {warning}");
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        MonitorGuard { handle, warnings }
    }

    /// start the probe owned sampler, returns `false` if one is already running
    pub fn monitor(&self, interval: Duration) -> bool {
        let mut slot = self.monitor.lock();

        if slot.is_some() {
            return false;
        }

        debug!(?interval, "Starting resource monitor");
        *slot = Some(self.spawn_monitor(interval));

        true
    }

    /// stop the probe owned sampler, returns its warning count if it was running
    pub fn stop_monitor(&self) -> Option<usize> {
        self.monitor.lock().take().map(MonitorGuard::stop)
    }

    /// a runner sized by `safe_concurrency(requested)` that is monitored while it executes
    pub fn wrap_runner<T: Send + 'static>(
        self: &Arc<Self>,
        requested: usize,
    ) -> MonitoredRunner<T> {
        let plan = self.plan(requested);

        MonitoredRunner {
            probe: self.clone(),
            runner: BoundedRunner::new(plan.effective),
            plan,
        }
    }
}

/// `BoundedRunner` bundled with the probe that sized it
pub struct MonitoredRunner<T> {
    probe: Arc<ResourceProbe>,
    runner: BoundedRunner<T>,
    plan: ConcurrencyPlan,
}

impl<T: Send + 'static> MonitoredRunner<T> {
    pub fn plan(&self) -> ConcurrencyPlan {
        self.plan
    }

    pub fn handle(&self) -> RunnerHandle<T> {
        self.runner.handle()
    }

    pub fn subscribe_shared(mut self, subscriber: Arc<dyn Subscriber<T>>) -> Self {
        self.runner = self.runner.subscribe_shared(subscriber);
        self
    }

    /// execute one batch with the resource monitor running for its whole duration
    pub async fn execute(self, tasks: Vec<Task<T>>) -> Result<BatchResult<T>, BatchError> {
        let monitor = self.probe.spawn_monitor(self.probe.config.monitor_interval());
        let result = self.runner.execute(tasks).await;
        let warnings = monitor.stop();

        if warnings > 0 {
            info!(
                warnings,
                effective = self.plan.effective,
                "Batch finished with resource warnings"
            );
        }

        result
    }
}
