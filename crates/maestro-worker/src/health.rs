//! Worker health monitor
//!
//! Rolling 60-second window of execution outcomes, classified into
//! healthy / degraded / unhealthy. A periodic tick re-evaluates the window
//! and state changes are broadcast so supervisors can react. The heartbeat
//! is bumped on every dispatch; a heartbeat older than the staleness bound
//! means the dispatch loop itself has stalled, which no sample-based
//! metric would show.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Healthy => write!(f, "healthy"),
            WorkerState::Degraded => write!(f, "degraded"),
            WorkerState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub window: Duration,
    pub tick_interval: Duration,
    pub degraded_errors_per_min: u32,
    pub degraded_consecutive_errors: u32,
    /// Processed tasks per minute below which a worker that has seen work
    /// counts as degraded.
    pub min_processing_rate_per_min: f64,
    pub unhealthy_errors_per_min: u32,
    pub unhealthy_consecutive_errors: u32,
    pub unhealthy_consecutive_watchdog_timeouts: u32,
    pub heartbeat_staleness: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            tick_interval: Duration::from_secs(30),
            degraded_errors_per_min: 5,
            degraded_consecutive_errors: 3,
            min_processing_rate_per_min: 1.0,
            unhealthy_errors_per_min: 10,
            unhealthy_consecutive_errors: 5,
            unhealthy_consecutive_watchdog_timeouts: 2,
            heartbeat_staleness: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: WorkerState,
    pub errors_per_min: f64,
    pub processing_rate_per_min: f64,
    pub consecutive_errors: u32,
    pub consecutive_watchdog_timeouts: u32,
    pub queue_depth: u64,
    pub samples_in_window: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    success: bool,
    #[allow(dead_code)]
    duration_ms: u64,
}

struct Inner {
    samples: VecDeque<Sample>,
    consecutive_errors: u32,
    consecutive_watchdog_timeouts: u32,
    queue_depth: u64,
    last_heartbeat: Instant,
    state: WorkerState,
}

pub struct WorkerHealthMonitor {
    inner: Mutex<Inner>,
    thresholds: HealthThresholds,
    state_tx: broadcast::Sender<WorkerState>,
}

impl WorkerHealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        let (state_tx, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(Inner {
                samples: VecDeque::new(),
                consecutive_errors: 0,
                consecutive_watchdog_timeouts: 0,
                queue_depth: 0,
                last_heartbeat: Instant::now(),
                state: WorkerState::Healthy,
            }),
            thresholds,
            state_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn record_success(&self, duration_ms: u64) {
        let mut inner = self.lock();
        inner.samples.push_back(Sample {
            at: Instant::now(),
            success: true,
            duration_ms,
        });
        inner.consecutive_errors = 0;
        inner.consecutive_watchdog_timeouts = 0;
        drop(inner);
        self.evaluate();
    }

    pub fn record_error(&self, duration_ms: u64) {
        let mut inner = self.lock();
        inner.samples.push_back(Sample {
            at: Instant::now(),
            success: false,
            duration_ms,
        });
        inner.consecutive_errors += 1;
        drop(inner);
        self.evaluate();
    }

    pub fn record_watchdog_timeout(&self) {
        let mut inner = self.lock();
        inner.samples.push_back(Sample {
            at: Instant::now(),
            success: false,
            duration_ms: 0,
        });
        inner.consecutive_errors += 1;
        inner.consecutive_watchdog_timeouts += 1;
        drop(inner);
        self.evaluate();
    }

    pub fn update_queue_depth(&self, depth: u64) {
        self.lock().queue_depth = depth;
    }

    /// Bumped at every dispatch so a truly stalled loop is distinguishable
    /// from an idle one.
    pub fn heartbeat(&self) {
        self.lock().last_heartbeat = Instant::now();
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut inner = self.lock();
        Self::prune(&mut inner.samples, self.thresholds.window);
        let (errors_per_min, processing_rate) = Self::rates(&inner.samples, self.thresholds.window);
        HealthSnapshot {
            state: inner.state,
            errors_per_min,
            processing_rate_per_min: processing_rate,
            consecutive_errors: inner.consecutive_errors,
            consecutive_watchdog_timeouts: inner.consecutive_watchdog_timeouts,
            queue_depth: inner.queue_depth,
            samples_in_window: inner.samples.len(),
        }
    }

    /// Re-evaluate the rolling window and broadcast on a state change.
    pub fn evaluate(&self) -> WorkerState {
        let mut inner = self.lock();
        Self::prune(&mut inner.samples, self.thresholds.window);
        let (errors_per_min, processing_rate) = Self::rates(&inner.samples, self.thresholds.window);
        let t = &self.thresholds;

        let next = if errors_per_min >= t.unhealthy_errors_per_min as f64
            || inner.consecutive_errors >= t.unhealthy_consecutive_errors
            || inner.consecutive_watchdog_timeouts >= t.unhealthy_consecutive_watchdog_timeouts
        {
            WorkerState::Unhealthy
        } else if errors_per_min >= t.degraded_errors_per_min as f64
            || inner.consecutive_errors >= t.degraded_consecutive_errors
            || (processing_rate < t.min_processing_rate_per_min && !inner.samples.is_empty())
        {
            WorkerState::Degraded
        } else {
            WorkerState::Healthy
        };

        if next != inner.state {
            tracing::warn!(
                from = %inner.state,
                to = %next,
                errors_per_min = errors_per_min,
                consecutive_errors = inner.consecutive_errors,
                consecutive_watchdog_timeouts = inner.consecutive_watchdog_timeouts,
                "Worker health state changed"
            );
            inner.state = next;
            let _ = self.state_tx.send(next);
        }
        next
    }

    /// Spawn the periodic tick that refreshes rolling metrics and warns on a
    /// stale heartbeat. Returns a shutdown sender.
    pub fn start_tick(self: &Arc<Self>) -> mpsc::Sender<()> {
        let monitor = self.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.thresholds.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tick.tick() => {
                        monitor.evaluate();
                        let stale = {
                            let inner = monitor.lock();
                            inner.last_heartbeat.elapsed() > monitor.thresholds.heartbeat_staleness
                        };
                        if stale {
                            tracing::warn!(
                                staleness_secs = monitor.thresholds.heartbeat_staleness.as_secs(),
                                "No worker heartbeat within the staleness bound; dispatch loop may be stalled"
                            );
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("health monitor lock poisoned")
    }

    fn prune(samples: &mut VecDeque<Sample>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = samples.front() {
            if now.duration_since(front.at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns (errors per minute, processed tasks per minute) over the
    /// window.
    fn rates(samples: &VecDeque<Sample>, window: Duration) -> (f64, f64) {
        let minutes = (window.as_secs_f64() / 60.0).max(f64::EPSILON);
        let errors = samples.iter().filter(|s| !s.success).count() as f64;
        let processed = samples.len() as f64;
        (errors / minutes, processed / minutes)
    }
}

impl Default for WorkerHealthMonitor {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let monitor = WorkerHealthMonitor::default();
        assert_eq!(monitor.state(), WorkerState::Healthy);
        assert_eq!(monitor.evaluate(), WorkerState::Healthy);
    }

    #[test]
    fn consecutive_errors_degrade_then_break() {
        let monitor = WorkerHealthMonitor::default();
        monitor.record_error(10);
        monitor.record_error(10);
        assert_eq!(monitor.state(), WorkerState::Healthy);
        monitor.record_error(10);
        assert_eq!(monitor.state(), WorkerState::Degraded);
        monitor.record_error(10);
        monitor.record_error(10);
        assert_eq!(monitor.state(), WorkerState::Unhealthy);
    }

    #[test]
    fn success_resets_consecutive_counters() {
        let monitor = WorkerHealthMonitor::default();
        monitor.record_error(10);
        monitor.record_error(10);
        monitor.record_success(10);
        assert_eq!(monitor.snapshot().consecutive_errors, 0);
        assert_eq!(monitor.state(), WorkerState::Healthy);
    }

    #[test]
    fn two_watchdog_timeouts_are_unhealthy() {
        let monitor = WorkerHealthMonitor::default();
        monitor.record_watchdog_timeout();
        assert_ne!(monitor.state(), WorkerState::Unhealthy);
        monitor.record_watchdog_timeout();
        assert_eq!(monitor.state(), WorkerState::Unhealthy);
    }

    #[test]
    fn error_rate_thresholds() {
        let monitor = WorkerHealthMonitor::default();
        // 5 errors inside the window, interleaved with successes so the
        // consecutive counter stays low.
        for _ in 0..5 {
            monitor.record_error(10);
            monitor.record_success(10);
        }
        assert_eq!(monitor.state(), WorkerState::Degraded);

        for _ in 0..5 {
            monitor.record_error(10);
            monitor.record_success(10);
        }
        assert_eq!(monitor.state(), WorkerState::Unhealthy);
    }

    #[test]
    fn state_changes_are_broadcast() {
        let monitor = WorkerHealthMonitor::default();
        let mut rx = monitor.subscribe();
        for _ in 0..3 {
            monitor.record_error(10);
        }
        assert_eq!(rx.try_recv().unwrap(), WorkerState::Degraded);
    }

    #[test]
    fn snapshot_reports_window_contents() {
        let monitor = WorkerHealthMonitor::default();
        monitor.record_success(25);
        monitor.record_error(50);
        monitor.update_queue_depth(7);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.samples_in_window, 2);
        assert_eq!(snapshot.queue_depth, 7);
        assert_eq!(snapshot.consecutive_errors, 1);
        assert!(snapshot.errors_per_min > 0.0);
    }
}
