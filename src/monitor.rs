//! Periodic health monitoring across supervisors.
//!
//! Each registered subject has an async probe, an independent consecutive
//! failure counter, and a bounded window of recent samples. The monitor's
//! internal registries are only touched from its own scheduler task;
//! everything observable leaves through [`MonitorEvent`]s.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use fc_live::HealthSample;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::events::MonitorEvent;

/// Samples retained per subject.
const WINDOW_SIZE: usize = 10;

pub type HealthProbe =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = HealthSample> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MonitorTuning {
    pub check_interval: Duration,
    /// Healthy fraction at or below this is degraded.
    pub health_threshold: f64,
    /// Healthy fraction at or below this is critical.
    pub critical_threshold: f64,
    /// Consecutive failures before a subject is declared down.
    pub max_failures: u32,
}

impl Default for MonitorTuning {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            health_threshold: 0.8,
            critical_threshold: 0.3,
            max_failures: 3,
        }
    }
}

struct Subject {
    id: String,
    probe: HealthProbe,
    failures: u32,
    window: VecDeque<HealthSample>,
}

pub struct HealthMonitor {
    subjects: Vec<Subject>,
    tuning: MonitorTuning,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

impl HealthMonitor {
    pub fn new(tuning: MonitorTuning, events: mpsc::UnboundedSender<MonitorEvent>) -> Self {
        Self {
            subjects: Vec::new(),
            tuning,
            events,
        }
    }

    pub fn register(&mut self, id: impl Into<String>, probe: HealthProbe) {
        self.subjects.push(Subject {
            id: id.into(),
            probe,
            failures: 0,
            window: VecDeque::with_capacity(WINDOW_SIZE),
        });
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    /// Probe one subject outside the interval. Shares the failure
    /// accounting with the scheduled passes.
    pub async fn check(&mut self, id: &str) -> Option<HealthSample> {
        let index = self.subjects.iter().position(|s| s.id == id)?;
        let sample = Self::run_probe(&self.subjects[index]).await;
        self.account(index, &sample);
        Some(sample)
    }

    /// One full probe pass: every subject, then the aggregate thresholds.
    pub async fn tick(&mut self) -> Vec<(String, HealthSample)> {
        let mut results = Vec::with_capacity(self.subjects.len());
        for index in 0..self.subjects.len() {
            let sample = Self::run_probe(&self.subjects[index]).await;
            self.account(index, &sample);
            results.push((self.subjects[index].id.clone(), sample));
        }

        let _ = self
            .events
            .send(MonitorEvent::HealthCheckCompleted(results.clone()));
        self.evaluate_aggregate(&results);
        results
    }

    /// A probe that dies is itself a health failure.
    async fn run_probe(subject: &Subject) -> HealthSample {
        let future = (subject.probe)();
        match tokio::spawn(future).await {
            Ok(sample) => sample,
            Err(e) => HealthSample::unhealthy(format!("probe failed: {e}")),
        }
    }

    fn account(&mut self, index: usize, sample: &HealthSample) {
        let max_failures = self.tuning.max_failures;
        let subject = &mut self.subjects[index];

        subject.window.push_back(sample.clone());
        while subject.window.len() > WINDOW_SIZE {
            subject.window.pop_front();
        }

        if sample.healthy {
            if subject.failures > 0 {
                debug!(subject = %subject.id, "recovered, resetting failure counter");
            }
            subject.failures = 0;
            return;
        }

        subject.failures += 1;
        warn!(
            subject = %subject.id,
            failures = subject.failures,
            reason = %sample.reason,
            "health probe unhealthy"
        );
        // Emit exactly at the bound, never again until a recovery resets it.
        if subject.failures == max_failures {
            let _ = self
                .events
                .send(MonitorEvent::ServerDown(subject.id.clone()));
        }
    }

    fn evaluate_aggregate(&self, results: &[(String, HealthSample)]) {
        let total = results.len();
        if total == 0 {
            return;
        }
        let healthy = results.iter().filter(|(_, s)| s.healthy).count();
        let fraction = healthy as f64 / total as f64;

        if fraction <= self.tuning.critical_threshold {
            let _ = self.events.send(MonitorEvent::CriticalFailure(format!(
                "only {healthy}/{total} subjects healthy"
            )));
        } else if fraction <= self.tuning.health_threshold {
            let _ = self
                .events
                .send(MonitorEvent::SystemDegraded { healthy, total });
        }
    }
}

/// Commands accepted by the running monitor task.
#[derive(Debug)]
pub enum MonitorCommand {
    ForceCheck(String),
}

#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<MonitorCommand>,
}

impl MonitorHandle {
    pub fn force_check(&self, id: impl Into<String>) {
        let _ = self.commands.send(MonitorCommand::ForceCheck(id.into()));
    }
}

/// Move the monitor into its scheduler task.
pub fn spawn_monitor(
    mut monitor: HealthMonitor,
    mut shutdown: watch::Receiver<bool>,
) -> (tokio::task::JoinHandle<()>, MonitorHandle) {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let handle = MonitorHandle {
        commands: command_tx,
    };

    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(monitor.tuning.check_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    monitor.tick().await;
                }
                Some(command) = command_rx.recv() => match command {
                    MonitorCommand::ForceCheck(id) => {
                        monitor.check(&id).await;
                    }
                },
                _ = shutdown.changed() => {
                    debug!("health monitor shutting down");
                    return;
                }
            }
        }
    });

    (task, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn scripted_probe(healthy: Arc<AtomicBool>) -> HealthProbe {
        Box::new(move || {
            let healthy = healthy.clone();
            Box::pin(async move {
                if healthy.load(Ordering::SeqCst) {
                    HealthSample::healthy("ok")
                } else {
                    HealthSample::unhealthy("down")
                }
            })
        })
    }

    fn monitor_with(
        subjects: Vec<(&str, Arc<AtomicBool>)>,
        tuning: MonitorTuning,
    ) -> (HealthMonitor, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut monitor = HealthMonitor::new(tuning, tx);
        for (id, flag) in subjects {
            monitor.register(id, scripted_probe(flag));
        }
        (monitor, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn server_down_count(events: &[MonitorEvent], id: &str) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::ServerDown(s) if s == id))
            .count()
    }

    #[tokio::test]
    async fn server_down_fires_exactly_at_the_failure_bound() {
        let flag = Arc::new(AtomicBool::new(false));
        let (mut monitor, mut rx) =
            monitor_with(vec![("s1", flag.clone())], MonitorTuning::default());

        // Two failures: no ServerDown yet.
        monitor.tick().await;
        monitor.tick().await;
        assert_eq!(server_down_count(&drain(&mut rx), "s1"), 0);

        // Third consecutive failure: exactly one ServerDown.
        monitor.tick().await;
        assert_eq!(server_down_count(&drain(&mut rx), "s1"), 1);

        // Fourth failure: no new event.
        monitor.tick().await;
        assert_eq!(server_down_count(&drain(&mut rx), "s1"), 0);

        // Recovery resets the counter...
        flag.store(true, Ordering::SeqCst);
        monitor.tick().await;
        drain(&mut rx);

        // ...so three fresh failures fire again.
        flag.store(false, Ordering::SeqCst);
        monitor.tick().await;
        monitor.tick().await;
        monitor.tick().await;
        assert_eq!(server_down_count(&drain(&mut rx), "s1"), 1);
    }

    #[tokio::test]
    async fn forced_check_shares_the_accounting() {
        let flag = Arc::new(AtomicBool::new(false));
        let (mut monitor, mut rx) =
            monitor_with(vec![("s1", flag.clone())], MonitorTuning::default());

        monitor.tick().await;
        let sample = monitor.check("s1").await.unwrap();
        assert!(!sample.healthy);
        monitor.check("s1").await;

        // tick + 2 forced checks = 3 consecutive failures.
        assert_eq!(server_down_count(&drain(&mut rx), "s1"), 1);
    }

    #[tokio::test]
    async fn check_on_unknown_subject_returns_none() {
        let (mut monitor, _rx) = monitor_with(Vec::new(), MonitorTuning::default());
        assert!(monitor.check("ghost").await.is_none());
    }

    #[tokio::test]
    async fn degraded_and_critical_thresholds() {
        let a = Arc::new(AtomicBool::new(true));
        let b = Arc::new(AtomicBool::new(true));
        let (mut monitor, mut rx) = monitor_with(
            vec![("a", a.clone()), ("b", b.clone())],
            MonitorTuning::default(),
        );

        // All healthy: only the per-tick report.
        monitor.tick().await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], MonitorEvent::HealthCheckCompleted(_)));

        // Half healthy: 0.5 <= 0.8 but > 0.3 -> degraded.
        a.store(false, Ordering::SeqCst);
        monitor.tick().await;
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::SystemDegraded { healthy: 1, total: 2 })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, MonitorEvent::CriticalFailure(_))));

        // None healthy: critical.
        b.store(false, Ordering::SeqCst);
        monitor.tick().await;
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::CriticalFailure(_))));
    }

    #[tokio::test]
    async fn sample_window_is_bounded() {
        let flag = Arc::new(AtomicBool::new(false));
        let (mut monitor, _rx) =
            monitor_with(vec![("s1", flag.clone())], MonitorTuning::default());

        for _ in 0..25 {
            monitor.tick().await;
        }
        assert_eq!(monitor.subjects[0].window.len(), WINDOW_SIZE);
    }

    #[tokio::test]
    async fn panicking_probe_counts_as_unhealthy() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = HealthMonitor::new(MonitorTuning::default(), tx);
        monitor.register(
            "s1",
            Box::new(|| Box::pin(async { panic!("probe exploded") })),
        );

        let results = monitor.tick().await;
        assert!(!results[0].1.healthy);
        assert!(results[0].1.reason.contains("probe failed"));
        drain(&mut rx);
    }
}
