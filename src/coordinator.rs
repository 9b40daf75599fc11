//! Root coordination: fan out one supervisor per configured server, wire
//! the health monitor across them, and run the event loop until shutdown.

use std::sync::Arc;
use std::time::Duration;

use fc_auth::{FileTokenStore, TokenStore, TracingPresenter, UserCodePresenter};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::events::{MonitorEvent, SupervisorEvent};
use crate::monitor::{spawn_monitor, HealthMonitor, MonitorHandle, MonitorTuning};
use crate::supervisor::ServerSupervisor;

enum MonitorAction {
    Continue,
    Restart,
    Exit,
}

pub struct RootCoordinator {
    config: AppConfig,
    store: Arc<dyn TokenStore>,
    presenter: Arc<dyn UserCodePresenter>,
    supervisors: Vec<Arc<ServerSupervisor>>,
    supervisor_events: mpsc::UnboundedSender<SupervisorEvent>,
    supervisor_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    monitor_rx: Option<mpsc::UnboundedReceiver<MonitorEvent>>,
    monitor_handle: Option<MonitorHandle>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RootCoordinator {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        if config.demo_mode {
            warn!("demo_mode is set but not supported by this build; ignoring");
        }
        let store: Arc<dyn TokenStore> =
            Arc::new(FileTokenStore::new(&config.auth.token_path).await?);
        let (supervisor_events, supervisor_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            presenter: Arc::new(TracingPresenter),
            supervisors: Vec::new(),
            supervisor_events,
            supervisor_rx,
            monitor_rx: None,
            monitor_handle: None,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Initialize every supervisor, honoring `continue_on_server_failure`,
    /// then start monitoring and stats reporting.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        info!(servers = self.config.servers.len(), "starting coordinator");

        for server in self.config.servers.clone() {
            let id = server.id.clone();
            let supervisor = ServerSupervisor::new(
                server,
                &self.config,
                Arc::clone(&self.store),
                Arc::clone(&self.presenter),
                self.supervisor_events.clone(),
            )?;

            match supervisor.initialize().await {
                Ok(()) => {
                    info!(server = %id, "supervisor initialized");
                    self.supervisors.push(supervisor);
                }
                Err(e) if self.config.continue_on_server_failure => {
                    error!(server = %id, "supervisor failed to initialize, continuing: {e}");
                    self.supervisors.push(supervisor);
                }
                Err(e) => {
                    anyhow::bail!("server '{id}' failed to initialize: {e}");
                }
            }
        }

        self.start_monitor();
        self.start_stats_task();
        Ok(())
    }

    fn start_monitor(&mut self) {
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        let tuning = MonitorTuning {
            check_interval: Duration::from_secs(self.config.monitoring.check_interval_secs),
            health_threshold: self.config.monitoring.health_threshold,
            critical_threshold: self.config.monitoring.critical_threshold,
            max_failures: self.config.monitoring.max_failures,
        };
        let mut monitor = HealthMonitor::new(tuning, monitor_tx);
        for supervisor in &self.supervisors {
            let probe_target = Arc::clone(supervisor);
            monitor.register(
                supervisor.server_id(),
                Box::new(move || {
                    let supervisor = Arc::clone(&probe_target);
                    Box::pin(async move { supervisor.health_check().await })
                }),
            );
        }

        let (task, handle) = spawn_monitor(monitor, self.shutdown_tx.subscribe());
        self.tasks.push(task);
        self.monitor_rx = Some(monitor_rx);
        self.monitor_handle = Some(handle);
    }

    fn start_stats_task(&mut self) {
        let supervisors = self.supervisors.clone();
        let interval = Duration::from_secs(self.config.monitoring.stats_interval_secs);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        for supervisor in &supervisors {
                            let stats = supervisor.stats().await;
                            info!(
                                server = %stats.server_id,
                                state = stats.state,
                                identities = stats.identity_count,
                                edges = stats.established_edges,
                                session = stats.session_state,
                                session_name = stats.session_name.as_deref().unwrap_or("-"),
                                "stats"
                            );
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }));
    }

    /// Event loop: supervise until the shutdown signal fires. Returns when
    /// everything has been torn down.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut monitor_rx = self
            .monitor_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("coordinator not started"))?;

        loop {
            tokio::select! {
                Some(event) = monitor_rx.recv() => {
                    match self.handle_monitor_event(event) {
                        MonitorAction::Continue => {}
                        MonitorAction::Restart => {
                            self.restart().await?;
                            monitor_rx = self
                                .monitor_rx
                                .take()
                                .ok_or_else(|| anyhow::anyhow!("restart lost the monitor"))?;
                        }
                        MonitorAction::Exit => break,
                    }
                }
                Some(event) = self.supervisor_rx.recv() => {
                    self.handle_supervisor_event(event);
                }
                _ = shutdown.changed() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    fn handle_monitor_event(&self, event: MonitorEvent) -> MonitorAction {
        match event {
            MonitorEvent::HealthCheckCompleted(results) => {
                let healthy = results.iter().filter(|(_, s)| s.healthy).count();
                info!(healthy, total = results.len(), "health check completed");
            }
            MonitorEvent::ServerDown(id) => {
                warn!(server = %id, "server down");
                if let Some(supervisor) =
                    self.supervisors.iter().find(|s| s.server_id() == id)
                {
                    if supervisor.auto_recover() {
                        let supervisor = Arc::clone(supervisor);
                        tokio::spawn(async move { supervisor.recover().await });
                    }
                }
            }
            MonitorEvent::SystemDegraded { healthy, total } => {
                warn!(healthy, total, "system degraded");
            }
            MonitorEvent::CriticalFailure(reason) => {
                error!(%reason, "critical failure");
                if self.config.monitoring.restart_on_critical_failure {
                    return MonitorAction::Restart;
                }
                error!("restart on critical failure disabled, shutting down");
                return MonitorAction::Exit;
            }
        }
        MonitorAction::Continue
    }

    fn handle_supervisor_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Initialized {
                server_id,
                identity_count,
            } => info!(server = %server_id, identities = identity_count, "supervisor ready"),
            SupervisorEvent::SessionCreated {
                server_id,
                session_name,
            } => {
                info!(server = %server_id, session = %session_name, "session advertised");
                // A fresh session (initial or post-recovery) warrants an
                // out-of-band probe so the failure counter resets promptly.
                if let Some(handle) = &self.monitor_handle {
                    handle.force_check(&server_id);
                }
            }
            SupervisorEvent::SessionError { server_id, reason } => {
                error!(server = %server_id, %reason, "session error")
            }
            SupervisorEvent::RecoveryFailed { server_id, reason } => {
                error!(server = %server_id, %reason, "recovery failed")
            }
            SupervisorEvent::Stopped { server_id } => {
                info!(server = %server_id, "supervisor stopped")
            }
        }
    }

    /// Full stop/start cycle after a critical failure.
    async fn restart(&mut self) -> anyhow::Result<()> {
        warn!("performing full restart");
        self.stop().await;

        // Fresh shutdown channel: the old one is latched.
        let (shutdown_tx, _) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;
        self.supervisors.clear();

        self.start().await
    }

    /// Parallel supervisor teardown, then reap the coordinator tasks.
    pub async fn stop(&mut self) {
        info!("stopping all supervisors");
        let _ = self.shutdown_tx.send(true);

        let mut stops = JoinSet::new();
        for supervisor in self.supervisors.drain(..) {
            stops.spawn(async move { supervisor.stop().await });
        }
        while stops.join_next().await.is_some() {}

        for task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("coordinator task did not stop in time");
            }
        }
        info!("coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> AppConfig {
        AppConfig::parse_str(toml).unwrap()
    }

    #[tokio::test]
    async fn coordinator_builds_from_valid_config() {
        let temp = tempfile::TempDir::new().unwrap();
        let toml = format!(
            r#"
            [[server]]
            id = "main-server"
            address = "play.example.com"
            port = 19132
            host_name = "H"
            world_name = "W"
            accounts = ["a@x.test"]

            [auth]
            token_path = "{}"
        "#,
            temp.path().join("auth").display()
        );
        let coordinator = RootCoordinator::new(config(&toml)).await.unwrap();
        assert_eq!(coordinator.supervisors.len(), 0);
        assert_eq!(coordinator.config.servers.len(), 1);
    }

    #[tokio::test]
    async fn run_without_start_is_an_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let toml = format!(
            r#"
            [[server]]
            id = "s1"
            address = "play.example.com"
            port = 19132
            host_name = "H"
            world_name = "W"
            accounts = ["a@x.test"]

            [auth]
            token_path = "{}"
        "#,
            temp.path().join("auth").display()
        );
        let mut coordinator = RootCoordinator::new(config(&toml)).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(coordinator.run(rx).await.is_err());
    }

    #[tokio::test]
    async fn stop_with_no_supervisors_completes() {
        let temp = tempfile::TempDir::new().unwrap();
        let toml = format!(
            r#"
            [[server]]
            id = "s1"
            address = "play.example.com"
            port = 19132
            host_name = "H"
            world_name = "W"
            accounts = ["a@x.test"]

            [auth]
            token_path = "{}"
        "#,
            temp.path().join("auth").display()
        );
        let mut coordinator = RootCoordinator::new(config(&toml)).await.unwrap();
        coordinator.stop().await;
    }
}
