//! Per-server composition: auth pipeline, friendship graph, and session
//! controller for one configured game server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use fc_auth::{AuthPipeline, Identity, TokenStore, UserCodePresenter};
use fc_live::{
    spawn_heartbeat, spawn_poll_task, FriendEvent, FriendGraph, HealthSample, LiveIdentity,
    SessionController, SessionEvent,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AppConfig, ServerConfig};
use crate::events::SupervisorEvent;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("no identities authenticated for server '{0}'")]
    NoIdentities(String),

    #[error("auth error: {0}")]
    Auth(#[from] fc_auth::AuthError),

    #[error("session error: {0}")]
    Live(#[from] fc_live::LiveError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Created,
    Initializing,
    Running,
    Failed,
    Stopped,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Snapshot for the periodic stats report.
#[derive(Debug, Clone)]
pub struct SupervisorStats {
    pub server_id: String,
    pub state: &'static str,
    pub identity_count: usize,
    pub established_edges: usize,
    pub session_state: &'static str,
    pub session_name: Option<String>,
}

pub struct ServerSupervisor {
    server: ServerConfig,
    pipeline: AuthPipeline,
    identities: RwLock<Vec<Identity>>,
    live_identities: Arc<RwLock<Vec<LiveIdentity>>>,
    friends: Arc<FriendGraph>,
    session: Arc<Mutex<SessionController>>,
    state: RwLock<SupervisorState>,
    recovering: AtomicBool,
    last_activity: RwLock<Instant>,
    max_inactivity: Duration,
    auto_recover: bool,
    heartbeat_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    pending_rx: StdMutex<
        Option<(
            mpsc::UnboundedReceiver<SessionEvent>,
            mpsc::UnboundedReceiver<FriendEvent>,
        )>,
    >,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ServerSupervisor {
    pub fn new(
        server: ServerConfig,
        config: &AppConfig,
        store: Arc<dyn TokenStore>,
        presenter: Arc<dyn UserCodePresenter>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Result<Arc<Self>, SupervisorError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (friend_tx, friend_rx) = mpsc::unbounded_channel();

        let pipeline = AuthPipeline::new(store, presenter, config.pipeline_options())?;
        let live_identities = Arc::new(RwLock::new(Vec::new()));
        let session_tuning = config.session_tuning();
        let heartbeat_interval = session_tuning.heartbeat_interval;

        let session = SessionController::new(
            server.advert(),
            Arc::clone(&live_identities),
            session_tuning,
            session_tx,
            shutdown_rx,
        )?;
        let friends = FriendGraph::new(
            Arc::clone(&live_identities),
            config.friend_tuning(),
            friend_tx,
        )?;

        Ok(Arc::new(Self {
            server,
            pipeline,
            identities: RwLock::new(Vec::new()),
            live_identities,
            friends: Arc::new(friends),
            session: Arc::new(Mutex::new(session)),
            state: RwLock::new(SupervisorState::Created),
            recovering: AtomicBool::new(false),
            last_activity: RwLock::new(Instant::now()),
            max_inactivity: Duration::from_secs(config.monitoring.max_inactivity_secs),
            auto_recover: config.session.auto_recover,
            heartbeat_interval,
            shutdown_tx,
            tasks: StdMutex::new(Vec::new()),
            pending_rx: StdMutex::new(Some((session_rx, friend_rx))),
            events,
        }))
    }

    pub fn server_id(&self) -> &str {
        &self.server.id
    }

    fn set_state(&self, state: SupervisorState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = state;
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(SupervisorState::Failed)
    }

    fn touch_activity(&self) {
        if let Ok(mut guard) = self.last_activity.write() {
            *guard = Instant::now();
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    /// Auth -> friendship graph -> session, strictly in that order.
    /// Heartbeats and pollers only start once the session is up.
    #[instrument(skip(self), fields(server = %self.server.id))]
    pub async fn initialize(self: &Arc<Self>) -> Result<(), SupervisorError> {
        self.set_state(SupervisorState::Initializing);
        self.touch_activity();

        let count = self.authenticate_identities().await?;
        info!(identities = count, "authentication complete");

        self.friends.establish_all().await;
        self.touch_activity();

        {
            let mut session = self.session.lock().await;
            if let Err(e) = session.create().await {
                warn!("initial session create failed: {e}");
                session.attempt_reconnect().await?;
            }
        }
        self.touch_activity();

        self.spawn_background_tasks();

        self.set_state(SupervisorState::Running);
        self.emit(SupervisorEvent::Initialized {
            server_id: self.server.id.clone(),
            identity_count: count,
        });
        Ok(())
    }

    /// Sequential device-code authentication in configuration order. A
    /// permanently failed account is skipped; the supervisor only fails
    /// when nobody authenticated.
    async fn authenticate_identities(&self) -> Result<usize, SupervisorError> {
        let results = self.pipeline.authenticate_all(&self.server.accounts).await;
        let mut identities = Vec::new();
        for (email, result) in results {
            match result {
                Ok(identity) => identities.push(identity),
                Err(e) => error!(account = %email, "identity unavailable: {e}"),
            }
        }
        if identities.is_empty() {
            self.set_state(SupervisorState::Failed);
            return Err(SupervisorError::NoIdentities(self.server.id.clone()));
        }

        let count = identities.len();
        self.replace_identities(identities);
        Ok(count)
    }

    fn replace_identities(&self, identities: Vec<Identity>) {
        let handles: Vec<LiveIdentity> = identities
            .iter()
            .map(|id| LiveIdentity {
                xuid: id.xuid.clone(),
                authorization: id.authorization_header(),
            })
            .collect();
        if let Ok(mut guard) = self.identities.write() {
            *guard = identities;
        }
        if let Ok(mut guard) = self.live_identities.write() {
            *guard = handles;
        }
    }

    /// Atomically swap one re-authenticated identity into both registries.
    fn swap_identity(&self, fresh: Identity) {
        let Ok(mut identities) = self.identities.write() else {
            return;
        };
        let Ok(mut handles) = self.live_identities.write() else {
            return;
        };
        if let Some(slot) = identities.iter_mut().find(|i| i.email == fresh.email) {
            if let Some(handle) = handles.iter_mut().find(|h| h.xuid == slot.xuid) {
                handle.xuid = fresh.xuid.clone();
                handle.authorization = fresh.authorization_header();
            }
            *slot = fresh;
        }
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("task list lock");

        tasks.push(spawn_heartbeat(
            Arc::clone(&self.session),
            self.heartbeat_interval,
            self.shutdown_tx.subscribe(),
        ));
        tasks.push(spawn_poll_task(
            Arc::clone(&self.friends),
            self.shutdown_tx.subscribe(),
        ));
        if let Some((session_rx, friend_rx)) = self
            .pending_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
        {
            tasks.push(self.spawn_event_forwarder(session_rx, friend_rx));
        }
        for email in self.server.accounts.clone() {
            tasks.push(self.spawn_refresh_task(email));
        }
    }

    /// Converts subsystem events into supervisor events and keeps the
    /// activity clock ticking while the subsystems are alive.
    fn spawn_event_forwarder(
        self: &Arc<Self>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut friend_rx: mpsc::UnboundedReceiver<FriendEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let mut shutdown = supervisor.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = session_rx.recv() => {
                        supervisor.touch_activity();
                        match event {
                            SessionEvent::Created { session_name } => {
                                supervisor.emit(SupervisorEvent::SessionCreated {
                                    server_id: supervisor.server.id.clone(),
                                    session_name,
                                });
                            }
                            SessionEvent::Error(reason) => {
                                supervisor.emit(SupervisorEvent::SessionError {
                                    server_id: supervisor.server.id.clone(),
                                    reason,
                                });
                            }
                            _ => {}
                        }
                    }
                    Some(event) = friend_rx.recv() => {
                        supervisor.touch_activity();
                        if let FriendEvent::FriendshipEstablished { from, to } = event {
                            debug!(server = %supervisor.server.id, %from, %to, "friendship established");
                        }
                    }
                    _ = shutdown.changed() => return,
                    else => return,
                }
            }
        })
    }

    /// Proactive token refresh: re-run the pipeline an hour before each
    /// identity expires and swap the result into the registry.
    fn spawn_refresh_task(self: &Arc<Self>, email: String) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let mut shutdown = supervisor.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let deadline = supervisor
                    .identities
                    .read()
                    .ok()
                    .and_then(|ids| {
                        ids.iter()
                            .find(|i| i.email == email)
                            .map(|i| i.refresh_deadline())
                    });
                let Some(deadline) = deadline else {
                    // Identity never authenticated; nothing to keep fresh.
                    return;
                };
                let wait = (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(3600));

                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = shutdown.changed() => return,
                }

                match supervisor.pipeline.authenticate(&email).await {
                    Ok(fresh) => {
                        info!(account = %email, expires = %fresh.not_after, "token refreshed");
                        supervisor.swap_identity(fresh);
                        supervisor.touch_activity();
                    }
                    Err(e) if e.is_permanent() => {
                        error!(account = %email, "refresh failed permanently: {e}");
                        return;
                    }
                    Err(e) => {
                        // The stale deadline floors at now + 1 h, so the
                        // next pass naturally retries in an hour.
                        warn!(account = %email, "token refresh failed: {e}");
                    }
                }
            }
        })
    }

    /// Full recovery: refresh tokens, rebuild the friendship graph, then
    /// recreate the session. Re-entrant calls while one recovery is in
    /// flight are no-ops.
    #[instrument(skip(self), fields(server = %self.server.id))]
    pub async fn recover(self: &Arc<Self>) {
        if self.recovering.swap(true, Ordering::SeqCst) {
            debug!("recovery already in progress");
            return;
        }

        info!("starting recovery");
        let result = self.recover_inner().await;
        self.recovering.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.set_state(SupervisorState::Running);
                self.touch_activity();
                info!("recovery complete");
            }
            Err(e) => {
                self.set_state(SupervisorState::Failed);
                error!("recovery failed: {e}");
                self.emit(SupervisorEvent::RecoveryFailed {
                    server_id: self.server.id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Stop session -> refresh tokens -> refresh friendships -> create.
    /// The session lock is released while the slow auth and graph work
    /// runs so health probes are not starved.
    async fn recover_inner(&self) -> Result<(), SupervisorError> {
        self.session.lock().await.stop().await;

        self.authenticate_identities().await?;
        self.friends.refresh().await;

        self.session.lock().await.create().await?;
        Ok(())
    }

    /// Unhealthy when not running, when nothing has happened for too long,
    /// or when any owned subsystem reports unhealthy (first reason wins).
    pub async fn health_check(&self) -> HealthSample {
        let state = self.state();
        if state != SupervisorState::Running {
            return HealthSample::unhealthy(format!("supervisor {}", state.as_str()));
        }

        let idle = self
            .last_activity
            .read()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        if idle > self.max_inactivity {
            return HealthSample::unhealthy(format!("no activity for {idle:?}"));
        }

        let expired = self.identities.read().ok().and_then(|ids| {
            ids.iter()
                .find(|i| i.is_expired())
                .map(|i| i.email.clone())
        });
        if let Some(email) = expired {
            return HealthSample::unhealthy(format!("identity {email} token expired"));
        }

        let session_sample = match self.session.try_lock() {
            Ok(session) => session.health_check(),
            // The controller is mid-create or mid-reconnect; that is not a
            // healthy steady state.
            Err(_) => HealthSample::unhealthy("session operation in progress"),
        };
        if !session_sample.healthy {
            return session_sample;
        }

        let friend_sample = self.friends.health_check();
        if !friend_sample.healthy {
            return friend_sample;
        }

        HealthSample::healthy("all subsystems healthy")
    }

    pub fn auto_recover(&self) -> bool {
        self.auto_recover
    }

    pub async fn stats(&self) -> SupervisorStats {
        let (session_state, session_name) = match self.session.try_lock() {
            Ok(session) => (
                session.state().as_str(),
                session.session_name().map(str::to_string),
            ),
            Err(_) => ("busy", None),
        };
        SupervisorStats {
            server_id: self.server.id.clone(),
            state: self.state().as_str(),
            identity_count: self
                .live_identities
                .read()
                .map(|ids| ids.len())
                .unwrap_or(0),
            established_edges: self.friends.established_count(),
            session_state,
            session_name,
        }
    }

    /// Tear down in reverse order: signal every task (cancelling pending
    /// backoff sleeps), delete the session, then reap the tasks.
    #[instrument(skip(self), fields(server = %self.server.id))]
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        self.session.lock().await.stop().await;

        let handles: Vec<_> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("background task did not stop in time");
            }
        }

        self.set_state(SupervisorState::Stopped);
        self.emit(SupervisorEvent::Stopped {
            server_id: self.server.id.clone(),
        });
        info!("supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_auth::MemoryTokenStore;

    struct SilentPresenter;

    #[async_trait::async_trait]
    impl UserCodePresenter for SilentPresenter {
        async fn present(&self, _prompt: &fc_auth::DeviceCodePrompt) {}
    }

    fn config() -> AppConfig {
        AppConfig::parse_str(
            r#"
            [[server]]
            id = "main-server"
            address = "play.example.com"
            port = 19132
            host_name = "Example Server"
            world_name = "Example World"
            accounts = ["a@x.test", "b@x.test"]
        "#,
        )
        .unwrap()
    }

    fn supervisor() -> (Arc<ServerSupervisor>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let config = config();
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = ServerSupervisor::new(
            config.servers[0].clone(),
            &config,
            Arc::new(MemoryTokenStore::new()),
            Arc::new(SilentPresenter),
            tx,
        )
        .unwrap();
        (supervisor, rx)
    }

    #[tokio::test]
    async fn uninitialized_supervisor_is_unhealthy() {
        let (supervisor, _rx) = supervisor();
        let sample = supervisor.health_check().await;
        assert!(!sample.healthy);
        assert!(sample.reason.contains("created"));
    }

    #[tokio::test]
    async fn stop_transitions_to_stopped_and_emits() {
        let (supervisor, mut rx) = supervisor();
        supervisor.stop().await;

        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        let stopped = loop {
            match rx.try_recv() {
                Ok(SupervisorEvent::Stopped { server_id }) => break server_id,
                Ok(_) => continue,
                Err(e) => panic!("no Stopped event: {e}"),
            }
        };
        assert_eq!(stopped, "main-server");
    }

    #[tokio::test]
    async fn stats_snapshot_before_initialize() {
        let (supervisor, _rx) = supervisor();
        let stats = supervisor.stats().await;
        assert_eq!(stats.server_id, "main-server");
        assert_eq!(stats.state, "created");
        assert_eq!(stats.identity_count, 0);
        assert_eq!(stats.established_edges, 0);
        assert_eq!(stats.session_state, "offline");
        assert!(stats.session_name.is_none());
    }

    #[tokio::test]
    async fn identity_swap_updates_both_registries() {
        let (supervisor, _rx) = supervisor();

        let make = |email: &str, xuid: &str, token: &str| Identity {
            email: email.to_string(),
            xuid: xuid.to_string(),
            gamertag: None,
            user_hash: "1234567890123".to_string(),
            xsts_token: token.repeat(150),
            auth_method: fc_auth::AuthMethod::DeviceCodeLive,
            issued_at: Utc::now(),
            not_after: Utc::now() + chrono::Duration::hours(8),
            title: fc_auth::AuthTitle::default(),
            derived: false,
        };

        supervisor.replace_identities(vec![
            make("a@x.test", "2535400000000001", "a"),
            make("b@x.test", "2535400000000002", "b"),
        ]);
        assert_eq!(
            supervisor.live_identities.read().unwrap()[0].xuid,
            "2535400000000001"
        );

        supervisor.swap_identity(make("a@x.test", "2535400000000001", "c"));
        let handles = supervisor.live_identities.read().unwrap();
        assert!(handles[0].authorization.contains(&"c".repeat(150)));
        assert_eq!(handles.len(), 2);
    }
}
