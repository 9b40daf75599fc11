//! The MPSD session controller: owns the one session record per game
//! server and keeps it alive.
//!
//! ```text
//!     Offline --create--> Registered --join--> Active --heartbeat--+
//!        ^                    |                   |                |
//!        |                    | failure           | error          |
//!        |                    v                   v                |
//!        +------ stop --- Reconnecting <-------- (retry) <---------+
//!                             |
//!                             | attempts exceeded
//!                             v
//!                           Failed
//! ```
//!
//! All controller actions are serialized: the supervisor holds the
//! controller behind a mutex and the heartbeat task locks it per tick, so
//! create, heartbeat, stop, and reconnect runs never overlap.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::document::{build_custom_properties, build_member, build_session_document, session_name, ServerAdvert};
use crate::errors::{LiveError, Result};
use crate::health::{HealthSample, LiveIdentity};
use crate::models::{
    CustomOnlyProperties, SessionPropertiesUpdate, MPSD_CONTRACT_VERSION, SERVICE_CONFIG_ID,
    SESSION_TEMPLATE,
};

pub const MPSD_BASE_URL: &str = "https://sessiondirectory.xboxlive.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Registered,
    Active,
    Reconnecting,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Registered => "registered",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Notifications out of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { session_name: String },
    MemberJoined { xuid: String },
    HeartbeatCompleted,
    Reconnecting { attempt: u32 },
    Error(String),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub auto_reconnect: bool,
    pub request_timeout: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            auto_reconnect: true,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Backoff before reconnect attempt `attempt` (one-based):
/// `base * 2^(attempt-1)`, capped.
pub fn reconnect_delay_for(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    exp.min(cap)
}

pub struct SessionController {
    http: Client,
    base_url: String,
    advert: ServerAdvert,
    tuning: SessionTuning,
    /// Live registry shared with the supervisor; re-authenticated
    /// identities land here and are picked up at the next create.
    identities: Arc<RwLock<Vec<LiveIdentity>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Receiver<bool>,

    state: SessionState,
    session_name: Option<String>,
    /// Member snapshot frozen at the create moment.
    members: Vec<LiveIdentity>,
    raknet_guid: String,
    last_heartbeat: Option<Instant>,
    attempts: u32,
    running: bool,
}

impl SessionController {
    pub fn new(
        advert: ServerAdvert,
        identities: Arc<RwLock<Vec<LiveIdentity>>>,
        tuning: SessionTuning,
        events: mpsc::UnboundedSender<SessionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(tuning.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: MPSD_BASE_URL.to_string(),
            advert,
            tuning,
            identities,
            events,
            shutdown,
            state: SessionState::Offline,
            session_name: None,
            members: Vec::new(),
            raknet_guid: Uuid::new_v4().to_string(),
            last_heartbeat: None,
            attempts: 0,
            running: true,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    fn session_url(&self, name: &str) -> String {
        format!(
            "{}/serviceconfigs/{}/sessionTemplates/{}/sessions/{}",
            self.base_url, SERVICE_CONFIG_ID, SESSION_TEMPLATE, name
        )
    }

    fn snapshot_identities(&self) -> Vec<LiveIdentity> {
        self.identities
            .read()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Create the session and join every non-host identity. Idempotent: an
    /// Active session is torn down and recreated under a fresh name, and a
    /// stopped controller resumes (recovery stops first, then recreates).
    /// Only the supervisor's shutdown signal is terminal.
    #[instrument(skip(self), fields(server = %self.advert.id))]
    pub async fn create(&mut self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(LiveError::NotRunning);
        }
        self.running = true;
        // Any leftover record (active or from a failed run) is torn down
        // before a fresh name is registered.
        if self.session_name.is_some() {
            self.teardown_session().await;
        }

        let members = self.snapshot_identities();
        let host = members.first().cloned().ok_or(LiveError::NoIdentities)?;

        let name = session_name(&self.advert.id);
        self.raknet_guid = Uuid::new_v4().to_string();
        let document = build_session_document(
            &self.advert,
            &host.xuid,
            members.len() as u32,
            &self.raknet_guid,
        );

        debug!(session = %name, host = %host.xuid, "creating MPSD session");
        let response = self
            .http
            .put(self.session_url(&name))
            .header("Authorization", &host.authorization)
            .header("Content-Type", "application/json")
            .header("x-xbl-contract-version", MPSD_CONTRACT_VERSION)
            .json(&document)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LiveError::from_response(response).await);
        }

        self.state = SessionState::Registered;
        self.session_name = Some(name.clone());
        self.members = members;

        self.join_members(&name).await;

        self.state = SessionState::Active;
        self.last_heartbeat = Some(Instant::now());
        self.attempts = 0;
        info!(session = %name, members = self.members.len(), "session active");
        self.emit(SessionEvent::Created { session_name: name });
        Ok(())
    }

    /// PUT the `members.me` document for every non-host identity, each
    /// under its own authorization. Join failures degrade the member list
    /// but do not fail the create.
    async fn join_members(&mut self, name: &str) {
        let url = self.session_url(name);
        for member in self.members.iter().skip(1) {
            let document = build_member(&member.xuid);
            let result = self
                .http
                .put(&url)
                .header("Authorization", &member.authorization)
                .header("Content-Type", "application/json")
                .header("x-xbl-contract-version", MPSD_CONTRACT_VERSION)
                .json(&document)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(xuid = %member.xuid, "member joined session");
                    self.emit(SessionEvent::MemberJoined {
                        xuid: member.xuid.clone(),
                    });
                }
                Ok(response) => {
                    warn!(
                        xuid = %member.xuid,
                        status = %response.status(),
                        "member failed to join session"
                    );
                }
                Err(e) => warn!(xuid = %member.xuid, "member join request failed: {e}"),
            }
        }
    }

    /// Replace `properties.custom` with a freshly computed block so the
    /// session stays visible and `MemberCount`/`lastUpdate` stay current.
    #[instrument(skip(self), fields(server = %self.advert.id))]
    pub async fn heartbeat(&mut self) -> Result<()> {
        if self.state != SessionState::Active {
            return Ok(());
        }
        let name = self.session_name.clone().ok_or(LiveError::NotRunning)?;
        let host = self.members.first().cloned().ok_or(LiveError::NoIdentities)?;

        let active_count = self.snapshot_identities().len().max(self.members.len());
        let update = SessionPropertiesUpdate {
            properties: CustomOnlyProperties {
                custom: build_custom_properties(
                    &self.advert,
                    &host.xuid,
                    active_count as u32,
                    &self.raknet_guid,
                ),
            },
        };

        let response = self
            .http
            .put(self.session_url(&name))
            .header("Authorization", &host.authorization)
            .header("Content-Type", "application/json")
            .header("x-xbl-contract-version", MPSD_CONTRACT_VERSION)
            .json(&update)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LiveError::from_response(response).await);
        }

        self.last_heartbeat = Some(Instant::now());
        debug!(session = %name, "heartbeat ok");
        self.emit(SessionEvent::HeartbeatCompleted);
        Ok(())
    }

    /// One heartbeat tick, including the recovery ladder on failure.
    /// Called from the heartbeat task with the controller lock held.
    pub async fn tick(&mut self) {
        if !self.running || self.state == SessionState::Failed {
            return;
        }
        if let Err(e) = self.heartbeat().await {
            warn!(server = %self.advert.id, "heartbeat failed: {e}");
            if self.tuning.auto_reconnect {
                let _ = self.attempt_reconnect().await;
            }
        }
    }

    /// Bounded reconnect ladder. Each pass tears the old record down,
    /// sleeps the exponential delay (cancellable), and re-creates. After
    /// `max_reconnect_attempts` the controller parks in Failed and emits
    /// the terminal error exactly once.
    pub async fn attempt_reconnect(&mut self) -> Result<()> {
        loop {
            if !self.running || *self.shutdown.borrow() {
                return Err(LiveError::NotRunning);
            }
            if self.attempts >= self.tuning.max_reconnect_attempts {
                if self.state != SessionState::Failed {
                    self.state = SessionState::Failed;
                    self.emit(SessionEvent::Error(
                        "max reconnect attempts exceeded".to_string(),
                    ));
                }
                return Err(LiveError::ReconnectExhausted);
            }

            self.attempts += 1;
            self.state = SessionState::Reconnecting;
            self.emit(SessionEvent::Reconnecting {
                attempt: self.attempts,
            });
            self.teardown_session().await;

            let delay = reconnect_delay_for(
                self.attempts,
                self.tuning.reconnect_delay,
                self.tuning.max_reconnect_delay,
            );
            info!(
                server = %self.advert.id,
                attempt = self.attempts,
                ?delay,
                "reconnecting after delay"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.changed() => return Err(LiveError::NotRunning),
            }

            match self.create().await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(server = %self.advert.id, "reconnect create failed: {e}"),
            }
        }
    }

    /// Unhealthy when not Active or when the last heartbeat is older than
    /// twice the heartbeat interval.
    pub fn health_check(&self) -> HealthSample {
        if self.state != SessionState::Active {
            return HealthSample::unhealthy(format!("session {}", self.state.as_str()));
        }
        match self.last_heartbeat {
            Some(at) if at.elapsed() <= self.tuning.heartbeat_interval * 2 => {
                HealthSample::healthy("session active")
            }
            Some(at) => HealthSample::unhealthy(format!(
                "last heartbeat {:?} ago",
                at.elapsed()
            )),
            None => HealthSample::unhealthy("no heartbeat recorded"),
        }
    }

    /// Best-effort delete, then park Offline. Clearing `running` cancels
    /// any pending reconnect ladder and silences heartbeat ticks; mid-sleep
    /// backoffs are cut by the shutdown channel the supervisor flips first.
    /// A later `create` resumes the controller.
    #[instrument(skip(self), fields(server = %self.advert.id))]
    pub async fn stop(&mut self) {
        self.running = false;
        self.teardown_session().await;
        self.state = SessionState::Offline;
        self.last_heartbeat = None;
        self.emit(SessionEvent::Stopped);
    }

    async fn teardown_session(&mut self) {
        let Some(name) = self.session_name.take() else {
            return;
        };
        let Some(host) = self.members.first() else {
            return;
        };
        let result = self
            .http
            .delete(self.session_url(&name))
            .header("Authorization", &host.authorization)
            .header("x-xbl-contract-version", MPSD_CONTRACT_VERSION)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(session = %name, "session deleted")
            }
            Ok(response) => warn!(
                session = %name,
                status = %response.status(),
                "session delete rejected"
            ),
            Err(e) => warn!(session = %name, "session delete failed: {e}"),
        }
    }
}

/// Heartbeat task: ticks the controller on a fixed interval until shutdown.
/// A controller parked in Failed skips its ticks but the task stays alive,
/// so a later recovery resumes heartbeats without respawning anything.
pub fn spawn_heartbeat(
    controller: Arc<Mutex<SessionController>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    controller.lock().await.tick().await;
                }
                _ = shutdown.changed() => {
                    debug!("heartbeat task shutting down");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert() -> ServerAdvert {
        ServerAdvert {
            id: "main-server".to_string(),
            address: "play.example.com".to_string(),
            port: 19132,
            host_name: "Example".to_string(),
            world_name: "World".to_string(),
            version: "1.21.0".to_string(),
            protocol: 686,
            max_players: 40,
        }
    }

    fn controller(
        identities: Vec<LiveIdentity>,
        tuning: SessionTuning,
    ) -> (
        SessionController,
        mpsc::UnboundedReceiver<SessionEvent>,
        watch::Sender<bool>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = SessionController::new(
            advert(),
            Arc::new(RwLock::new(identities)),
            tuning,
            event_tx,
            shutdown_rx,
        )
        .unwrap();
        (controller, event_rx, shutdown_tx)
    }

    #[test]
    fn reconnect_delays_double_and_cap() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(60);
        assert_eq!(reconnect_delay_for(1, base, cap), Duration::from_secs(5));
        assert_eq!(reconnect_delay_for(2, base, cap), Duration::from_secs(10));
        assert_eq!(reconnect_delay_for(3, base, cap), Duration::from_secs(20));
        assert_eq!(reconnect_delay_for(4, base, cap), Duration::from_secs(40));
        assert_eq!(reconnect_delay_for(5, base, cap), Duration::from_secs(60));
        assert_eq!(reconnect_delay_for(10, base, cap), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn create_without_identities_fails_cleanly() {
        let (mut controller, _events, _shutdown) =
            controller(Vec::new(), SessionTuning::default());
        assert!(matches!(
            controller.create().await,
            Err(LiveError::NoIdentities)
        ));
        assert_eq!(controller.state(), SessionState::Offline);
        assert!(controller.session_name().is_none());
    }

    #[tokio::test]
    async fn stop_parks_offline_and_create_resumes() {
        let (mut controller, mut events, _shutdown) =
            controller(Vec::new(), SessionTuning::default());

        controller.stop().await;
        assert_eq!(controller.state(), SessionState::Offline);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Stopped);

        // Recovery stops the session and then recreates it, so create must
        // get past the running gate; with an empty registry it fails on
        // the identity snapshot instead.
        assert!(matches!(
            controller.create().await,
            Err(LiveError::NoIdentities)
        ));
        assert!(controller.running);
    }

    #[tokio::test]
    async fn shutdown_signal_blocks_create_terminally() {
        let (mut controller, _events, shutdown) =
            controller(Vec::new(), SessionTuning::default());

        shutdown.send(true).unwrap();
        controller.stop().await;
        assert!(matches!(
            controller.create().await,
            Err(LiveError::NotRunning)
        ));
        assert!(!controller.running);
    }

    #[tokio::test]
    async fn exhausted_reconnect_fails_once() {
        let tuning = SessionTuning {
            max_reconnect_attempts: 0,
            ..SessionTuning::default()
        };
        let (mut controller, mut events, _shutdown) = controller(Vec::new(), tuning);

        assert!(matches!(
            controller.attempt_reconnect().await,
            Err(LiveError::ReconnectExhausted)
        ));
        assert_eq!(controller.state(), SessionState::Failed);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Error("max reconnect attempts exceeded".to_string())
        );

        // A second trigger must not produce a second terminal error.
        assert!(matches!(
            controller.attempt_reconnect().await,
            Err(LiveError::ReconnectExhausted)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_cancels_reconnect_mid_sleep() {
        let tuning = SessionTuning {
            reconnect_delay: Duration::from_secs(3600),
            ..SessionTuning::default()
        };
        let (mut controller, _events, shutdown) = controller(Vec::new(), tuning);

        let started = Instant::now();
        shutdown.send(true).unwrap();
        let result = controller.attempt_reconnect().await;
        assert!(matches!(result, Err(LiveError::NotRunning)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn health_reflects_state_and_heartbeat_age() {
        let (mut controller, _events, _shutdown) =
            controller(Vec::new(), SessionTuning::default());

        let sample = controller.health_check();
        assert!(!sample.healthy);
        assert!(sample.reason.contains("offline"));

        controller.state = SessionState::Active;
        controller.last_heartbeat = Some(Instant::now());
        assert!(controller.health_check().healthy);

        controller.last_heartbeat = None;
        assert!(!controller.health_check().healthy);
    }

    #[test]
    fn heartbeat_age_boundary_is_twice_the_interval() {
        let tuning = SessionTuning {
            heartbeat_interval: Duration::from_secs(1),
            ..SessionTuning::default()
        };
        let (mut controller, _events, _shutdown) = controller(Vec::new(), tuning);
        controller.state = SessionState::Active;

        controller.last_heartbeat = Some(Instant::now() - Duration::from_millis(1500));
        assert!(controller.health_check().healthy);

        controller.last_heartbeat = Some(Instant::now() - Duration::from_millis(2500));
        assert!(!controller.health_check().healthy);
    }
}
