//! Rate-limited friendship graph builder.
//!
//! Xbox Live follows are directed; consoles treat a bidirectional follow
//! pair as friendship. For every ordered pair of bot identities we ensure
//! the forward edge exists; the reverse pair is its own edge and is
//! processed independently, which together yields the complete graph.
//!
//! Edges run through a bounded worker batch (FIFO across batches, no
//! ordering within one) with a delay between batches to respect the
//! social service's soft rate limit. A failed PUT is a warning; gaps
//! surface through `health_check`, not through errors.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::errors::{LiveError, Result};
use crate::health::{HealthSample, LiveIdentity};
use crate::models::{PeopleResponse, PersonSummary, SOCIAL_CONTRACT_VERSION};

pub const SOCIAL_BASE_URL: &str = "https://social.xboxlive.com";

#[derive(Debug, Clone)]
pub struct FriendTuning {
    pub max_concurrent_requests: usize,
    pub request_delay: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for FriendTuning {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            request_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FriendEvent {
    FriendshipEstablished { from: String, to: String },
    FriendRequestAccepted { by: String, follower: String },
    EdgeFailed { from: String, to: String, reason: String },
}

/// All ordered pairs (follower, followee) over the identity list, in
/// configuration order.
pub fn ordered_pairs(identities: &[LiveIdentity]) -> Vec<(LiveIdentity, String)> {
    let mut pairs = Vec::with_capacity(identities.len().saturating_mul(identities.len()));
    for from in identities {
        for to in identities {
            if from.xuid != to.xuid {
                pairs.push((from.clone(), to.xuid.clone()));
            }
        }
    }
    pairs
}

/// A complete directed graph over `n` identities has `n * (n - 1)` edges.
pub fn expected_edges(n: usize) -> usize {
    n.saturating_mul(n.saturating_sub(1))
}

pub struct FriendGraph {
    http: Client,
    base_url: String,
    identities: Arc<RwLock<Vec<LiveIdentity>>>,
    tuning: FriendTuning,
    established: Mutex<HashSet<(String, String)>>,
    events: mpsc::UnboundedSender<FriendEvent>,
}

impl FriendGraph {
    pub fn new(
        identities: Arc<RwLock<Vec<LiveIdentity>>>,
        tuning: FriendTuning,
        events: mpsc::UnboundedSender<FriendEvent>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(tuning.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: SOCIAL_BASE_URL.to_string(),
            identities,
            tuning,
            established: Mutex::new(HashSet::new()),
            events,
        })
    }

    fn snapshot_identities(&self) -> Vec<LiveIdentity> {
        self.identities
            .read()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn established_count(&self) -> usize {
        self.established.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn record_established(&self, from: &str, to: &str) {
        if let Ok(mut set) = self.established.lock() {
            set.insert((from.to_string(), to.to_string()));
        }
        let _ = self.events.send(FriendEvent::FriendshipEstablished {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    /// Ensure every ordered pair of identities has its follow edge.
    #[instrument(skip(self))]
    pub async fn establish_all(&self) {
        let identities = self.snapshot_identities();
        let pairs = ordered_pairs(&identities);
        if pairs.is_empty() {
            return;
        }
        debug!(edges = pairs.len(), "establishing friendship graph");

        let batch_size = self.tuning.max_concurrent_requests.max(1);
        let batches: Vec<_> = pairs.chunks(batch_size).collect();
        let batch_count = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let mut workers = JoinSet::new();
            for (from, to) in batch.iter().cloned() {
                let http = self.http.clone();
                let url = self.person_url(&to);
                workers.spawn(async move {
                    let result = ensure_edge(&http, &url, &from.authorization).await;
                    (from.xuid, to, result)
                });
            }

            while let Some(joined) = workers.join_next().await {
                let Ok((from, to, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(()) => self.record_established(&from, &to),
                    Err(e) => {
                        warn!(from = %from, to = %to, "friendship edge failed: {e}");
                        let _ = self.events.send(FriendEvent::EdgeFailed {
                            from,
                            to,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            if index + 1 < batch_count {
                sleep(self.tuning.request_delay).await;
            }
        }
    }

    /// Drop cached edge state and rebuild the whole graph.
    pub async fn refresh(&self) {
        if let Ok(mut set) = self.established.lock() {
            set.clear();
        }
        self.establish_all().await;
    }

    /// Follow back anyone following one of our identities who is not yet
    /// followed. Runs periodically so invites from real players holding a
    /// bot account in their Friends tab resolve into friendships.
    #[instrument(skip(self))]
    pub async fn poll_incoming(&self) {
        let identities = self.snapshot_identities();
        for identity in identities {
            let followers = match self.list_followers(&identity).await {
                Ok(followers) => followers,
                Err(e) => {
                    warn!(xuid = %identity.xuid, "failed to list followers: {e}");
                    continue;
                }
            };

            for follower in followers {
                let Some(follower_xuid) = follower.xuid else {
                    continue;
                };
                if follower.is_followed_by_caller || !follower.is_following_caller {
                    continue;
                }
                let url = self.person_url(&follower_xuid);
                match put_follow(&self.http, &url, &identity.authorization).await {
                    Ok(()) => {
                        debug!(by = %identity.xuid, follower = %follower_xuid, "accepted follow");
                        let _ = self.events.send(FriendEvent::FriendRequestAccepted {
                            by: identity.xuid.clone(),
                            follower: follower_xuid,
                        });
                    }
                    Err(e) => {
                        warn!(by = %identity.xuid, follower = %follower_xuid, "follow-back failed: {e}")
                    }
                }
            }

            sleep(self.tuning.request_delay).await;
        }
    }

    /// Healthy while at least half of the expected edges are established.
    pub fn health_check(&self) -> HealthSample {
        let n = self.snapshot_identities().len();
        let expected = expected_edges(n);
        if expected == 0 {
            return HealthSample::healthy("no edges expected");
        }
        let established = self.established_count();
        if established * 2 >= expected {
            HealthSample::healthy(format!("{established}/{expected} edges established"))
        } else {
            HealthSample::unhealthy(format!(
                "only {established}/{expected} edges established"
            ))
        }
    }

    fn person_url(&self, xuid: &str) -> String {
        format!("{}/users/me/people/xuid({})", self.base_url, xuid)
    }

    async fn list_followers(&self, identity: &LiveIdentity) -> Result<Vec<PersonSummary>> {
        let response = self
            .http
            .get(format!("{}/users/me/people?view=Followers", self.base_url))
            .header("Authorization", &identity.authorization)
            .header("x-xbl-contract-version", SOCIAL_CONTRACT_VERSION)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LiveError::from_response(response).await);
        }
        let people: PeopleResponse = response.json().await?;
        Ok(people.people)
    }
}

/// Check-then-put for one edge: a GET first so an existing follow is
/// recorded without burning a PUT against the rate limit.
async fn ensure_edge(http: &Client, url: &str, authorization: &str) -> Result<()> {
    let response = http
        .get(url)
        .header("Authorization", authorization)
        .header("x-xbl-contract-version", SOCIAL_CONTRACT_VERSION)
        .send()
        .await?;

    if response.status().is_success() {
        let person: PersonSummary = response.json().await?;
        if person.is_followed_by_caller {
            return Ok(());
        }
    } else if response.status() != reqwest::StatusCode::NOT_FOUND {
        return Err(LiveError::from_response(response).await);
    }

    put_follow(http, url, authorization).await
}

async fn put_follow(http: &Client, url: &str, authorization: &str) -> Result<()> {
    let response = http
        .put(url)
        .header("Authorization", authorization)
        .header("x-xbl-contract-version", SOCIAL_CONTRACT_VERSION)
        .header("Content-Length", "0")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(LiveError::from_response(response).await);
    }
    Ok(())
}

/// Periodic incoming-request reaper.
pub fn spawn_poll_task(
    graph: Arc<FriendGraph>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(graph.tuning.poll_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => graph.poll_incoming().await,
                _ = shutdown.changed() => {
                    debug!("friend poll task shutting down");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(xuid: &str) -> LiveIdentity {
        LiveIdentity {
            xuid: xuid.to_string(),
            authorization: format!("XBL3.0 x=hash;token-{xuid}"),
        }
    }

    fn graph(identities: Vec<LiveIdentity>) -> (FriendGraph, mpsc::UnboundedReceiver<FriendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let graph = FriendGraph::new(
            Arc::new(RwLock::new(identities)),
            FriendTuning::default(),
            tx,
        )
        .unwrap();
        (graph, rx)
    }

    #[test]
    fn ordered_pairs_cover_both_directions() {
        let ids = vec![identity("1"), identity("2"), identity("3")];
        let pairs = ordered_pairs(&ids);
        assert_eq!(pairs.len(), 6);

        let edges: Vec<(String, String)> =
            pairs.iter().map(|(f, t)| (f.xuid.clone(), t.clone())).collect();
        assert!(edges.contains(&("1".to_string(), "2".to_string())));
        assert!(edges.contains(&("2".to_string(), "1".to_string())));
        // Configuration order: identity 1's edges come first.
        assert_eq!(edges[0], ("1".to_string(), "2".to_string()));
        assert_eq!(edges[1], ("1".to_string(), "3".to_string()));
    }

    #[test]
    fn expected_edges_is_n_times_n_minus_one() {
        assert_eq!(expected_edges(0), 0);
        assert_eq!(expected_edges(1), 0);
        assert_eq!(expected_edges(2), 2);
        assert_eq!(expected_edges(5), 20);
    }

    #[test]
    fn health_is_trivially_good_with_fewer_than_two_identities() {
        let (graph, _rx) = graph(vec![identity("1")]);
        assert!(graph.health_check().healthy);
    }

    #[test]
    fn health_tracks_the_fifty_percent_line() {
        let (graph, _rx) = graph(vec![identity("1"), identity("2")]);

        // 0 of 2 edges.
        assert!(!graph.health_check().healthy);

        // 1 of 2 edges: exactly 50%, healthy.
        graph.record_established("1", "2");
        assert!(graph.health_check().healthy);

        // 2 of 2 edges.
        graph.record_established("2", "1");
        assert!(graph.health_check().healthy);
        assert_eq!(graph.established_count(), 2);
    }

    #[tokio::test]
    async fn established_events_are_emitted_per_edge() {
        let (graph, mut rx) = graph(vec![identity("1"), identity("2")]);
        graph.record_established("1", "2");

        assert_eq!(
            rx.try_recv().unwrap(),
            FriendEvent::FriendshipEstablished {
                from: "1".to_string(),
                to: "2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn refresh_clears_recorded_edges() {
        let (graph, _rx) = graph(Vec::new());
        graph.record_established("1", "2");
        assert_eq!(graph.established_count(), 1);

        // No identities, so refresh only clears.
        graph.refresh().await;
        assert_eq!(graph.established_count(), 0);
    }
}
