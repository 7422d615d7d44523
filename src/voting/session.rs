//! Voting Session
//!
//! One session per stripe. A control task bootstraps by racing
//! registration against the seed addresses until an active coordinator
//! accepts this voter, starts a [`PeerMonitor`] per known server, then
//! polls the owner's topology until every server is lost, at which point
//! it starts over. Election events raised by the monitors are arbitrated
//! one at a time under the session lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::arbitration::{arbitrate, RejectReason, VoteAction};
use super::status::VoterStatus;
use crate::config::{ConnectionConfig, TimingConfig, VoterConfig};
use crate::error::{Error, Result};
use crate::network::{DiagnosticsConnector, TcpConnector};
use crate::peer::{ElectionHandler, PeerClient, PeerConnection, PeerMonitor};

/// Role of the live leader of a stripe
pub const ACTIVE_COORDINATOR: &str = "ACTIVE-COORDINATOR";

/// Role of a server ready to take over
pub const PASSIVE_STANDBY: &str = "PASSIVE-STANDBY";

/// Roles a voter registers with
pub const REGISTERABLE_STATES: [&str; 2] = [ACTIVE_COORDINATOR, PASSIVE_STANDBY];

pub fn is_registerable(state: &str) -> bool {
    REGISTERABLE_STATES.contains(&state)
}

/// Creates the peer client for an address
pub type PeerFactory = Arc<dyn Fn(&str) -> Arc<dyn PeerClient> + Send + Sync>;

/// Factory for peers reached over the TCP diagnostics transport
pub fn tcp_peer_factory() -> PeerFactory {
    let connector: Arc<dyn DiagnosticsConnector> = Arc::new(TcpConnector);
    Arc::new(move |address: &str| -> Arc<dyn PeerClient> {
        Arc::new(PeerConnection::new(address, Arc::clone(&connector)))
    })
}

/// Settings shared by every session of one voter
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub voter_id: String,
    pub connection: ConnectionConfig,
    pub timing: TimingConfig,
    pub deregister_on_stop: bool,
}

impl SessionConfig {
    pub fn new(voter_id: impl Into<String>) -> Self {
        Self {
            voter_id: voter_id.into(),
            connection: ConnectionConfig::default(),
            timing: TimingConfig::default(),
            deregister_on_stop: true,
        }
    }
}

impl From<&VoterConfig> for SessionConfig {
    fn from(config: &VoterConfig) -> Self {
        Self {
            voter_id: config.voter.id.clone(),
            connection: config.connection.clone(),
            timing: config.timing.clone(),
            deregister_on_stop: config.voter.deregister_on_stop,
        }
    }
}

#[derive(Default)]
struct SessionState {
    /// The server this voter currently backs
    owner: Option<Arc<dyn PeerClient>>,
    /// Tracked stripe membership
    peers: HashMap<String, Arc<PeerMonitor>>,
    /// Addresses the next bootstrap starts from
    targets: Vec<String>,
}

/// Outcome of one topology poll pass
#[derive(Debug, Clone, Default)]
struct PollRound {
    seq: u64,
    error: Option<String>,
}

pub(crate) struct SessionShared {
    stripe: String,
    config: SessionConfig,
    factory: PeerFactory,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    poll_wakeup: Notify,
    poll_started: AtomicU64,
    polls: watch::Sender<PollRound>,
    bootstrapped: watch::Sender<Option<DateTime<Utc>>>,
    votes: broadcast::Sender<String>,
}

/// Arbitration state and background tasks for one stripe
pub struct VotingSession {
    shared: Arc<SessionShared>,
    seeds: Vec<String>,
    control: StdMutex<Option<JoinHandle<()>>>,
}

impl VotingSession {
    /// Create a session for `stripe`; nothing runs until [`start`](Self::start)
    pub fn new(
        stripe: impl Into<String>,
        seeds: Vec<String>,
        config: SessionConfig,
        factory: PeerFactory,
    ) -> Self {
        let (polls, _) = watch::channel(PollRound::default());
        let (bootstrapped, _) = watch::channel(None);
        let (votes, _) = broadcast::channel(256);

        let shared = Arc::new(SessionShared {
            stripe: stripe.into(),
            config,
            factory,
            state: Mutex::new(SessionState {
                targets: seeds.clone(),
                ..SessionState::default()
            }),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            poll_wakeup: Notify::new(),
            poll_started: AtomicU64::new(0),
            polls,
            bootstrapped,
            votes,
        });

        Self {
            shared,
            seeds,
            control: StdMutex::new(None),
        }
    }

    /// Spawn the control task. Calling it again only returns the status.
    pub fn start(&self) -> VoterStatus {
        let mut control = self
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if control.is_none() && !self.shared.cancel.is_cancelled() {
            tracing::info!(
                "Starting voting session for stripe {} with seeds {}",
                self.shared.stripe,
                self.seeds.join(",")
            );
            *control = Some(tokio::spawn(control_loop(
                Arc::clone(&self.shared),
                self.seeds.clone(),
            )));
        }
        self.status()
    }

    pub fn status(&self) -> VoterStatus {
        VoterStatus::new(Arc::clone(&self.shared))
    }

    pub fn stripe(&self) -> &str {
        &self.shared.stripe
    }

    /// Stop the control task and every heartbeat, deregistering first if configured
    pub async fn stop(&self) {
        tracing::info!("Stopping voting session for stripe {}", self.shared.stripe);

        if self.shared.config.deregister_on_stop {
            self.shared.deregister_all().await;
        }

        self.shared.cancel.cancel();
        let handle = self
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Control task for stripe {} failed: {}", self.shared.stripe, e);
            }
        }

        self.shared.reset().await;

        self.shared.tracker.close();
        let grace = self.shared.config.timing.shutdown_grace();
        if timeout(grace, self.shared.tracker.wait()).await.is_err() {
            tracing::warn!(
                "Heartbeat tasks for stripe {} still running after {:?}",
                self.shared.stripe,
                grace
            );
        }
    }

    /// Addresses of the tracked servers
    pub async fn connected_servers(&self) -> HashSet<String> {
        self.shared.state.lock().await.peers.keys().cloned().collect()
    }

    pub async fn count_connected_servers(&self) -> usize {
        self.shared.state.lock().await.peers.len()
    }

    /// Addresses the session would bootstrap from right now
    pub async fn existing_topology(&self) -> HashSet<String> {
        self.shared.state.lock().await.targets.iter().cloned().collect()
    }

    pub async fn owner_address(&self) -> Option<String> {
        self.shared.owner_address().await
    }

    /// Wake the topology poller and wait for the pass that follows
    pub async fn force_topology_update(&self) -> Result<()> {
        self.shared.force_topology_update().await
    }

    /// Addresses of peers whose election events were arbitrated
    pub fn subscribe_votes(&self) -> broadcast::Receiver<String> {
        self.shared.votes.subscribe()
    }
}

impl Drop for VotingSession {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for VotingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VotingSession")
            .field("stripe", &self.shared.stripe)
            .field("seeds", &self.seeds)
            .finish()
    }
}

/// Bootstrap, poll, reset; until cancelled
async fn control_loop(shared: Arc<SessionShared>, seeds: Vec<String>) {
    let mut targets = seeds;

    while !shared.cancel.is_cancelled() {
        shared.set_targets(&targets).await;
        let clients: Vec<Arc<dyn PeerClient>> =
            targets.iter().map(|address| (shared.factory)(address)).collect();

        tracing::info!(
            "Attempting to register with the active in stripe {}: {}",
            shared.stripe,
            targets.join(",")
        );

        match shared.register_with_active(&clients, &targets).await {
            RoundOutcome::Registered(owner) => {
                match owner.get_server_state().await {
                    Ok(state) => tracing::info!("Vote owner state: {}", state),
                    Err(e) => tracing::warn!("Vote owner {} state unknown: {}", owner.address(), e),
                }
                shared.state.lock().await.owner = Some(owner);

                join_all(clients.into_iter().map(|client| shared.add_monitor(client))).await;
                shared.bootstrapped.send_if_modified(|at| {
                    if at.is_none() {
                        *at = Some(Utc::now());
                        true
                    } else {
                        false
                    }
                });

                targets = shared.poll_topology(targets).await;
                shared.reset().await;
            }
            RoundOutcome::Restart(refreshed) => {
                if let Some(refreshed) = refreshed {
                    targets = refreshed;
                }
                for client in &clients {
                    client.close().await;
                }
            }
            RoundOutcome::Cancelled => {
                for client in &clients {
                    client.close().await;
                }
                break;
            }
        }
    }

    tracing::debug!("Control task for stripe {} stopped", shared.stripe);
}

/// Ask any connected seed for the stripe membership
async fn refresh_targets(clients: &[Arc<dyn PeerClient>]) -> Option<Vec<String>> {
    for client in clients {
        if !client.is_connected() {
            continue;
        }
        match client.get_topology().await {
            Ok(topology) if !topology.is_empty() => {
                let mut targets: Vec<String> = topology.into_iter().collect();
                targets.sort();
                return Some(targets);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::info!("Unable to fetch topology from {}: {}", client.address(), e);
            }
        }
    }
    None
}

/// How one bootstrap round ended
enum RoundOutcome {
    /// An active coordinator accepted this voter
    Registered(Arc<dyn PeerClient>),
    /// Start over, from the refreshed targets if the stripe reported new ones
    Restart(Option<Vec<String>>),
    Cancelled,
}

/// Retry registration against one seed until the round ends
async fn registration_attempt(
    shared: Arc<SessionShared>,
    client: Arc<dyn PeerClient>,
    round: CancellationToken,
    winner: mpsc::Sender<Arc<dyn PeerClient>>,
) {
    let mut ticker = interval(shared.config.timing.registration_retry());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = round.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let accepted = tokio::select! {
            _ = round.cancelled() => return,
            accepted = shared.try_register(&client) => accepted,
        };

        if accepted {
            // Only the first acceptance is taken
            let _ = winner.try_send(client);
            return;
        }
    }
}

impl SessionShared {
    async fn set_targets(&self, targets: &[String]) {
        self.state.lock().await.targets = targets.to_vec();
    }

    pub(crate) async fn owner_address(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .owner
            .as_ref()
            .map(|owner| owner.address().to_string())
    }

    pub(crate) fn stripe(&self) -> &str {
        &self.stripe
    }

    pub(crate) fn bootstrapped_at(&self) -> Option<DateTime<Utc>> {
        *self.bootstrapped.borrow()
    }

    /// Wait until the first bootstrap completed
    pub(crate) async fn wait_bootstrapped(&self) -> Result<()> {
        let mut rx = self.bootstrapped.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = rx.wait_for(|at| at.is_some()) => {
                result.map(|_| ()).map_err(|_| Error::Cancelled)
            }
        }
    }

    /// Snapshot of the tracked monitors
    pub(crate) async fn monitors(&self) -> Vec<Arc<PeerMonitor>> {
        self.state.lock().await.peers.values().cloned().collect()
    }

    /// Race registration across all seeds until an active coordinator
    /// accepts. Every `registration_round` the seeds are asked for the
    /// stripe membership: a changed membership, or no reachable seed at
    /// all, restarts the round with fresh clients.
    async fn register_with_active(
        self: &Arc<Self>,
        clients: &[Arc<dyn PeerClient>],
        targets: &[String],
    ) -> RoundOutcome {
        let round = self.cancel.child_token();
        let (tx, mut rx) = mpsc::channel(1);
        let mut attempts = JoinSet::new();

        for client in clients {
            attempts.spawn(registration_attempt(
                Arc::clone(self),
                Arc::clone(client),
                round.clone(),
                tx.clone(),
            ));
        }
        drop(tx);

        let round_limit = self.config.timing.registration_round();
        let current: HashSet<&str> = targets.iter().map(String::as_str).collect();
        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break RoundOutcome::Cancelled,
                winner = rx.recv() => match winner {
                    Some(owner) => break RoundOutcome::Registered(owner),
                    None => break RoundOutcome::Cancelled,
                },
                _ = sleep(round_limit) => {
                    let refreshed = refresh_targets(clients).await;
                    if let Ok(owner) = rx.try_recv() {
                        break RoundOutcome::Registered(owner);
                    }
                    match refreshed {
                        Some(refreshed)
                            if refreshed.iter().map(String::as_str).collect::<HashSet<_>>() != current =>
                        {
                            tracing::info!(
                                "Stripe {} reports members {}, restarting registration",
                                self.stripe,
                                refreshed.join(",")
                            );
                            break RoundOutcome::Restart(Some(refreshed));
                        }
                        _ if !clients.iter().any(|client| client.is_connected()) => {
                            tracing::warn!(
                                "No server in stripe {} reachable within {:?}",
                                self.stripe,
                                round_limit
                            );
                            break RoundOutcome::Restart(None);
                        }
                        _ => {
                            tracing::info!(
                                "Still waiting for an active server in stripe {} to accept registration",
                                self.stripe
                            );
                        }
                    }
                }
            }
        };

        round.cancel();
        attempts.shutdown().await;
        outcome
    }

    /// One registration attempt against one seed
    async fn try_register(&self, client: &Arc<dyn PeerClient>) -> bool {
        let address = client.address();

        if !client.is_connected() {
            if let Err(e) = client.connect(&self.config.connection).await {
                tracing::warn!("Unable to connect to {}: {}", address, e);
                return false;
            }
        }

        let outcome: Result<bool> = async {
            let state = client.get_server_state().await?;
            if state != ACTIVE_COORDINATOR {
                tracing::info!(
                    "State of {}: {}. Continuing the search for an active server.",
                    address,
                    state
                );
                return Ok(false);
            }
            if client.register(&self.config.voter_id).await? {
                return Ok(true);
            }
            log_refused_registration(client.as_ref(), &state).await?;
            Ok(false)
        }
        .await;

        match outcome {
            Ok(accepted) => accepted,
            Err(e) if e.is_timeout() => {
                tracing::warn!(
                    "Closing connection to {} due to timeout while registering. Connection will be re-created later.",
                    address
                );
                client.close().await;
                false
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    "Closing connection to {} after a transient failure while registering: {}. Connection will be re-created later.",
                    address,
                    e
                );
                client.close().await;
                false
            }
            Err(e) => {
                tracing::error!(
                    "Closing connection to {} due to unexpected error while registering. Connection will be re-created later. Error: {}",
                    address,
                    e
                );
                client.close().await;
                false
            }
        }
    }

    fn election_handler(self: &Arc<Self>) -> ElectionHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |peer: Arc<dyn PeerClient>| -> BoxFuture<'static, ()> {
            let session = session.clone();
            Box::pin(async move {
                if let Some(session) = session.upgrade() {
                    session.handle_vote_request(peer).await;
                }
            })
        })
    }

    /// Track `client` and start heartbeating it if its role allows
    async fn add_monitor(self: &Arc<Self>, client: Arc<dyn PeerClient>) {
        let address = client.address().to_string();
        let monitor = Arc::new(PeerMonitor::new(
            Arc::clone(&client),
            self.config.voter_id.clone(),
            self.config.timing.heartbeat_interval(),
            &self.cancel,
            &self.tracker,
        ));

        let former = self
            .state
            .lock()
            .await
            .peers
            .insert(address.clone(), Arc::clone(&monitor));
        if let Some(former) = former {
            former.close().await;
        }

        let outcome: Result<()> = async {
            client.connect(&self.config.connection).await?;
            let state = client.get_server_state().await?;
            if !is_registerable(&state) {
                tracing::info!("{} is {}, not registering with it", address, state);
                monitor.close().await;
                return Ok(());
            }
            monitor.start(self.election_handler()).await
        }
        .await;

        if let Err(e) = outcome {
            tracing::info!("Unable to register with target {}: {}", address, e);
            monitor.close().await;
            let mut state = self.state.lock().await;
            if state
                .peers
                .get(&address)
                .is_some_and(|tracked| Arc::ptr_eq(tracked, &monitor))
            {
                state.peers.remove(&address);
            }
        }
    }

    /// Arbitrate one election event for `candidate`
    pub(crate) async fn handle_vote_request(&self, candidate: Arc<dyn PeerClient>) -> VoteAction {
        let address = candidate.address().to_string();
        let voter_id = &self.config.voter_id;
        let mut state = self.state.lock().await;

        let owner_snapshot = state.owner.as_ref().map(|owner| owner.snapshot());
        let candidate_is_owner = state
            .owner
            .as_ref()
            .is_some_and(|owner| owner.address() == address);
        let action = arbitrate(candidate.snapshot(), owner_snapshot, candidate_is_owner);
        tracing::debug!(
            "Election event from {} in stripe {}: {}",
            address,
            self.stripe,
            action.name()
        );

        match action {
            VoteAction::Ignore => {
                tracing::info!("Skipping vote request from {}, voting session is restarting", address);
            }
            VoteAction::Evict => {
                let tracked = state
                    .peers
                    .get(&address)
                    .is_some_and(|monitor| same_client(monitor.client(), &candidate));
                if tracked {
                    if let Some(monitor) = state.peers.remove(&address) {
                        monitor.close().await;
                    }
                    tracing::info!("Stopped tracking disconnected server {}", address);
                    if state.peers.is_empty() {
                        tracing::warn!(
                            "Lost every server in stripe {}, restarting registration",
                            self.stripe
                        );
                        state.owner = None;
                        self.poll_wakeup.notify_one();
                    }
                }
            }
            VoteAction::Defend => match candidate.vote(voter_id).await {
                Ok(result) => tracing::debug!(
                    "Voted for {} in term {}, result: {}",
                    address,
                    candidate.generation(),
                    result
                ),
                Err(e) => tracing::warn!("Vote for {} failed: {}", address, e),
            },
            VoteAction::Suppress | VoteAction::Reject(RejectReason::OwnerConnected) => {
                tracing::info!(
                    "Not the vote owner and the owner is still connected, rejecting the vote request from {} for election term {}",
                    address,
                    owner_snapshot.map(|owner| owner.generation).unwrap_or_default()
                );
                if action == VoteAction::Suppress {
                    candidate.zombie();
                }
            }
            VoteAction::Steal => {
                if let Some(former) = state.owner.clone() {
                    former.zombie();
                    match candidate.vote(voter_id).await {
                        Ok(result) => {
                            state.owner = Some(Arc::clone(&candidate));
                            tracing::info!(
                                "Stole the vote from {}, voting for {} for term: {}, result: {}",
                                former.address(),
                                address,
                                candidate.generation(),
                                result
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Failed to vote for {} after zombying {}: {}",
                                address,
                                former.address(),
                                e
                            );
                        }
                    }
                }
            }
            VoteAction::Reject(RejectReason::StaleTerm) => {
                tracing::info!(
                    "Failed to steal the vote from {}, rejecting the vote request from {} for term {}, last voted election: {}",
                    state.owner.as_ref().map(|owner| owner.address()).unwrap_or_default(),
                    address,
                    candidate.generation(),
                    owner_snapshot.map(|owner| owner.last_voted_generation).unwrap_or_default()
                );
            }
        }
        drop(state);

        let _ = self.votes.send(address);
        action
    }

    /// Poll the owner's topology until the owner is lost; returns the last targets
    async fn poll_topology(self: &Arc<Self>, mut targets: Vec<String>) -> Vec<String> {
        let fetch_interval = self.config.timing.topology_fetch_interval();

        loop {
            let owner = self.state.lock().await.owner.clone();
            let Some(owner) = owner else { break };
            if self.cancel.is_cancelled() {
                break;
            }

            let seq = self.poll_started.fetch_add(1, Ordering::SeqCst) + 1;
            match self.reconcile_topology(&owner).await {
                Ok(fetched) => {
                    // An empty view would leave nothing to bootstrap from
                    if !fetched.is_empty() {
                        targets = fetched;
                        self.set_targets(&targets).await;
                    }
                    self.polls.send_replace(PollRound { seq, error: None });
                }
                Err(e) => {
                    tracing::warn!("Topology fetch from {} failed: {}", owner.address(), e);
                    self.polls.send_replace(PollRound {
                        seq,
                        error: Some(e.to_string()),
                    });
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.poll_wakeup.notified() => {
                    tracing::debug!("Refreshing topology of stripe {}", self.stripe);
                }
                _ = sleep(fetch_interval) => {}
            }
        }

        targets
    }

    /// Align the tracked monitors with the owner's view of the stripe
    async fn reconcile_topology(self: &Arc<Self>, owner: &Arc<dyn PeerClient>) -> Result<Vec<String>> {
        let existing: HashSet<String> = self.state.lock().await.peers.keys().cloned().collect();
        let fetched = owner.get_topology().await?;
        tracing::info!("Topology is {:?}", sorted(&existing));

        // Only an active owner's view of the stripe is trusted for membership
        if owner.get_server_state().await? == ACTIVE_COORDINATOR && fetched != existing {
            tracing::info!("New topology detected {:?}", sorted(&fetched));

            let added: Vec<Arc<dyn PeerClient>> = fetched
                .difference(&existing)
                .map(|address| (self.factory)(address))
                .collect();
            join_all(added.into_iter().map(|client| self.add_monitor(client))).await;

            let mut state = self.state.lock().await;
            for address in existing.difference(&fetched) {
                if let Some(monitor) = state.peers.remove(address) {
                    tracing::info!("{} left stripe {}", address, self.stripe);
                    monitor.close().await;
                }
            }
        }

        Ok(sorted(&fetched))
    }

    async fn force_topology_update(&self) -> Result<()> {
        let wanted = self.poll_started.load(Ordering::SeqCst) + 1;
        let mut rx = self.polls.subscribe();
        self.poll_wakeup.notify_one();

        let error = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = rx.wait_for(|round| round.seq >= wanted) => {
                result.map(|round| round.error.clone()).map_err(|_| Error::Cancelled)?
            }
        };

        match error {
            Some(e) => Err(Error::Topology(e)),
            None => Ok(()),
        }
    }

    /// Drop the owner and close every monitor
    async fn reset(&self) {
        let monitors: Vec<Arc<PeerMonitor>> = {
            let mut state = self.state.lock().await;
            state.owner = None;
            state.peers.drain().map(|(_, monitor)| monitor).collect()
        };
        for monitor in monitors {
            monitor.close().await;
        }
    }

    /// Best-effort deregistration from every registered server
    async fn deregister_all(&self) {
        let clients: Vec<Arc<dyn PeerClient>> = self
            .state
            .lock()
            .await
            .peers
            .values()
            .map(|monitor| Arc::clone(monitor.client()))
            .filter(|client| client.is_connected() && client.is_registered())
            .collect();

        for client in clients {
            match client.deregister_voter(&self.config.voter_id).await {
                Ok(true) => tracing::info!("Deregistered from {}", client.address()),
                Ok(false) => tracing::warn!("{} refused deregistration", client.address()),
                Err(e) => tracing::warn!("Deregistration from {} failed: {}", client.address(), e),
            }
        }
    }
}

fn same_client(a: &Arc<dyn PeerClient>, b: &Arc<dyn PeerClient>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn sorted(addresses: &HashSet<String>) -> Vec<String> {
    let mut addresses: Vec<String> = addresses.iter().cloned().collect();
    addresses.sort();
    addresses
}

async fn log_refused_registration(client: &dyn PeerClient, state: &str) -> Result<()> {
    let mut message = format!(
        "Registration with {} in state {} failed. ",
        client.address(),
        state
    );
    let limit = client.registered_voter_limit().await?.max(0);
    if client.registered_voter_count().await? >= limit {
        message.push_str(&format!(
            "Configured voter limit ({}) has already been reached. ",
            limit
        ));
    }
    message.push_str("Retrying...");
    tracing::warn!("{}", message);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePeer, FakeStripe};
    use std::time::Duration;

    fn session(stripe: &FakeStripe) -> VotingSession {
        VotingSession::new("stripe", Vec::new(), SessionConfig::new("voter"), stripe.factory())
    }

    async fn track(session: &VotingSession, peer: &Arc<FakePeer>) {
        let client: Arc<dyn PeerClient> = peer.clone();
        let monitor = Arc::new(PeerMonitor::new(
            client,
            "voter".into(),
            Duration::from_secs(1),
            &session.shared.cancel,
            &session.shared.tracker,
        ));
        session
            .shared
            .state
            .lock()
            .await
            .peers
            .insert(peer.address().to_string(), monitor);
    }

    async fn set_owner(session: &VotingSession, peer: &Arc<FakePeer>) {
        session.shared.state.lock().await.owner = Some(peer.clone());
    }

    #[tokio::test]
    async fn test_event_without_owner_is_ignored() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        let s = session(&stripe);
        track(&s, &a).await;

        let action = s.shared.handle_vote_request(a.clone()).await;
        assert_eq!(action, VoteAction::Ignore);
        assert!(a.votes().is_empty());
    }

    #[tokio::test]
    async fn test_owner_is_defended_in_every_event() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        a.set_election(5, true);
        let s = session(&stripe);
        track(&s, &a).await;
        set_owner(&s, &a).await;

        for _ in 0..3 {
            assert_eq!(s.shared.handle_vote_request(a.clone()).await, VoteAction::Defend);
        }
        assert_eq!(a.votes(), vec![5, 5, 5]);
        assert_eq!(a.last_voted_generation(), 5);
        assert_eq!(s.owner_address().await.as_deref(), Some("a:1"));
    }

    #[tokio::test]
    async fn test_newer_term_steals_from_disconnected_owner() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        let b = stripe.insert(FakePeer::passive("b:1"));
        let s = session(&stripe);
        track(&s, &a).await;
        track(&s, &b).await;
        set_owner(&s, &a).await;

        a.set_election(5, true);
        a.set_last_voted(5);
        a.disconnect();
        b.set_election(6, true);

        let action = s.shared.handle_vote_request(b.clone()).await;
        assert_eq!(action, VoteAction::Steal);
        assert_eq!(a.zombie_count(), 1);
        assert_eq!(b.votes(), vec![6]);
        assert_eq!(s.owner_address().await.as_deref(), Some("b:1"));
    }

    #[tokio::test]
    async fn test_equal_term_is_suppressed_while_owner_votes() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        let b = stripe.insert(FakePeer::passive("b:1"));
        let s = session(&stripe);
        track(&s, &a).await;
        track(&s, &b).await;
        set_owner(&s, &a).await;

        a.set_election(5, true);
        b.set_election(5, true);

        let action = s.shared.handle_vote_request(b.clone()).await;
        assert_eq!(action, VoteAction::Suppress);
        assert_eq!(b.zombie_count(), 1);
        assert!(!b.is_voting());
        assert!(b.votes().is_empty());
        assert_eq!(s.owner_address().await.as_deref(), Some("a:1"));
    }

    #[tokio::test]
    async fn test_stale_term_cannot_steal() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        let b = stripe.insert(FakePeer::passive("b:1"));
        let s = session(&stripe);
        track(&s, &a).await;
        track(&s, &b).await;
        set_owner(&s, &a).await;

        a.set_election(5, false);
        a.set_last_voted(5);
        a.disconnect();
        b.set_election(5, true);

        let action = s.shared.handle_vote_request(b.clone()).await;
        assert_eq!(action, VoteAction::Reject(RejectReason::StaleTerm));
        assert_eq!(a.zombie_count(), 0);
        assert!(b.votes().is_empty());
        assert_eq!(s.owner_address().await.as_deref(), Some("a:1"));
    }

    #[tokio::test]
    async fn test_losing_last_peer_clears_owner() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        let s = session(&stripe);
        track(&s, &a).await;
        set_owner(&s, &a).await;

        a.disconnect();
        let action = s.shared.handle_vote_request(a.clone()).await;
        assert_eq!(action, VoteAction::Evict);
        assert_eq!(s.count_connected_servers().await, 0);
        assert!(s.owner_address().await.is_none());
    }

    #[tokio::test]
    async fn test_evicting_one_of_two_keeps_owner() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        let b = stripe.insert(FakePeer::passive("b:1"));
        let s = session(&stripe);
        track(&s, &a).await;
        track(&s, &b).await;
        set_owner(&s, &a).await;

        b.disconnect();
        assert_eq!(s.shared.handle_vote_request(b.clone()).await, VoteAction::Evict);
        assert_eq!(s.connected_servers().await, HashSet::from(["a:1".to_string()]));
        assert_eq!(s.owner_address().await.as_deref(), Some("a:1"));
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        let s = session(&stripe);
        let mut votes = s.subscribe_votes();

        s.shared.handle_vote_request(a.clone()).await;
        assert_eq!(votes.recv().await.unwrap(), "a:1");
    }

    #[tokio::test]
    async fn test_refused_registration_is_retried() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        a.set_accept_registration(false);
        a.set_voter_capacity(1, 1);
        let s = session(&stripe);

        let client: Arc<dyn PeerClient> = a.clone();
        assert!(!s.shared.try_register(&client).await);
        assert!(a.is_connected());

        a.set_accept_registration(true);
        assert!(s.shared.try_register(&client).await);
        assert_eq!(a.registration_count(), 2);
    }

    #[tokio::test]
    async fn test_passive_seed_is_not_registered_during_bootstrap() {
        let stripe = FakeStripe::new();
        let b = stripe.insert(FakePeer::passive("b:1"));
        let s = session(&stripe);

        let client: Arc<dyn PeerClient> = b.clone();
        assert!(!s.shared.try_register(&client).await);
        assert_eq!(b.registration_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_challengers_get_a_single_vote() {
        for _ in 0..50 {
            let stripe = FakeStripe::new();
            let a = stripe.insert(FakePeer::active("a:1"));
            let b = stripe.insert(FakePeer::passive("b:1"));
            let c = stripe.insert(FakePeer::passive("c:1"));
            let s = session(&stripe);
            for peer in [&a, &b, &c] {
                track(&s, peer).await;
            }
            set_owner(&s, &a).await;

            a.set_election(5, false);
            a.set_last_voted(5);
            a.disconnect();
            b.set_election(6, true);
            c.set_election(6, true);

            let first = tokio::spawn({
                let shared = Arc::clone(&s.shared);
                let b = b.clone();
                async move { shared.handle_vote_request(b).await }
            });
            let second = tokio::spawn({
                let shared = Arc::clone(&s.shared);
                let c = c.clone();
                async move { shared.handle_vote_request(c).await }
            });
            let mut actions = vec![first.await.unwrap(), second.await.unwrap()];
            actions.sort_by_key(|action| action.name());

            assert_eq!(actions, vec![VoteAction::Steal, VoteAction::Suppress]);
            assert_eq!(b.votes().len() + c.votes().len(), 1);
            let owner = s.owner_address().await.unwrap();
            let loser = if owner == "b:1" { &c } else { &b };
            assert_eq!(loser.zombie_count(), 1);
            assert!(!loser.is_voting());
        }
    }

    #[tokio::test]
    async fn test_transient_registration_failure_closes_client() {
        let stripe = FakeStripe::new();
        let a = stripe.insert(FakePeer::active("a:1"));
        a.fail_state_requests(true);
        let s = session(&stripe);

        let client: Arc<dyn PeerClient> = a.clone();
        assert!(!s.shared.try_register(&client).await);
        assert!(!a.is_connected());
        assert_eq!(a.close_count(), 1);
        assert_eq!(a.registration_count(), 0);

        // The connection is re-created on the next attempt
        a.fail_state_requests(false);
        assert!(s.shared.try_register(&client).await);
        assert!(a.is_connected());
    }

    #[test]
    fn test_registerable_states() {
        assert!(is_registerable(ACTIVE_COORDINATOR));
        assert!(is_registerable(PASSIVE_STANDBY));
        assert!(!is_registerable("UNINITIALIZED"));
    }
}
