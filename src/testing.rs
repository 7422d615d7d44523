//! Test utilities for wolfvote
//!
//! In-memory stand-ins for stripe servers: [`ScriptedDiagnostics`] answers
//! diagnostics requests from a table of canned responses, and [`FakePeer`]
//! implements [`PeerClient`] directly so whole voting sessions can run
//! without a network. [`FakeStripe`] hands out one `FakePeer` per address.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::network::{Diagnostics, DiagnosticsConnector};
use crate::peer::{PeerClient, HEARTBEAT_RESPONSE, INVALID_VOTER_RESPONSE};
use crate::voting::{PeerFactory, ACTIVE_COORDINATOR, PASSIVE_STANDBY};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Scripted diagnostics channel
// ============================================================================

#[derive(Default)]
struct Script {
    responses: HashMap<String, String>,
    calls: HashMap<String, Vec<Option<String>>>,
    closes: usize,
}

/// Diagnostics channel answering every operation from a response table.
///
/// `getState` and `getConfig` are keyed by those names; invocations are
/// keyed by operation name regardless of target. Unscripted operations
/// fail with [`Error::Network`].
#[derive(Default)]
pub struct ScriptedDiagnostics {
    script: Mutex<Script>,
}

impl ScriptedDiagnostics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `operation` with `value` until scripted otherwise
    pub fn respond(&self, operation: &str, value: &str) {
        lock(&self.script)
            .responses
            .insert(operation.to_string(), value.to_string());
    }

    /// Arguments of every call made to `operation`, oldest first
    pub fn calls(&self, operation: &str) -> Vec<Option<String>> {
        lock(&self.script)
            .calls
            .get(operation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.script).closes
    }

    fn answer(&self, operation: &str, arg: Option<&str>) -> Result<String> {
        let mut script = lock(&self.script);
        script
            .calls
            .entry(operation.to_string())
            .or_default()
            .push(arg.map(str::to_string));
        script
            .responses
            .get(operation)
            .cloned()
            .ok_or_else(|| Error::Network(format!("no scripted response for {}", operation)))
    }
}

#[async_trait]
impl Diagnostics for ScriptedDiagnostics {
    async fn get_state(&self) -> Result<String> {
        self.answer("getState", None)
    }

    async fn get_config(&self) -> Result<String> {
        self.answer("getConfig", None)
    }

    async fn invoke(&self, _target: &str, operation: &str) -> Result<String> {
        self.answer(operation, None)
    }

    async fn invoke_with_arg(&self, _target: &str, operation: &str, arg: &str) -> Result<String> {
        self.answer(operation, Some(arg))
    }

    async fn close(&self) {
        lock(&self.script).closes += 1;
    }
}

/// Connector that always hands out the same scripted channel
pub struct ScriptedConnector {
    diagnostics: Arc<ScriptedDiagnostics>,
    refuse: Mutex<bool>,
}

impl ScriptedConnector {
    pub fn new(diagnostics: Arc<ScriptedDiagnostics>) -> Self {
        Self {
            diagnostics,
            refuse: Mutex::new(false),
        }
    }

    /// Make later connection attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        *lock(&self.refuse) = refuse;
    }
}

#[async_trait]
impl DiagnosticsConnector for ScriptedConnector {
    async fn connect(&self, address: &str, _props: &ConnectionConfig) -> Result<Arc<dyn Diagnostics>> {
        if *lock(&self.refuse) {
            return Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(self.diagnostics.clone())
    }
}

// ============================================================================
// Fake peer
// ============================================================================

struct PeerState {
    server_state: String,
    reachable: bool,
    connected: bool,
    accept_registration: bool,
    heartbeats: VecDeque<i64>,
    idle_heartbeat: i64,
    fail_heartbeats: bool,
    fail_state_requests: bool,
    topology: HashSet<String>,
    voting: bool,
    generation: i64,
    last_voted_generation: i64,
    zombied_generation: i64,
    vote_result: i64,
    override_result: bool,
    voter_count: i64,
    voter_limit: i64,
    votes: Vec<i64>,
    zombies: usize,
    registrations: usize,
    deregistrations: usize,
    heartbeat_count: usize,
    closes: usize,
}

/// In-memory [`PeerClient`] with the same term bookkeeping as
/// [`crate::peer::PeerConnection`] and counters for every side effect.
pub struct FakePeer {
    address: String,
    state: Mutex<PeerState>,
}

impl FakePeer {
    pub fn new(address: &str, server_state: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            state: Mutex::new(PeerState {
                server_state: server_state.to_string(),
                reachable: true,
                connected: false,
                accept_registration: true,
                heartbeats: VecDeque::new(),
                idle_heartbeat: HEARTBEAT_RESPONSE,
                fail_heartbeats: false,
                fail_state_requests: false,
                topology: HashSet::new(),
                voting: false,
                generation: INVALID_VOTER_RESPONSE,
                last_voted_generation: INVALID_VOTER_RESPONSE,
                zombied_generation: INVALID_VOTER_RESPONSE,
                vote_result: HEARTBEAT_RESPONSE,
                override_result: true,
                voter_count: 0,
                voter_limit: 1,
                votes: Vec::new(),
                zombies: 0,
                registrations: 0,
                deregistrations: 0,
                heartbeat_count: 0,
                closes: 0,
            }),
        })
    }

    /// A connected peer in the active-coordinator role
    pub fn active(address: &str) -> Arc<Self> {
        let peer = Self::new(address, ACTIVE_COORDINATOR);
        lock(&peer.state).connected = true;
        peer
    }

    /// A connected peer in the passive-standby role
    pub fn passive(address: &str) -> Arc<Self> {
        let peer = Self::new(address, PASSIVE_STANDBY);
        lock(&peer.state).connected = true;
        peer
    }

    // ========== Scripting ==========

    pub fn set_state(&self, server_state: &str) {
        lock(&self.state).server_state = server_state.to_string();
    }

    /// Whether later `connect` calls succeed
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Drop the connection as if the server went away
    pub fn disconnect(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.reachable = false;
    }

    pub fn set_accept_registration(&self, accept: bool) {
        lock(&self.state).accept_registration = accept;
    }

    pub fn set_topology(&self, addresses: &[&str]) {
        lock(&self.state).topology = addresses.iter().map(|a| a.to_string()).collect();
    }

    /// Queue one heartbeat response ahead of the idle response
    pub fn push_heartbeat(&self, response: i64) {
        lock(&self.state).heartbeats.push_back(response);
    }

    /// Response returned once the queue is drained
    pub fn set_heartbeat(&self, response: i64) {
        lock(&self.state).idle_heartbeat = response;
    }

    /// Make every later heartbeat time out
    pub fn fail_heartbeats(&self) {
        lock(&self.state).fail_heartbeats = true;
    }

    pub fn restore_heartbeats(&self) {
        lock(&self.state).fail_heartbeats = false;
    }

    /// Make `getState` fail with a transport error while connected
    pub fn fail_state_requests(&self, fail: bool) {
        lock(&self.state).fail_state_requests = fail;
    }

    /// Put the peer mid-election at `generation`
    pub fn set_election(&self, generation: i64, voting: bool) {
        let mut state = lock(&self.state);
        state.generation = generation;
        state.voting = voting;
    }

    pub fn set_last_voted(&self, generation: i64) {
        lock(&self.state).last_voted_generation = generation;
    }

    pub fn set_vote_result(&self, result: i64) {
        lock(&self.state).vote_result = result;
    }

    pub fn set_override_result(&self, accepted: bool) {
        lock(&self.state).override_result = accepted;
    }

    pub fn set_voter_capacity(&self, count: i64, limit: i64) {
        let mut state = lock(&self.state);
        state.voter_count = count;
        state.voter_limit = limit;
    }

    // ========== Inspection ==========

    /// Generations a vote was cast for, oldest first
    pub fn votes(&self) -> Vec<i64> {
        lock(&self.state).votes.clone()
    }

    pub fn zombie_count(&self) -> usize {
        lock(&self.state).zombies
    }

    pub fn registration_count(&self) -> usize {
        lock(&self.state).registrations
    }

    pub fn deregistration_count(&self) -> usize {
        lock(&self.state).deregistrations
    }

    pub fn heartbeat_count(&self) -> usize {
        lock(&self.state).heartbeat_count
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    fn ensure_connected(&self, state: &PeerState) -> Result<()> {
        if state.connected {
            Ok(())
        } else {
            Err(Error::NotConnected(self.address.clone()))
        }
    }
}

#[async_trait]
impl PeerClient for FakePeer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self, _props: &ConnectionConfig) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.reachable {
            return Err(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: "unreachable".into(),
            });
        }
        state.connected = true;
        Ok(())
    }

    async fn register(&self, _id: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        self.ensure_connected(&state)?;
        state.registrations += 1;
        if state.accept_registration {
            if state.generation < 0 {
                state.generation = 0;
            }
            Ok(true)
        } else {
            state.generation = INVALID_VOTER_RESPONSE;
            Ok(false)
        }
    }

    async fn heartbeat(&self, _id: &str) -> Result<i64> {
        let mut state = lock(&self.state);
        self.ensure_connected(&state)?;
        if state.fail_heartbeats {
            return Err(Error::RequestTimeout(self.address.clone()));
        }
        state.heartbeat_count += 1;

        let response = match state.heartbeats.pop_front() {
            Some(response) => response,
            None => state.idle_heartbeat,
        };
        match response {
            INVALID_VOTER_RESPONSE => {
                state.voting = false;
                state.generation = INVALID_VOTER_RESPONSE;
                Err(Error::NotRegistered(self.address.clone()))
            }
            r if r < 0 => Err(Error::ProtocolViolation {
                address: self.address.clone(),
                detail: format!("negative heartbeat response {}", r),
            }),
            HEARTBEAT_RESPONSE => {
                state.voting = false;
                Ok(HEARTBEAT_RESPONSE)
            }
            term => {
                if !state.voting && state.zombied_generation == term {
                    return Ok(HEARTBEAT_RESPONSE);
                }
                state.generation = term;
                state.voting = true;
                Ok(term)
            }
        }
    }

    async fn vote(&self, _id: &str) -> Result<i64> {
        let mut state = lock(&self.state);
        self.ensure_connected(&state)?;
        if !state.voting {
            return Err(Error::NotVoting(self.address.clone()));
        }
        let generation = state.generation;
        state.votes.push(generation);
        if state.vote_result == HEARTBEAT_RESPONSE {
            state.last_voted_generation = state.last_voted_generation.max(generation);
        }
        Ok(state.vote_result)
    }

    async fn override_vote(&self, _id: &str) -> Result<bool> {
        let state = lock(&self.state);
        self.ensure_connected(&state)?;
        Ok(state.override_result)
    }

    async fn deregister_voter(&self, _id: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        self.ensure_connected(&state)?;
        state.deregistrations += 1;
        state.generation = INVALID_VOTER_RESPONSE;
        state.voting = false;
        Ok(true)
    }

    async fn get_server_state(&self) -> Result<String> {
        let state = lock(&self.state);
        self.ensure_connected(&state)?;
        if state.fail_state_requests {
            return Err(Error::Network(format!("getState failed on {}", self.address)));
        }
        Ok(state.server_state.clone())
    }

    async fn get_server_config(&self) -> Result<String> {
        let state = lock(&self.state);
        self.ensure_connected(&state)?;
        Ok(format!("fake server {}", self.address))
    }

    async fn get_topology(&self) -> Result<HashSet<String>> {
        let state = lock(&self.state);
        self.ensure_connected(&state)?;
        Ok(state.topology.clone())
    }

    async fn registered_voter_count(&self) -> Result<i64> {
        let state = lock(&self.state);
        self.ensure_connected(&state)?;
        Ok(state.voter_count)
    }

    async fn registered_voter_limit(&self) -> Result<i64> {
        let state = lock(&self.state);
        self.ensure_connected(&state)?;
        Ok(state.voter_limit)
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        if state.connected {
            state.closes += 1;
        }
        state.connected = false;
    }

    fn zombie(&self) {
        let mut state = lock(&self.state);
        state.zombied_generation = state.generation;
        state.voting = false;
        state.zombies += 1;
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn is_voting(&self) -> bool {
        lock(&self.state).voting
    }

    fn generation(&self) -> i64 {
        lock(&self.state).generation
    }

    fn last_voted_generation(&self) -> i64 {
        lock(&self.state).last_voted_generation
    }
}

impl std::fmt::Debug for FakePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakePeer").field("address", &self.address).finish()
    }
}

// ============================================================================
// Fake stripe
// ============================================================================

/// A set of fake servers addressed by host:port
#[derive(Default, Clone)]
pub struct FakeStripe {
    peers: Arc<Mutex<HashMap<String, Arc<FakePeer>>>>,
}

impl FakeStripe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Arc<FakePeer>) -> Arc<FakePeer> {
        lock(&self.peers).insert(peer.address().to_string(), peer.clone());
        peer
    }

    /// The peer at `address`, created as a passive standby on first use
    pub fn peer(&self, address: &str) -> Arc<FakePeer> {
        lock(&self.peers)
            .entry(address.to_string())
            .or_insert_with(|| FakePeer::new(address, PASSIVE_STANDBY))
            .clone()
    }

    /// Factory handing the session this stripe's peers
    pub fn factory(&self) -> PeerFactory {
        let stripe = self.clone();
        Arc::new(move |address: &str| -> Arc<dyn PeerClient> { stripe.peer(address) })
    }
}
