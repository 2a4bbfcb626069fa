// src/nat/ice/agent.rs
//! ICE agent (RFC 8445)
//!
//! The public API runs on the caller's task. Socket receive loops and check
//! workers run as separate tasks and report to a single driver task, which
//! owns every pair-state and agent-state transition. Events are delivered
//! through one callback after the state lock is released.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use super::candidate::{Candidate, CandidatePair, CandidatePairState, TransportProtocol};
use super::check_list::{CheckList, PairKey};
use super::connectivity::{
    build_check_request, build_error_response, build_success_response, evaluate_check_response,
    resolve_role_conflict, validate_check_request, CheckOutcome, CheckRejection, IceCredentials, RoleResolution,
};
use super::gathering::{gather_host_candidates, gather_relay_candidates, gather_server_reflexive, LocalBinding};
use crate::nat::error::{NatError, NatResult};
use crate::nat::net::{DatagramSocket, Platform};
use crate::nat::stun::{
    is_stun, resolve_server, spawn_receiver, transact, Inbound, InboundKind, Message, MessageType, RetryPolicy,
    StunConfig, TransactionTable, DEFAULT_STUN_PORT,
};
use crate::nat::turn::{TurnClient, TurnServerConfig};

/// Most STUN servers an agent accepts
pub const MAX_STUN_SERVERS: usize = 4;

/// Most TURN servers an agent accepts
pub const MAX_TURN_SERVERS: usize = 2;

/// STUN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StunServerConfig {
    /// Host name or IP literal
    pub server: String,
    pub port: u16,
}

impl StunServerConfig {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self { server: server.into(), port }
    }
}

impl Default for StunServerConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: DEFAULT_STUN_PORT,
        }
    }
}

/// ICE role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IceRole {
    Controlling,
    Controlled,
}

impl IceRole {
    pub fn is_controlling(&self) -> bool {
        matches!(self, Self::Controlling)
    }

    /// The other role
    pub fn reversed(&self) -> Self {
        match self {
            Self::Controlling => Self::Controlled,
            Self::Controlled => Self::Controlling,
        }
    }
}

/// Full agents originate checks; Lite agents only answer them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceMode {
    Full,
    Lite,
}

/// How the controlling agent picks the selected pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NominationMode {
    /// Check first, then nominate the best valid pair with a second check
    Regular,
    /// Send USE-CANDIDATE on every check and take the first pair that works
    FirstViable,
}

/// ICE agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Initial role
    pub role: IceRole,

    pub mode: IceMode,

    /// STUN servers for server reflexive candidates
    pub stun_servers: Vec<StunServerConfig>,

    /// TURN servers for relay candidates
    pub turn_servers: Vec<TurnServerConfig>,

    pub gather_host: bool,
    pub gather_srflx: bool,
    pub gather_relay: bool,

    /// Components per session (1 = media only, 2 = media and control)
    pub components: u32,

    /// STUN per-attempt timeout
    pub stun_timeout_ms: u64,
    pub stun_retries: u32,

    /// Connectivity check per-attempt timeout
    pub check_timeout_ms: u64,
    pub check_retries: u32,

    /// Give up when no pair has succeeded after this long
    pub connectivity_check_timeout_ms: u64,

    /// Nominate the best valid pair this long after the first success
    pub nomination_timeout_ms: u64,

    /// Ta: interval between starting two checks
    pub check_pacing_ms: u64,

    pub max_concurrent_checks: usize,

    pub nomination: NominationMode,

    /// SOFTWARE attribute value
    pub software: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            role: IceRole::Controlling,
            mode: IceMode::Full,
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            gather_host: true,
            gather_srflx: true,
            gather_relay: false,
            components: 1,
            stun_timeout_ms: 3000,
            stun_retries: 3,
            check_timeout_ms: 500,
            check_retries: 6,
            connectivity_check_timeout_ms: 5000,
            nomination_timeout_ms: 3000,
            check_pacing_ms: 20,
            max_concurrent_checks: 16,
            nomination: NominationMode::Regular,
            software: None,
        }
    }
}

impl IceConfig {
    /// Reject unusable configurations
    pub fn validate(&self) -> NatResult<()> {
        super::validate_ice_config(self)
    }

    /// STUN client settings derived from this configuration
    pub fn stun_config(&self) -> StunConfig {
        StunConfig {
            timeout_ms: self.stun_timeout_ms,
            retries: self.stun_retries,
            software: self.software.clone(),
        }
    }

    /// Retransmission schedule of a connectivity check
    pub fn check_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.check_timeout_ms), self.check_retries)
    }

    fn effective_role(&self) -> IceRole {
        match self.mode {
            IceMode::Lite => IceRole::Controlled,
            IceMode::Full => self.role,
        }
    }
}

/// Externally observable agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IceState {
    New,
    Gathering,
    Checking,
    /// Every component has a selected pair
    Connected,
    /// Connected and every check has finished
    Completed,
    Failed,
    /// The selected pair stopped working
    Disconnected,
    Closed,
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Notifications delivered to the event callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    /// A local candidate was discovered
    CandidateGathered(Candidate),
    StateChanged(IceState),
    /// A pair was selected for a component; fires once per component
    PairSelected { local: Candidate, remote: Candidate },
    /// Gathering finished with at least one candidate
    GatheringComplete,
    /// Non-STUN datagram received on a component
    Data {
        component_id: u32,
        from: SocketAddr,
        payload: Bytes,
    },
}

/// Event callback; invoked synchronously and must not block
pub type IceEventCallback = Arc<dyn Fn(IceEvent) + Send + Sync>;

enum DriverMsg {
    CheckDone {
        key: PairKey,
        nomination: bool,
        outcome: CheckOutcome,
    },
}

struct AgentState {
    ice_state: IceState,
    role: IceRole,
    remote_credentials: Option<IceCredentials>,
    /// Advertised local candidates
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    /// Candidates we can send from (host and relay), with their sockets
    bases: Vec<LocalBinding>,
    check_list: CheckList,
    selected: BTreeMap<u32, CandidatePair>,
    /// Components with a nomination check in flight
    nominating: HashSet<u32>,
    /// USE-CANDIDATE seen on pairs that had not succeeded yet
    pending_nominations: HashSet<PairKey>,
    checks_started_at: Option<Instant>,
    first_success_at: Option<Instant>,
    turn_clients: Vec<Arc<TurnClient>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentState {
    fn socket_for(&self, local: &SocketAddr) -> Option<Arc<dyn DatagramSocket>> {
        self.bases
            .iter()
            .find(|b| b.candidate.addr == *local)
            .map(|b| b.socket.clone())
    }

    fn base_for(&self, local: &SocketAddr) -> Option<&Candidate> {
        self.bases.iter().find(|b| b.candidate.addr == *local).map(|b| &b.candidate)
    }

    /// Base that traffic from `from` belongs to
    ///
    /// Selected pairs win, then any checked pair, then a remote candidate's
    /// component. Unknown sources fall back to the first base.
    fn local_for_remote(&self, from: &SocketAddr) -> Option<SocketAddr> {
        if let Some(pair) = self.selected.values().find(|p| p.remote.addr == *from) {
            return Some(pair.local.addr);
        }
        if let Some(pair) = self.check_list.pairs().iter().find(|p| p.remote.addr == *from) {
            return Some(pair.local.addr);
        }
        if let Some(remote) = self.remote_candidates.iter().find(|c| c.addr == *from) {
            let base = self.bases.iter().find(|b| {
                b.candidate.component_id == remote.component_id && b.candidate.addr.is_ipv4() == from.is_ipv4()
            });
            if let Some(base) = base {
                return Some(base.candidate.addr);
            }
        }
        self.bases.first().map(|b| b.candidate.addr)
    }

    fn checks_running(&self) -> bool {
        matches!(
            self.ice_state,
            IceState::Checking | IceState::Connected | IceState::Completed
        )
    }
}

struct Inner {
    id: Uuid,
    config: IceConfig,
    platform: Platform,
    local_credentials: IceCredentials,
    tie_breaker: u64,
    transactions: Arc<TransactionTable>,
    state: Mutex<AgentState>,
    callback: RwLock<Option<IceEventCallback>>,
    /// Held while delivering an event; close() takes it to fence off late events
    emit_gate: ReentrantMutex<()>,
    silenced: AtomicBool,
    cancel: CancellationToken,
    check_slots: Arc<Semaphore>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    driver_tx: mpsc::UnboundedSender<DriverMsg>,
    driver_rx: Mutex<Option<(mpsc::UnboundedReceiver<Inbound>, mpsc::UnboundedReceiver<DriverMsg>)>>,
}

/// ICE agent
pub struct IceAgent {
    inner: Arc<Inner>,
}

impl IceAgent {
    /// Create an agent on the default platform (tokio UDP, OS interfaces)
    pub fn new(config: IceConfig) -> NatResult<Self> {
        Self::with_platform(config, Platform::default())
    }

    /// Create an agent on the given socket/interface facilities
    pub fn with_platform(config: IceConfig, platform: Platform) -> NatResult<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let local_credentials = IceCredentials::generate();
        let tie_breaker = OsRng.next_u64();
        let role = config.effective_role();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (driver_tx, driver_rx) = mpsc::unbounded_channel();

        info!(
            "Creating ICE agent {} ({:?}, {:?}, ufrag {})",
            id, role, config.mode, local_credentials.ufrag
        );

        let inner = Inner {
            id,
            check_slots: Arc::new(Semaphore::new(config.max_concurrent_checks)),
            platform,
            local_credentials,
            tie_breaker,
            transactions: Arc::new(TransactionTable::new()),
            state: Mutex::new(AgentState {
                ice_state: IceState::New,
                role,
                remote_credentials: None,
                local_candidates: Vec::new(),
                remote_candidates: Vec::new(),
                bases: Vec::new(),
                check_list: CheckList::new(role.is_controlling()),
                selected: BTreeMap::new(),
                nominating: HashSet::new(),
                pending_nominations: HashSet::new(),
                checks_started_at: None,
                first_success_at: None,
                turn_clients: Vec::new(),
                tasks: Vec::new(),
            }),
            callback: RwLock::new(None),
            emit_gate: ReentrantMutex::new(()),
            silenced: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            inbound_tx,
            driver_tx,
            driver_rx: Mutex::new(Some((inbound_rx, driver_rx))),
            config,
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Agent id used in logs
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Install the event callback, replacing any previous one
    pub fn set_event_callback(&self, callback: IceEventCallback) {
        *self.inner.callback.write() = Some(callback);
    }

    pub fn get_state(&self) -> IceState {
        self.inner.state.lock().ice_state
    }

    pub fn get_role(&self) -> IceRole {
        self.inner.state.lock().role
    }

    /// Local ufrag/pwd, stable for the agent's lifetime
    pub fn get_local_credentials(&self) -> IceCredentials {
        self.inner.local_credentials.clone()
    }

    pub fn get_local_candidates(&self) -> Vec<Candidate> {
        self.inner.state.lock().local_candidates.clone()
    }

    pub fn get_remote_candidates(&self) -> Vec<Candidate> {
        self.inner.state.lock().remote_candidates.clone()
    }

    /// Snapshot of the check list in priority order
    pub fn get_check_list(&self) -> Vec<CandidatePair> {
        self.inner.state.lock().check_list.pairs().to_vec()
    }

    /// Selected pair of component 1
    pub fn get_selected_pair(&self) -> Option<CandidatePair> {
        self.get_selected_pair_for(1)
    }

    pub fn get_selected_pair_for(&self, component_id: u32) -> Option<CandidatePair> {
        self.inner.state.lock().selected.get(&component_id).cloned()
    }

    /// Gather host, server reflexive and relay candidates
    ///
    /// Candidates are reported one by one as they are found. Individual
    /// interface or server failures only omit candidates; when nothing at all
    /// was gathered the agent moves to `Failed`.
    pub async fn gather_candidates(&self) -> NatResult<()> {
        let inner = &self.inner;
        {
            let mut st = inner.state.lock();
            if st.ice_state != IceState::New {
                return Err(NatError::InvalidState(format!("cannot gather in state {}", st.ice_state)));
            }
            st.ice_state = IceState::Gathering;
        }
        inner.emit(IceEvent::StateChanged(IceState::Gathering));
        self.ensure_driver();

        let config = &inner.config;
        info!("[{}] Gathering candidates", inner.id);

        let hosts = gather_host_candidates(&inner.platform, config.components, |candidate| {
            if config.gather_host {
                inner.add_local_candidate(candidate.clone());
            }
        })
        .await;
        for host in &hosts {
            self.register_base(host.clone());
        }

        if config.gather_srflx && !config.stun_servers.is_empty() && !hosts.is_empty() {
            let mut servers = Vec::new();
            for entry in &config.stun_servers {
                match resolve_server(&entry.server, entry.port, None).await {
                    Ok(addr) => servers.push(addr),
                    Err(e) => warn!("[{}] Skipping STUN server {}: {}", inner.id, entry.server, e),
                }
            }
            gather_server_reflexive(&hosts, &servers, &inner.transactions, &config.stun_config(), |candidate| {
                inner.add_local_candidate(candidate.clone())
            })
            .await;
        }

        if config.gather_relay && !config.turn_servers.is_empty() && !hosts.is_empty() {
            let relays = gather_relay_candidates(
                &inner.platform,
                &hosts,
                &config.turn_servers,
                config.stun_config().retry_policy(),
                config.software.clone(),
                |candidate| inner.add_local_candidate(candidate.clone()),
            )
            .await;

            for relay in relays {
                let socket: Arc<dyn DatagramSocket> = match relay.client.relayed_socket() {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!("[{}] Relay via {} unusable: {}", inner.id, relay.client.server(), e);
                        continue;
                    }
                };
                let refresh = relay.client.start_refresh_timer();
                {
                    let mut st = inner.state.lock();
                    st.turn_clients.push(relay.client.clone());
                    st.tasks.push(refresh);
                }
                self.register_base(LocalBinding {
                    candidate: relay.candidate,
                    socket,
                });
            }
        }

        let outcome = {
            let mut st = inner.state.lock();
            if st.ice_state == IceState::Closed {
                None
            } else if st.local_candidates.is_empty() {
                st.ice_state = IceState::Failed;
                Some(IceEvent::StateChanged(IceState::Failed))
            } else {
                Some(IceEvent::GatheringComplete)
            }
        };

        match outcome {
            None => Err(NatError::InvalidState("agent closed during gathering".to_string())),
            Some(event) => {
                match &event {
                    IceEvent::GatheringComplete => info!(
                        "[{}] Gathering complete: {} candidates",
                        inner.id,
                        self.get_local_candidates().len()
                    ),
                    _ => warn!("[{}] Gathering produced no candidates", inner.id),
                }
                inner.emit(event);
                Ok(())
            }
        }
    }

    /// Add a candidate received from the peer
    ///
    /// Once checks are running new pairs are formed and scheduled without
    /// disturbing checks in progress.
    pub fn add_remote_candidate(&self, candidate: Candidate) -> NatResult<()> {
        if candidate.transport == TransportProtocol::Tcp {
            return Err(NatError::NotSupported("TCP candidates".to_string()));
        }
        if candidate.component_id == 0 || candidate.component_id > self.inner.config.components {
            return Err(NatError::InvalidParam(format!(
                "component {} not in 1..={}",
                candidate.component_id, self.inner.config.components
            )));
        }

        let mut st = self.inner.state.lock();
        if st.ice_state == IceState::Closed {
            return Err(NatError::InvalidState("agent is closed".to_string()));
        }
        if st
            .remote_candidates
            .iter()
            .any(|c| c.addr == candidate.addr && c.component_id == candidate.component_id)
        {
            debug!("[{}] Duplicate remote candidate {}", self.inner.id, candidate);
            return Ok(());
        }

        debug!("[{}] Remote candidate {}", self.inner.id, candidate);
        st.remote_candidates.push(candidate.clone());

        if st.checks_running() {
            let locals: Vec<Candidate> = st.bases.iter().map(|b| b.candidate.clone()).collect();
            if st.check_list.form_pairs(&locals, &[candidate]) > 0 {
                st.check_list.unfreeze_initial();
            }
        }
        Ok(())
    }

    /// Set the peer's ufrag/pwd; required before `start_checks`
    pub fn set_remote_credentials(&self, ufrag: &str, pwd: &str) -> NatResult<()> {
        let credentials = IceCredentials::new(ufrag, pwd)?;
        let mut st = self.inner.state.lock();
        if st.ice_state == IceState::Closed {
            return Err(NatError::InvalidState("agent is closed".to_string()));
        }
        st.remote_credentials = Some(credentials);
        Ok(())
    }

    /// Form the check list and start connectivity checks
    pub fn start_checks(&self) -> NatResult<()> {
        let inner = &self.inner;
        let mut events = Vec::new();
        {
            let mut st = inner.state.lock();
            if st.ice_state != IceState::Gathering {
                return Err(NatError::InvalidState(format!("cannot start checks in state {}", st.ice_state)));
            }
            if st.bases.is_empty() || st.local_candidates.is_empty() {
                return Err(NatError::InvalidState("no local candidates".to_string()));
            }
            if st.remote_candidates.is_empty() {
                return Err(NatError::InvalidState("no remote candidates".to_string()));
            }
            if st.remote_credentials.is_none() {
                return Err(NatError::InvalidState("remote credentials not set".to_string()));
            }

            let locals: Vec<Candidate> = st.bases.iter().map(|b| b.candidate.clone()).collect();
            let remotes = st.remote_candidates.clone();
            st.check_list.form_pairs(&locals, &remotes);
            st.check_list.unfreeze_initial();
            st.checks_started_at = Some(Instant::now());

            if st.check_list.is_empty() {
                warn!("[{}] No compatible candidate pairs", inner.id);
                st.ice_state = IceState::Failed;
            } else {
                info!(
                    "[{}] Starting checks on {} pairs as {:?}",
                    inner.id,
                    st.check_list.len(),
                    st.role
                );
                st.ice_state = IceState::Checking;
            }
            events.push(IceEvent::StateChanged(st.ice_state));

            if st.ice_state == IceState::Checking && inner.config.mode == IceMode::Lite {
                // Nominations that arrived before the check list existed
                let pending: Vec<PairKey> = st.pending_nominations.drain().collect();
                for key in pending {
                    if st.check_list.set_state(&key, CandidatePairState::Succeeded) {
                        select_pair(&mut st, key, &mut events);
                    }
                }
                update_state(inner, &mut st, &mut events);
            }
        }

        inner.emit_all(events);
        self.ensure_driver();
        Ok(())
    }

    /// Send `data` on the selected pair of `component_id`
    pub async fn send(&self, component_id: u32, data: &[u8]) -> NatResult<()> {
        let (socket, remote) = {
            let st = self.inner.state.lock();
            if !matches!(st.ice_state, IceState::Connected | IceState::Completed) {
                return Err(NatError::InvalidState(format!("cannot send in state {}", st.ice_state)));
            }
            let pair = st
                .selected
                .get(&component_id)
                .ok_or_else(|| NatError::InvalidState(format!("no selected pair for component {}", component_id)))?;
            let socket = st
                .socket_for(&pair.local.addr)
                .ok_or_else(|| NatError::InvalidState("selected pair has no socket".to_string()))?;
            (socket, pair.remote.addr)
        };

        match socket.send_to(data, remote).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("[{}] Send to {} failed: {}", self.inner.id, remote, e);
                let disconnected = {
                    let mut st = self.inner.state.lock();
                    if matches!(st.ice_state, IceState::Connected | IceState::Completed) {
                        st.ice_state = IceState::Disconnected;
                        true
                    } else {
                        false
                    }
                };
                if disconnected {
                    self.inner.emit(IceEvent::StateChanged(IceState::Disconnected));
                }
                Err(e.into())
            }
        }
    }

    /// Feed a datagram received outside the agent's own sockets
    ///
    /// The component is picked from `from`: the pair or remote candidate with
    /// that address decides which local socket answers STUN requests and
    /// which component `IceEvent::Data` is reported under.
    pub fn process_incoming(&self, data: &[u8], from: SocketAddr) -> NatResult<()> {
        let local = {
            let st = self.inner.state.lock();
            if st.ice_state == IceState::Closed {
                return Err(NatError::InvalidState("agent is closed".to_string()));
            }
            st.local_for_remote(&from)
                .ok_or_else(|| NatError::InvalidState("no local socket to answer from".to_string()))?
        };

        let data = Bytes::copy_from_slice(data);
        if is_stun(&data) {
            trace!("[{}] Injected STUN from {}", self.inner.id, from);
        }
        if let Some(kind) = self.inner.transactions.dispatch(data, from) {
            self.ensure_driver();
            self.inner
                .inbound_tx
                .send(Inbound { local, from, kind })
                .map_err(|_| NatError::InvalidState("agent is closed".to_string()))?;
        }
        Ok(())
    }

    /// Stop everything and release sockets and TURN allocations
    ///
    /// No event is delivered once this returns. Closing twice is a no-op.
    pub async fn close(&self) -> NatResult<()> {
        let inner = &self.inner;
        let (tasks, turn_clients) = {
            let mut st = inner.state.lock();
            if st.ice_state == IceState::Closed {
                return Ok(());
            }
            st.ice_state = IceState::Closed;
            st.local_candidates.clear();
            st.remote_candidates.clear();
            st.bases.clear();
            st.check_list.clear();
            st.selected.clear();
            st.nominating.clear();
            st.pending_nominations.clear();
            (std::mem::take(&mut st.tasks), std::mem::take(&mut st.turn_clients))
        };

        info!("[{}] Closing", inner.id);
        inner.cancel.cancel();
        inner.transactions.cancel_all();
        for task in tasks {
            task.abort();
        }
        for client in turn_clients {
            client.close().await;
        }

        // Fence: the Closed notification is the last one delivered
        let _gate = inner.emit_gate.lock();
        inner.emit(IceEvent::StateChanged(IceState::Closed));
        inner.silenced.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn register_base(&self, binding: LocalBinding) {
        let inner = &self.inner;
        let receiver = spawn_receiver(
            binding.socket.clone(),
            inner.transactions.clone(),
            Some(inner.inbound_tx.clone()),
            inner.cancel.child_token(),
        );
        let mut st = inner.state.lock();
        st.tasks.push(receiver);
        st.bases.push(binding);
    }

    fn ensure_driver(&self) {
        let Some((inbound_rx, driver_rx)) = self.inner.driver_rx.lock().take() else { return };

        let inner = self.inner.clone();
        let span = info_span!("ice_agent", id = %inner.id);
        let handle = tokio::spawn(drive(inner, inbound_rx, driver_rx).instrument(span));

        self.inner.state.lock().tasks.push(handle);
    }
}

impl Drop for IceAgent {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        self.inner.transactions.cancel_all();
    }
}

impl fmt::Debug for IceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceAgent")
            .field("id", &self.inner.id)
            .field("state", &self.get_state())
            .finish()
    }
}

impl Inner {
    fn emit(&self, event: IceEvent) {
        let _gate = self.emit_gate.lock();
        if self.silenced.load(Ordering::SeqCst) {
            return;
        }
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn emit_all(&self, events: Vec<IceEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn add_local_candidate(&self, candidate: Candidate) {
        {
            let mut st = self.state.lock();
            if st.ice_state == IceState::Closed || st.local_candidates.contains(&candidate) {
                return;
            }
            st.local_candidates.push(candidate.clone());
        }
        self.emit(IceEvent::CandidateGathered(candidate));
    }
}

/// Driver: serializes inbound STUN, check results and timers
async fn drive(
    inner: Arc<Inner>,
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    mut driver_rx: mpsc::UnboundedReceiver<DriverMsg>,
) {
    let mut pacer = interval(Duration::from_millis(inner.config.check_pacing_ms));
    pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let events = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            Some(inbound) = inbound_rx.recv() => handle_inbound(&inner, inbound).await,
            Some(msg) = driver_rx.recv() => match msg {
                DriverMsg::CheckDone { key, nomination, outcome } => handle_check_done(&inner, key, nomination, outcome),
            },
            _ = pacer.tick() => on_tick(&inner),
        };
        inner.emit_all(events);
    }

    debug!("Driver stopped");
}

fn on_tick(inner: &Arc<Inner>) -> Vec<IceEvent> {
    let mut events = Vec::new();
    let mut st = inner.state.lock();
    if !st.checks_running() || inner.config.mode == IceMode::Lite {
        return events;
    }

    // Nothing worked within the overall budget
    if st.ice_state == IceState::Checking && !st.check_list.any_succeeded() {
        let timeout = Duration::from_millis(inner.config.connectivity_check_timeout_ms);
        if st.checks_started_at.map(|t| t.elapsed() >= timeout).unwrap_or(false) {
            warn!("No pair succeeded within {:?}", timeout);
            st.check_list.fail_remaining();
            st.ice_state = IceState::Failed;
            events.push(IceEvent::StateChanged(IceState::Failed));
            return events;
        }
    }

    if st.role.is_controlling() && inner.config.nomination == NominationMode::Regular {
        nominate_ready_pairs(inner, &mut st);
    }

    if let Ok(permit) = inner.check_slots.clone().try_acquire_owned() {
        if let Some(key) = st.check_list.next_check() {
            let use_candidate = st.role.is_controlling() && inner.config.nomination == NominationMode::FirstViable;
            if !start_check(inner, &st, key, use_candidate, Some(permit)) {
                st.check_list.set_state(&key, CandidatePairState::Failed);
            }
        }
    }

    update_state(inner, &mut st, &mut events);
    events
}

/// Spawn a check worker for `key`; results come back as `DriverMsg::CheckDone`
fn start_check(
    inner: &Arc<Inner>,
    st: &AgentState,
    key: PairKey,
    use_candidate: bool,
    permit: Option<OwnedSemaphorePermit>,
) -> bool {
    let (Some(pair), Some(remote_credentials)) = (st.check_list.get(&key), st.remote_credentials.as_ref()) else {
        return false;
    };
    let Some(socket) = st.socket_for(&pair.local.addr) else { return false };

    let built = build_check_request(
        &inner.local_credentials,
        remote_credentials,
        pair.local.peer_reflexive_priority(),
        st.role,
        inner.tie_breaker,
        use_candidate,
        inner.config.software.as_deref(),
    );
    let (request, encoded) = match built {
        Ok(built) => built,
        Err(e) => {
            warn!("Cannot build check for {}: {}", pair, e);
            return false;
        }
    };

    trace!("Checking {}{}", pair, if use_candidate { " with USE-CANDIDATE" } else { "" });

    let remote = key.1;
    let remote_pwd = remote_credentials.pwd.clone();
    let policy = inner.config.check_policy();
    let tx = inner.driver_tx.clone();
    let table = inner.transactions.clone();
    let cancel = inner.cancel.clone();
    let nomination = use_candidate && inner.config.nomination == NominationMode::Regular;

    tokio::spawn(async move {
        let _permit = permit;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            result = transact(socket.as_ref(), &table, &request, &encoded, remote, policy) => match result {
                Ok(response) => evaluate_check_response(&response, remote, &remote_pwd),
                Err(e) => CheckOutcome::Failed(e.to_string()),
            },
        };
        let _ = tx.send(DriverMsg::CheckDone { key, nomination, outcome });
    });
    true
}

fn handle_check_done(inner: &Arc<Inner>, key: PairKey, nomination: bool, outcome: CheckOutcome) -> Vec<IceEvent> {
    let mut events = Vec::new();
    let mut st = inner.state.lock();
    if !st.checks_running() {
        return events;
    }
    let Some(component_id) = st.check_list.get(&key).map(|p| p.local.component_id) else { return events };

    match outcome {
        CheckOutcome::Succeeded { mapped } => {
            debug!("Check {} -> {} succeeded (mapped {})", key.0, key.1, mapped);
            learn_local_peer_reflexive(&mut st, key, mapped, &mut events);

            st.check_list.set_state(&key, CandidatePairState::Succeeded);
            st.first_success_at.get_or_insert_with(Instant::now);

            let select = if st.role.is_controlling() {
                nomination || inner.config.nomination == NominationMode::FirstViable
            } else {
                st.pending_nominations.remove(&key)
            };
            if nomination {
                st.nominating.remove(&component_id);
            }
            if select {
                select_pair(&mut st, key, &mut events);
            }
        }
        CheckOutcome::RoleConflict => {
            let role = st.role.reversed();
            info!("Role conflict on {} -> {}, switching to {:?}", key.0, key.1, role);
            set_role(&mut st, role);
            if nomination {
                st.nominating.remove(&component_id);
            }
            st.check_list.set_state(&key, CandidatePairState::Waiting);
            st.check_list.trigger(key);
        }
        CheckOutcome::Failed(reason) => {
            debug!("Check {} -> {} failed: {}", key.0, key.1, reason);
            if nomination {
                st.nominating.remove(&component_id);
            }
            st.check_list.set_state(&key, CandidatePairState::Failed);
        }
    }

    if st.role.is_controlling() && inner.config.nomination == NominationMode::Regular {
        nominate_ready_pairs(inner, &mut st);
    }
    update_state(inner, &mut st, &mut events);
    events
}

/// Regular nomination: for each component without a selected pair, re-check
/// the best valid pair with USE-CANDIDATE once no better pair can still
/// succeed, or once the nomination timer has run out
fn nominate_ready_pairs(inner: &Arc<Inner>, st: &mut AgentState) {
    let timer_expired = st
        .first_success_at
        .map(|t| t.elapsed() >= Duration::from_millis(inner.config.nomination_timeout_ms))
        .unwrap_or(false);

    for component_id in 1..=inner.config.components {
        if st.selected.contains_key(&component_id) || st.nominating.contains(&component_id) {
            continue;
        }

        let ready = st
            .check_list
            .nomination_candidate(component_id)
            .or_else(|| timer_expired.then(|| st.check_list.best_succeeded(component_id)).flatten())
            .map(|p| p.addresses());

        if let Some(key) = ready {
            info!("Nominating {} -> {} for component {}", key.0, key.1, component_id);
            if start_check(inner, st, key, true, None) {
                st.nominating.insert(component_id);
            }
        }
    }
}

fn select_pair(st: &mut AgentState, key: PairKey, events: &mut Vec<IceEvent>) {
    let Some(pair) = st.check_list.get_mut(&key) else { return };
    let component_id = pair.local.component_id;
    if st.selected.contains_key(&component_id) {
        return;
    }

    pair.nominated = true;
    let pair = pair.clone();
    info!("Selected pair for component {}: {}", component_id, pair);
    events.push(IceEvent::PairSelected {
        local: pair.local.clone(),
        remote: pair.remote.clone(),
    });
    st.selected.insert(component_id, pair);
}

fn set_role(st: &mut AgentState, role: IceRole) {
    st.role = role;
    st.check_list.set_controlling(role.is_controlling());
    st.nominating.clear();
}

fn learn_local_peer_reflexive(st: &mut AgentState, key: PairKey, mapped: SocketAddr, events: &mut Vec<IceEvent>) {
    if mapped == key.0 || st.local_candidates.iter().any(|c| c.addr == mapped) {
        return;
    }
    let Some(base) = st.base_for(&key.0).cloned() else { return };

    let candidate = Candidate::new_peer_reflexive(mapped, base.addr, base.component_id, base.peer_reflexive_priority());
    info!("Learned peer reflexive candidate {}", candidate);
    st.local_candidates.push(candidate.clone());
    events.push(IceEvent::CandidateGathered(candidate));
}

/// Move the agent state forward after pair changes
fn update_state(inner: &Arc<Inner>, st: &mut AgentState, events: &mut Vec<IceEvent>) {
    let components = inner.config.components;
    let all_selected = (1..=components).all(|c| st.selected.contains_key(&c));
    let lite = inner.config.mode == IceMode::Lite;

    if st.ice_state == IceState::Checking && all_selected {
        st.ice_state = IceState::Connected;
        events.push(IceEvent::StateChanged(IceState::Connected));
    }

    if st.ice_state == IceState::Connected && (lite || st.check_list.all_terminal()) {
        st.ice_state = IceState::Completed;
        events.push(IceEvent::StateChanged(IceState::Completed));
    }

    if st.ice_state == IceState::Checking && !lite && st.nominating.is_empty() {
        let hopeless = st.check_list.all_failed()
            || (st.check_list.all_terminal()
                && (1..=components).any(|c| !st.selected.contains_key(&c) && st.check_list.best_succeeded(c).is_none()));
        if hopeless {
            warn!("All candidate pairs failed");
            st.check_list.fail_remaining();
            st.ice_state = IceState::Failed;
            events.push(IceEvent::StateChanged(IceState::Failed));
        }
    }
}

async fn handle_inbound(inner: &Arc<Inner>, inbound: Inbound) -> Vec<IceEvent> {
    match inbound.kind {
        InboundKind::Data(payload) => {
            let st = inner.state.lock();
            if st.ice_state == IceState::Closed {
                return Vec::new();
            }
            match st.base_for(&inbound.local) {
                Some(base) => vec![IceEvent::Data {
                    component_id: base.component_id,
                    from: inbound.from,
                    payload,
                }],
                None => Vec::new(),
            }
        }
        InboundKind::Stun { message, raw } => match message.message_type {
            MessageType::BindingRequest => handle_binding_request(inner, inbound.local, inbound.from, message, raw).await,
            other => {
                trace!("Ignoring {:?} from {}", other, inbound.from);
                Vec::new()
            }
        },
    }
}

/// Answer a connectivity check and update pairs (RFC 8445 Section 7.3)
async fn handle_binding_request(
    inner: &Arc<Inner>,
    local: SocketAddr,
    from: SocketAddr,
    request: Message,
    raw: Bytes,
) -> Vec<IceEvent> {
    let mut events = Vec::new();
    let software = inner.config.software.as_deref();

    let (reply, socket) = {
        let mut st = inner.state.lock();
        if st.ice_state == IceState::Closed {
            return events;
        }
        let Some(socket) = st.socket_for(&local) else { return events };

        let reply = match validate_check_request(&request, &raw, &inner.local_credentials) {
            Err(CheckRejection::Discard(reason)) => {
                debug!("Dropping check from {}: {}", from, reason);
                return events;
            }
            Err(CheckRejection::Error { code, reason, unknown }) => {
                debug!("Rejecting check from {}: {} {}", from, code, reason);
                build_error_response(&request, code, reason, &unknown, None)
            }
            Ok(check) => {
                let resolution = match inner.config.mode {
                    IceMode::Full => resolve_role_conflict(st.role, inner.tie_breaker, check.remote_role),
                    IceMode::Lite if check.remote_role.0 == IceRole::Controlled => RoleResolution::Reject,
                    IceMode::Lite => RoleResolution::Keep,
                };

                match resolution {
                    RoleResolution::Reject => {
                        debug!("Role conflict with {}, keeping {:?}", from, st.role);
                        build_error_response(
                            &request,
                            487,
                            "Role Conflict",
                            &[],
                            Some(inner.local_credentials.pwd.as_bytes()),
                        )
                    }
                    resolution => {
                        if resolution == RoleResolution::Switch {
                            let role = st.role.reversed();
                            info!("Role conflict with {}, switching to {:?}", from, role);
                            set_role(&mut st, role);
                        }
                        on_valid_check(inner, &mut st, local, from, check.priority, check.use_candidate, &mut events);
                        build_success_response(&request, from, &inner.local_credentials.pwd, software)
                    }
                }
            }
        };
        (reply, socket)
    };

    match reply {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, from).await {
                debug!("Cannot answer check from {}: {}", from, e);
            }
        }
        Err(e) => warn!("Cannot encode check response: {}", e),
    }
    events
}

fn on_valid_check(
    inner: &Arc<Inner>,
    st: &mut AgentState,
    local: SocketAddr,
    from: SocketAddr,
    priority: u32,
    use_candidate: bool,
    events: &mut Vec<IceEvent>,
) {
    let Some(base) = st.base_for(&local).cloned() else { return };
    let component_id = base.component_id;

    // An unknown source is a new peer reflexive remote candidate
    let remote = match st
        .remote_candidates
        .iter()
        .find(|c| c.addr == from && c.component_id == component_id)
    {
        Some(remote) => remote.clone(),
        None => {
            let remote = Candidate::new_peer_reflexive(from, from, component_id, priority);
            debug!("Learned remote peer reflexive candidate {}", remote);
            st.remote_candidates.push(remote.clone());
            remote
        }
    };

    let key = (local, from);
    if !st.checks_running() {
        // Remember the nomination until checks start
        if use_candidate && !st.role.is_controlling() {
            st.pending_nominations.insert(key);
        }
        return;
    }

    if st.check_list.get(&key).is_none() {
        let pair = CandidatePair::new(base, remote, st.role.is_controlling());
        st.check_list.insert(pair);
    }

    if inner.config.mode == IceMode::Lite {
        // Lite agents treat an authenticated check as proof the pair works
        st.check_list.set_state(&key, CandidatePairState::Succeeded);
        if use_candidate {
            select_pair(st, key, events);
        }
        update_state(inner, st, events);
        return;
    }

    let succeeded = st
        .check_list
        .get(&key)
        .map(|p| p.state == CandidatePairState::Succeeded)
        .unwrap_or(false);
    if !succeeded {
        st.check_list.trigger(key);
    }

    if use_candidate && !st.role.is_controlling() {
        if succeeded {
            select_pair(st, key, events);
            update_state(inner, st, events);
        } else {
            st.pending_nominations.insert(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::net::MemoryNetwork;

    fn lan_agent(config: IceConfig) -> (IceAgent, MemoryNetwork) {
        let net = MemoryNetwork::new();
        let platform = net.platform(&["192.168.1.5".parse().unwrap()]);
        (IceAgent::with_platform(config, platform).unwrap(), net)
    }

    fn remote_host() -> Candidate {
        Candidate::new_host("192.168.1.6:50000".parse().unwrap(), 1, 65535)
    }

    #[test]
    fn test_credentials_and_tie_breaker() {
        let agent = IceAgent::new(IceConfig::default()).unwrap();
        let creds = agent.get_local_credentials();
        assert_eq!(creds.ufrag.len(), 8);
        assert_eq!(creds.pwd.len(), 24);
        assert_eq!(agent.get_local_credentials(), creds);
        assert_eq!(agent.get_state(), IceState::New);
        assert_eq!(agent.get_role(), IceRole::Controlling);
    }

    #[test]
    fn test_lite_forces_controlled() {
        let config = IceConfig { mode: IceMode::Lite, ..Default::default() };
        let agent = IceAgent::new(config).unwrap();
        assert_eq!(agent.get_role(), IceRole::Controlled);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = IceConfig { components: 3, ..Default::default() };
        assert!(matches!(IceAgent::new(config), Err(NatError::InvalidParam(_))));
    }

    #[tokio::test]
    async fn test_start_checks_before_remote_candidates() {
        let (agent, _net) = lan_agent(IceConfig::default());
        assert!(matches!(agent.start_checks(), Err(NatError::InvalidState(_))));

        agent.gather_candidates().await.unwrap();
        assert_eq!(agent.get_local_candidates().len(), 1);
        assert!(matches!(agent.start_checks(), Err(NatError::InvalidState(_))));

        // Candidates without credentials are still not enough
        agent.add_remote_candidate(remote_host()).unwrap();
        assert!(matches!(agent.start_checks(), Err(NatError::InvalidState(_))));
        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_nomination() {
        let (agent, _net) = lan_agent(IceConfig::default());
        assert!(matches!(agent.send(1, b"early").await, Err(NatError::InvalidState(_))));

        agent.gather_candidates().await.unwrap();
        agent.add_remote_candidate(remote_host()).unwrap();
        let peer = IceCredentials::generate();
        agent.set_remote_credentials(&peer.ufrag, &peer.pwd).unwrap();
        agent.start_checks().unwrap();
        assert_eq!(agent.get_state(), IceState::Checking);
        assert!(matches!(agent.send(1, b"early").await, Err(NatError::InvalidState(_))));
        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_semantics() {
        let (agent, _net) = lan_agent(IceConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        agent.set_event_callback(Arc::new(move |event| sink.lock().push(event)));

        agent.gather_candidates().await.unwrap();
        agent.close().await.unwrap();
        assert_eq!(agent.get_state(), IceState::Closed);
        assert!(agent.get_local_candidates().is_empty());

        assert!(matches!(agent.gather_candidates().await, Err(NatError::InvalidState(_))));
        assert!(matches!(agent.add_remote_candidate(remote_host()), Err(NatError::InvalidState(_))));
        assert!(matches!(
            agent.set_remote_credentials("abcd", "abcdefghijklmnopqrstuvwx"),
            Err(NatError::InvalidState(_))
        ));
        assert!(matches!(agent.start_checks(), Err(NatError::InvalidState(_))));
        assert!(matches!(agent.send(1, b"x").await, Err(NatError::InvalidState(_))));
        assert!(matches!(
            agent.process_incoming(b"x", "192.168.1.6:50000".parse().unwrap()),
            Err(NatError::InvalidState(_))
        ));
        assert!(agent.close().await.is_ok());

        let events = events.lock();
        assert_eq!(events.last(), Some(&IceEvent::StateChanged(IceState::Closed)));
        assert_eq!(
            events.iter().filter(|e| **e == IceEvent::StateChanged(IceState::Closed)).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_gathering_events_and_zero_candidates() {
        let net = MemoryNetwork::new();
        let platform = net.platform(&["127.0.0.1".parse().unwrap()]);
        let agent = IceAgent::with_platform(IceConfig::default(), platform).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        agent.set_event_callback(Arc::new(move |event| sink.lock().push(event)));

        agent.gather_candidates().await.unwrap();
        assert_eq!(agent.get_state(), IceState::Failed);
        assert_eq!(
            *events.lock(),
            vec![
                IceEvent::StateChanged(IceState::Gathering),
                IceEvent::StateChanged(IceState::Failed)
            ]
        );
    }

    #[tokio::test]
    async fn test_process_incoming_delivers_data() {
        let (agent, _net) = lan_agent(IceConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        agent.set_event_callback(Arc::new(move |event| sink.lock().push(event)));
        agent.gather_candidates().await.unwrap();

        let from: SocketAddr = "192.168.1.6:50000".parse().unwrap();
        agent.process_incoming(b"media", from).unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let data = events.lock().iter().find_map(|e| match e {
                    IceEvent::Data { component_id, from, payload } => Some((*component_id, *from, payload.clone())),
                    _ => None,
                });
                if let Some(data) = data {
                    return data;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(delivered, (1, from, Bytes::from_static(b"media")));
        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_candidate_validation() {
        let (agent, _net) = lan_agent(IceConfig::default());
        let mut tcp = remote_host();
        tcp.transport = TransportProtocol::Tcp;
        assert!(matches!(agent.add_remote_candidate(tcp), Err(NatError::NotSupported(_))));

        let rtcp = Candidate::new_host("192.168.1.6:50001".parse().unwrap(), 2, 65535);
        assert!(matches!(agent.add_remote_candidate(rtcp), Err(NatError::InvalidParam(_))));

        agent.add_remote_candidate(remote_host()).unwrap();
        agent.add_remote_candidate(remote_host()).unwrap();
        assert_eq!(agent.get_remote_candidates().len(), 1);

        assert!(matches!(agent.set_remote_credentials("a", "b"), Err(NatError::InvalidParam(_))));
    }
}
