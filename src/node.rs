//! # Routing Facade
//!
//! [`Routing`] is the public surface of the core: join the overlay, send
//! direct and group messages, answer membership questions, and feed the
//! transport's callbacks into the forwarder, cache and pending-response
//! registry.
//!
//! ## Lifecycle
//!
//! `initialised → joining → running → stopping → stopped`. Sends are
//! rejected outside `running`; shutdown resolves every outstanding
//! response with a cancellation marker, rewrites the bootstrap file and
//! disconnects the transport.
//!
//! ## Wiring
//!
//! One event loop task owns inbound traffic: transport events and
//! internal commands (key deliveries, validated peers) are multiplexed
//! over channels, so table writes always happen from one place. Caller
//! callbacks arrive through [`Functors`] at join time; the asynchronous
//! key lookup must never block the core, so key deliveries re-enter the
//! loop as commands.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::bootstrap::{BootstrapContact, BootstrapFile};
use crate::cache::{CacheManager, HaveCacheDataFn, StoreCacheDataFn};
use crate::client_table::ClientTable;
use crate::config::Parameters;
use crate::error::RoutingError;
use crate::forwarder::Forwarder;
use crate::id::NodeId;
use crate::matrix::GroupMatrix;
use crate::message::{
    deserialize_bounded, serialize, ConnectRequest, ConnectResponse, FindNodesRequest,
    FindNodesResponse, GetGroupResponse, Message, MessageKind, MAX_PAYLOAD_SIZE,
};
use crate::peer::{ConnectionState, EndpointPair, NatType, PeerInfo};
use crate::table::{GroupRangeStatus, RoutingTable};
use crate::timer::{ResponseEvent, ResponseHandler, ResponseRegistry};
use crate::transport::{Transport, TransportEvent};

/// Hands a payload back toward the requester of a delivered message.
pub type ReplyFn = Box<dyn FnOnce(Vec<u8>) + Send>;
/// Upper-layer delivery: payload plus a reply handle when one is wanted.
pub type MessageReceivedFn = Box<dyn Fn(Vec<u8>, Option<ReplyFn>) + Send + Sync>;
pub type NetworkStatusFn = Box<dyn Fn(u8) + Send + Sync>;
pub type CloseNodeReplacedFn = Box<dyn Fn(Vec<PeerInfo>) + Send + Sync>;
/// Completion for an asynchronous key lookup.
pub type KeyDeliveryFn = Box<dyn FnOnce(Option<VerifyingKey>) + Send>;
/// Asynchronous key lookup; implementations must not block.
pub type RequestPublicKeyFn = Box<dyn Fn(NodeId, KeyDeliveryFn) + Send + Sync>;

/// Caller-provided callbacks, supplied once at join.
#[derive(Default)]
pub struct Functors {
    pub message_received: Option<MessageReceivedFn>,
    pub network_status: Option<NetworkStatusFn>,
    pub close_node_replaced: Option<CloseNodeReplacedFn>,
    pub request_public_key: Option<RequestPublicKeyFn>,
    pub store_cache_data: Option<StoreCacheDataFn>,
    pub have_cache_data: Option<HaveCacheDataFn>,
}

/// The four typed send shapes; each entry point validates its claim and
/// feeds the one common dispatch routine.
pub enum TypedMessage {
    SingleToSingle {
        destination: NodeId,
        payload: Vec<u8>,
        cacheable: bool,
    },
    SingleToGroup {
        group_id: NodeId,
        payload: Vec<u8>,
        cacheable: bool,
    },
    GroupToSingle {
        /// Group the sender claims to speak for; must hold locally.
        group_claim: NodeId,
        destination: NodeId,
        payload: Vec<u8>,
    },
    GroupToGroup {
        group_claim: NodeId,
        group_id: NodeId,
        payload: Vec<u8>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Initialised,
    Joining,
    Running,
    Stopping,
    Stopped,
}

enum Cmd {
    /// Key lookup finished for a peer we want to connect to.
    KeyForConnect {
        id: NodeId,
        addr: SocketAddr,
        key: Option<VerifyingKey>,
    },
    /// Key lookup finished for an inbound connect request.
    KeyForAccept {
        request: Box<Message>,
        connect: ConnectRequest,
        key: Option<VerifyingKey>,
    },
    /// A connect handshake we initiated completed.
    PeerValidated { peer: Box<PeerInfo> },
    Stop,
}

struct Inner<T: Transport> {
    own_id: NodeId,
    keypair: Option<SigningKey>,
    params: Parameters,
    state: RwLock<LifecycleState>,
    table: Arc<RwLock<RoutingTable>>,
    clients: Arc<RwLock<ClientTable>>,
    matrix: RwLock<GroupMatrix>,
    registry: ResponseRegistry,
    cache: Arc<CacheManager>,
    forwarder: Forwarder<T>,
    transport: Arc<T>,
    functors: RwLock<Arc<Functors>>,
    our_endpoints: RwLock<EndpointPair>,
    nat_type: RwLock<NatType>,
    bootstrap_file: Option<BootstrapFile>,
    cmd_tx: RwLock<Option<mpsc::Sender<Cmd>>>,
}

pub struct Routing<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Routing<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Routing<T> {
    /// Build a facade around an id, optional signing key and transport.
    /// Nothing touches the network until [`Routing::join`].
    pub fn new(
        own_id: NodeId,
        keypair: Option<SigningKey>,
        params: Parameters,
        transport: T,
        bootstrap_path: Option<PathBuf>,
    ) -> Self {
        let transport = Arc::new(transport);
        let table = Arc::new(RwLock::new(RoutingTable::new(own_id, params.clone())));
        let clients = Arc::new(RwLock::new(ClientTable::new(own_id, &params)));
        let registry = ResponseRegistry::new();
        let cache = Arc::new(CacheManager::new(own_id, params.max_cache_bytes));
        let forwarder = Forwarder::new(
            own_id,
            params.clone(),
            table.clone(),
            clients.clone(),
            registry.clone(),
            transport.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                own_id,
                keypair,
                matrix: RwLock::new(GroupMatrix::new(own_id, params.group_size)),
                state: RwLock::new(LifecycleState::Initialised),
                table,
                clients,
                registry,
                cache,
                forwarder,
                transport,
                functors: RwLock::new(Arc::new(Functors::default())),
                our_endpoints: RwLock::new(EndpointPair::unspecified()),
                nat_type: RwLock::new(NatType::Unknown),
                bootstrap_file: bootstrap_path.map(BootstrapFile::new),
                cmd_tx: RwLock::new(None),
                params,
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.own_id
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.inner.state.read()
    }

    /// Network health: table fill as a 0–100 percentage.
    pub fn network_status(&self) -> u8 {
        self.inner
            .params
            .network_status(self.inner.table.read().size())
    }

    /// Join the overlay: bootstrap the transport against the supplied and
    /// persisted endpoints, then seed the table through the first
    /// reachable one. With no endpoints at all this node starts a new
    /// network.
    pub async fn join(&self, functors: Functors, peer_endpoints: Vec<SocketAddr>) -> Result<()> {
        self.begin_join(functors)?;

        let mut endpoints = peer_endpoints;
        if let Some(file) = &self.inner.bootstrap_file {
            for contact in file.read() {
                if !endpoints.contains(&contact.endpoint) {
                    endpoints.push(contact.endpoint);
                }
            }
        }

        let events_rx = match self.start_transport(&endpoints, None).await {
            Ok(events_rx) => events_rx,
            Err(e) => {
                self.abort_join().await;
                return Err(e);
            }
        };
        self.start_event_loop(events_rx);

        if endpoints.is_empty() {
            info!(id = %self.inner.own_id, "no bootstrap contacts, starting a new network");
            *self.inner.state.write() = LifecycleState::Running;
            self.publish_network_status();
            return Ok(());
        }

        let nodes = match self.bootstrap_lookup(endpoints[0]).await {
            Ok(nodes) => nodes,
            Err(e) => {
                self.abort_join().await;
                return Err(e);
            }
        };
        info!(count = nodes.len(), "bootstrap lookup found peers");
        *self.inner.state.write() = LifecycleState::Running;
        for (id, addr) in nodes {
            initiate_connect(&self.inner, id, addr);
        }
        Ok(())
    }

    /// A failed join is terminal: the lifecycle only moves forward, so
    /// the node steps through stopping to stopped and its event loop is
    /// torn down rather than left behind for a retry. Joining again
    /// means constructing a fresh facade.
    async fn abort_join(&self) {
        *self.inner.state.write() = LifecycleState::Stopping;
        self.inner.registry.resolve_all_cancelled();
        let cmd_tx = self.inner.cmd_tx.write().take();
        if let Some(tx) = cmd_tx {
            let _ = tx.send(Cmd::Stop).await;
        }
        *self.inner.state.write() = LifecycleState::Stopped;
    }

    /// Seed a brand new two-node network: connect straight to `peer`
    /// without any lookup. The peer record must carry its key.
    pub async fn zero_state_join(
        &self,
        functors: Functors,
        local_endpoint: SocketAddr,
        peer_endpoint: SocketAddr,
        peer: PeerInfo,
    ) -> Result<()> {
        if peer.public_key.is_none() {
            return Err(anyhow!(RoutingError::InvalidArgument(
                "zero-state peer needs a public key"
            )));
        }
        self.begin_join(functors)?;

        let events_rx = match self
            .start_transport(&[peer_endpoint], Some(local_endpoint))
            .await
        {
            Ok(events_rx) => events_rx,
            Err(e) => {
                self.abort_join().await;
                return Err(e);
            }
        };
        self.start_event_loop(events_rx);

        let our_local = self.inner.our_endpoints.read().local;
        if let Err(e) = self
            .inner
            .transport
            .add(
                our_local,
                peer_endpoint,
                self.inner.own_id.as_bytes().to_vec(),
            )
            .await
        {
            self.abort_join().await;
            return Err(e.context("zero-state connect failed"));
        }

        add_peer(&self.inner, peer.with_state(ConnectionState::Connected));
        *self.inner.state.write() = LifecycleState::Running;
        Ok(())
    }

    /// Send to one known destination. A response handler registers a
    /// single-response pending entry before anything leaves this node.
    pub async fn send_direct(
        &self,
        destination: NodeId,
        payload: Vec<u8>,
        cacheable: bool,
        response: Option<ResponseHandler>,
    ) -> Result<(), RoutingError> {
        if destination == self.inner.own_id {
            return Err(RoutingError::InvalidArgument("direct send to own id"));
        }
        let msg = Message::request(MessageKind::Data, self.inner.own_id, destination)
            .with_payload(payload)
            .with_cacheable(cacheable);
        self.dispatch(msg, 1, response).await
    }

    /// Send to the `group_size` peers network-wide closest to `group_id`.
    /// The handler, if any, fires once per member response.
    pub async fn send_group(
        &self,
        group_id: NodeId,
        payload: Vec<u8>,
        cacheable: bool,
        response: Option<ResponseHandler>,
    ) -> Result<(), RoutingError> {
        let msg = Message::request(MessageKind::Data, self.inner.own_id, group_id)
            .with_payload(payload)
            .with_cacheable(cacheable)
            .with_group_destination();
        let expected = self.inner.params.group_size;
        self.dispatch(msg, expected, response).await
    }

    /// Typed send API: thin validators over the common dispatch routine.
    pub async fn send(
        &self,
        message: TypedMessage,
        response: Option<ResponseHandler>,
    ) -> Result<(), RoutingError> {
        match message {
            TypedMessage::SingleToSingle {
                destination,
                payload,
                cacheable,
            } => {
                self.send_direct(destination, payload, cacheable, response)
                    .await
            }
            TypedMessage::SingleToGroup {
                group_id,
                payload,
                cacheable,
            } => {
                self.send_group(group_id, payload, cacheable, response)
                    .await
            }
            TypedMessage::GroupToSingle {
                group_claim,
                destination,
                payload,
            } => {
                self.validate_group_claim(&group_claim)?;
                if destination == self.inner.own_id {
                    return Err(RoutingError::InvalidArgument("direct send to own id"));
                }
                let mut msg = Message::request(MessageKind::Data, self.inner.own_id, destination)
                    .with_payload(payload);
                msg.source_group = true;
                self.dispatch(msg, 1, response).await
            }
            TypedMessage::GroupToGroup {
                group_claim,
                group_id,
                payload,
            } => {
                self.validate_group_claim(&group_claim)?;
                let mut msg = Message::request(MessageKind::Data, self.inner.own_id, group_id)
                    .with_payload(payload)
                    .with_group_destination();
                msg.source_group = true;
                let expected = self.inner.params.group_size;
                self.dispatch(msg, expected, response).await
            }
        }
    }

    /// Resolve the members of `group_id`'s group by asking the group
    /// itself. Resolves early once `group_size` members answered, or at
    /// the deadline with whoever did.
    pub async fn get_group(&self, group_id: NodeId) -> Result<Vec<NodeId>, RoutingError> {
        self.ensure_running()?;
        let group_size = self.inner.params.group_size;
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);
        let mut members: Vec<NodeId> = Vec::new();

        let handler: ResponseHandler = Box::new(move |event| match event {
            ResponseEvent::Payload(msg) => {
                if let Ok(resp) = deserialize_bounded::<GetGroupResponse>(&msg.payload) {
                    if !members.contains(&resp.member) {
                        members.push(resp.member);
                    }
                }
                if members.len() >= group_size {
                    if let Some(tx) = done_tx.take() {
                        let _ = tx.send(Ok(std::mem::take(&mut members)));
                    }
                }
            }
            ResponseEvent::Timeout => {
                if let Some(tx) = done_tx.take() {
                    let result = if members.is_empty() {
                        Err(RoutingError::Timeout)
                    } else {
                        Ok(std::mem::take(&mut members))
                    };
                    let _ = tx.send(result);
                }
            }
            ResponseEvent::Cancelled => {
                if let Some(tx) = done_tx.take() {
                    let _ = tx.send(Err(RoutingError::Cancelled));
                }
            }
            ResponseEvent::Failed(e) => {
                if let Some(tx) = done_tx.take() {
                    let _ = tx.send(Err(e));
                }
            }
        });

        let task = self.inner.registry.add_task(
            self.inner.params.default_response_timeout,
            group_size,
            handler,
        );
        let msg = Message::request(MessageKind::GetGroup, self.inner.own_id, group_id)
            .with_group_destination()
            .with_response_id(task);
        if let Some(local) = self.inner.forwarder.route(msg).await {
            deliver_local(&self.inner, local).await;
        }
        done_rx.await.map_err(|_| RoutingError::Cancelled)?
    }

    /// Where `node_id` stands relative to `group_id`'s group.
    pub fn is_node_id_in_group_range(
        &self,
        group_id: &NodeId,
        node_id: &NodeId,
    ) -> GroupRangeStatus {
        self.inner
            .table
            .read()
            .is_node_id_in_group_range(group_id, node_id)
    }

    /// Where this node stands relative to `group_id`'s group.
    pub fn own_group_range_status(&self, group_id: &NodeId) -> GroupRangeStatus {
        self.inner.table.read().own_group_range_status(group_id)
    }

    /// Is this node closer to `target` than every peer it knows?
    pub fn closest_to_id(&self, target: &NodeId) -> bool {
        self.inner.table.read().closest_to(target)
    }

    /// Judge a claimed group sender against the neighbourhood's reported
    /// close sets.
    pub fn estimate_in_group(&self, sender: &NodeId, info_id: &NodeId) -> bool {
        self.inner.matrix.read().estimate_in_group(sender, info_id)
    }

    /// Known as a vault: in the routing table or anywhere in the matrix.
    pub fn is_connected_vault(&self, id: &NodeId) -> bool {
        self.inner.table.read().contains(id) || self.inner.matrix.read().is_connected(id)
    }

    /// Attached to this node as a client.
    pub fn is_connected_client(&self, id: &NodeId) -> bool {
        self.inner.clients.read().contains(id)
    }

    /// The current close neighbourhood, closest first.
    pub fn closest_nodes(&self) -> Vec<PeerInfo> {
        self.inner.table.read().closest_nodes_snapshot()
    }

    /// A random connected peer outside the close neighbourhood.
    pub fn random_connected_node(&self) -> Option<NodeId> {
        self.inner
            .table
            .read()
            .random_connected_node()
            .map(|p| p.id)
    }

    /// Stop accepting sends, cancel every outstanding response, persist
    /// the bootstrap contacts and disconnect the transport.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.write();
            if matches!(*state, LifecycleState::Stopping | LifecycleState::Stopped) {
                return;
            }
            *state = LifecycleState::Stopping;
        }
        info!(id = %self.inner.own_id, "shutting down");

        self.inner.registry.resolve_all_cancelled();

        let peers: Vec<PeerInfo> = self.inner.table.read().peers().cloned().collect();
        if let Some(file) = &self.inner.bootstrap_file {
            // Table order is closest-first, which is also most useful
            // first for the next join.
            let contacts: Vec<BootstrapContact> = peers
                .iter()
                .map(|p| BootstrapContact {
                    id: p.id,
                    endpoint: p.send_endpoint(),
                })
                .collect();
            if let Err(e) = file.write(&contacts) {
                warn!(error = %e, "bootstrap rewrite failed");
            }
        }
        for peer in &peers {
            self.inner.transport.remove(peer.send_endpoint()).await;
        }

        let cmd_tx = self.inner.cmd_tx.write().take();
        if let Some(tx) = cmd_tx {
            let _ = tx.send(Cmd::Stop).await;
        }
        *self.inner.state.write() = LifecycleState::Stopped;
    }

    fn ensure_running(&self) -> Result<(), RoutingError> {
        match *self.inner.state.read() {
            LifecycleState::Running => Ok(()),
            LifecycleState::Initialised | LifecycleState::Joining => Err(RoutingError::NotJoined),
            LifecycleState::Stopping | LifecycleState::Stopped => Err(RoutingError::Cancelled),
        }
    }

    fn validate_group_claim(&self, group_claim: &NodeId) -> Result<(), RoutingError> {
        if self.inner.table.read().own_group_range_status(group_claim)
            != GroupRangeStatus::InRange
        {
            return Err(RoutingError::InvalidArgument(
                "sender is not in the claimed group",
            ));
        }
        Ok(())
    }

    /// Common send routine behind every public entry point.
    async fn dispatch(
        &self,
        mut msg: Message,
        expected: usize,
        response: Option<ResponseHandler>,
    ) -> Result<(), RoutingError> {
        self.ensure_running()?;
        if msg.destination.is_zero() {
            return Err(RoutingError::InvalidArgument("zero destination"));
        }
        if msg.payload.is_empty() {
            return Err(RoutingError::InvalidArgument("empty payload"));
        }
        if msg.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RoutingError::InvalidArgument("payload too large"));
        }

        if let Some(handler) = response {
            let task = self.inner.registry.add_task(
                self.inner.params.default_response_timeout,
                expected,
                handler,
            );
            msg.response_id = Some(task);
        }
        if let Some(keypair) = &self.inner.keypair {
            msg.signature = Some(keypair.sign(&msg.payload).to_vec());
        }

        trace!(
            destination = %msg.destination,
            group = msg.group,
            response = msg.response_id.is_some(),
            "dispatching message"
        );
        if let Some(local) = self.inner.forwarder.route(msg).await {
            deliver_local(&self.inner, local).await;
        }
        Ok(())
    }

    fn begin_join(&self, mut functors: Functors) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            if *state != LifecycleState::Initialised {
                return Err(anyhow!(RoutingError::InvalidArgument(
                    "join attempted twice"
                )));
            }
            *state = LifecycleState::Joining;
        }
        self.inner.cache.initialise_functors(
            functors.store_cache_data.take(),
            functors.have_cache_data.take(),
        );
        *self.inner.functors.write() = Arc::new(functors);
        Ok(())
    }

    async fn start_transport(
        &self,
        endpoints: &[SocketAddr],
        local: Option<SocketAddr>,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (endpoint_pair, nat_type) = self
            .inner
            .transport
            .bootstrap(endpoints, events_tx, local)
            .await
            .context("transport bootstrap failed")?;
        debug!(
            local = %endpoint_pair.local,
            external = %endpoint_pair.external,
            ?nat_type,
            "transport bootstrapped"
        );
        *self.inner.our_endpoints.write() = endpoint_pair;
        *self.inner.nat_type.write() = nat_type;
        Ok(events_rx)
    }

    fn start_event_loop(&self, events_rx: mpsc::Receiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        *self.inner.cmd_tx.write() = Some(cmd_tx);
        tokio::spawn(run_loop(self.inner.clone(), events_rx, cmd_rx));
    }

    /// One `FindNodes` round through a bootstrap endpoint, as a relay
    /// request: the seed does not know us yet, so the reply comes back on
    /// our external endpoint.
    async fn bootstrap_lookup(&self, seed: SocketAddr) -> Result<Vec<(NodeId, SocketAddr)>> {
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);
        let handler: ResponseHandler = Box::new(move |event| {
            let result = match event {
                ResponseEvent::Payload(msg) => {
                    deserialize_bounded::<FindNodesResponse>(&msg.payload)
                        .map(|r| r.nodes)
                        .map_err(|_| {
                            RoutingError::Transport("malformed find-nodes response".into())
                        })
                }
                ResponseEvent::Timeout => Err(RoutingError::Timeout),
                ResponseEvent::Cancelled => Err(RoutingError::Cancelled),
                ResponseEvent::Failed(e) => Err(e),
            };
            if let Some(tx) = done_tx.take() {
                let _ = tx.send(result);
            }
        });
        let task =
            self.inner
                .registry
                .add_task(self.inner.params.default_response_timeout, 1, handler);

        let body = FindNodesRequest {
            target: self.inner.own_id,
            count: self.inner.params.closest_nodes_size,
        };
        let mut request =
            Message::request(MessageKind::FindNodes, self.inner.own_id, self.inner.own_id)
                .with_payload(serialize(&body).context("encoding find-nodes request")?)
                .with_response_id(task);
        request.relay_endpoint = Some(self.inner.our_endpoints.read().external);

        self.inner
            .transport
            .send(seed, request.encode().context("encoding bootstrap request")?)
            .await
            .context("bootstrap send failed")?;

        match done_rx.await {
            Ok(Ok(nodes)) => Ok(nodes),
            Ok(Err(e)) => Err(anyhow!(e).context("bootstrap lookup failed")),
            Err(_) => Err(anyhow!("bootstrap lookup abandoned")),
        }
    }

    fn publish_network_status(&self) {
        let status = self.network_status();
        let functors = self.inner.functors.read().clone();
        if let Some(cb) = functors.network_status.as_ref() {
            cb(status);
        }
    }
}

// ============================================================================
// Event loop
// ============================================================================

async fn run_loop<T: Transport>(
    inner: Arc<Inner<T>>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut cmds: mpsc::Receiver<Cmd>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Message(bytes)) => {
                    handle_wire_message(&inner, bytes).await;
                }
                Some(TransportEvent::ConnectionLost(endpoint)) => {
                    handle_connection_lost(&inner, endpoint).await;
                }
                None => break,
            },
            cmd = cmds.recv() => match cmd {
                Some(Cmd::KeyForConnect { id, addr, key }) => {
                    handle_key_for_connect(&inner, id, addr, key).await;
                }
                Some(Cmd::KeyForAccept { request, connect, key }) => {
                    handle_key_for_accept(&inner, *request, connect, key).await;
                }
                Some(Cmd::PeerValidated { peer }) => {
                    add_peer(&inner, *peer);
                }
                Some(Cmd::Stop) | None => break,
            },
        }
    }
    debug!(id = %inner.own_id, "event loop stopped");
}

async fn handle_wire_message<T: Transport>(inner: &Arc<Inner<T>>, bytes: Vec<u8>) {
    let mut msg = match Message::decode(&bytes) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, len = bytes.len(), "undecodable message dropped");
            return;
        }
    };

    // Responses addressed to us resolve pending entries; cacheable ones
    // also feed the cache on the way past.
    if msg.is_response() && msg.destination == inner.own_id {
        inner.cache.add_to_cache(&msg);
        match msg.response_id {
            Some(id) => inner.registry.execute_task(id, msg),
            None => trace!("uncorrelated response dropped"),
        }
        return;
    }

    // Relayed responses feed the cache too: that is what makes the cache
    // opportunistic rather than endpoint-only.
    if msg.is_response() {
        inner.cache.add_to_cache(&msg);
    }

    // A cacheable request we can answer here never travels further: the
    // rewrite turns it into the response, which then routes back.
    if msg.is_request() && inner.cache.handle_get_from_cache(&mut msg) {
        if let Some(local) = inner.forwarder.route(msg).await {
            deliver_local(inner, local).await;
        }
        return;
    }

    if let Some(delivered) = inner.forwarder.route(msg).await {
        deliver_local(inner, delivered).await;
    }
}

/// A message classified as ours: answer protocol requests, hand data to
/// the upper layer.
async fn deliver_local<T: Transport>(inner: &Arc<Inner<T>>, msg: Message) {
    if msg.is_response() {
        // Group copies of responses can land here; correlate or drop.
        if let Some(id) = msg.response_id {
            inner.registry.execute_task(id, msg);
        }
        return;
    }

    match msg.kind {
        MessageKind::Ping => {
            respond(inner, &msg, Vec::new()).await;
        }
        MessageKind::FindNodes => {
            let payload = deserialize_bounded::<FindNodesRequest>(&msg.payload)
                .ok()
                .and_then(|req| {
                    // This node answers because it is among the closest it
                    // knows to the target, so it belongs on the list.
                    let mut nodes: Vec<(NodeId, SocketAddr)> = inner
                        .table
                        .read()
                        .get_closest_nodes(&req.target, req.count)
                        .into_iter()
                        .filter(|p| p.id != msg.source)
                        .map(|p| (p.id, p.send_endpoint()))
                        .collect();
                    nodes.truncate(req.count.saturating_sub(1));
                    nodes.push((inner.own_id, inner.our_endpoints.read().external));
                    serialize(&FindNodesResponse { nodes }).ok()
                });
            match payload {
                Some(payload) => respond(inner, &msg, payload).await,
                None => debug!(source = %msg.source, "malformed find-nodes request dropped"),
            }
        }
        MessageKind::GetGroup => {
            match serialize(&GetGroupResponse {
                member: inner.own_id,
            }) {
                Ok(payload) => respond(inner, &msg, payload).await,
                Err(e) => warn!(error = %e, "get-group response encode failed"),
            }
        }
        MessageKind::Connect => {
            accept_connect(inner, msg);
        }
        MessageKind::Data => {
            if !verify_signature(inner, &msg) {
                warn!(source = %msg.source, "data message failed signature check, dropped");
                return;
            }
            let functors = inner.functors.read().clone();
            match functors.message_received.as_ref() {
                Some(cb) => {
                    let reply = build_reply(inner, &msg);
                    cb(msg.payload, reply);
                }
                None => trace!("no message handler installed, data dropped"),
            }
        }
    }
}

/// Messages claiming a source we hold a key for must carry a valid
/// signature over the payload. Unknown sources pass: their keys arrive
/// through the caller's lookup, not the wire.
fn verify_signature<T: Transport>(inner: &Arc<Inner<T>>, msg: &Message) -> bool {
    let table = inner.table.read();
    let Some(peer) = table.find(&msg.source) else {
        return true;
    };
    let Some(key) = peer.public_key else {
        return true;
    };
    match &msg.signature {
        Some(bytes) => match Signature::from_slice(bytes) {
            Ok(signature) => key.verify(&msg.payload, &signature).is_ok(),
            Err(_) => false,
        },
        None => true,
    }
}

/// Reply handle for delivered requests that want one. A group member
/// that is also the sender answers itself: the response then resolves
/// locally instead of touching the wire.
fn build_reply<T: Transport>(inner: &Arc<Inner<T>>, msg: &Message) -> Option<ReplyFn> {
    msg.response_id?;
    let inner = inner.clone();
    let request = msg.clone();
    Some(Box::new(move |payload: Vec<u8>| {
        tokio::spawn(async move {
            send_response(&inner, &request, payload).await;
        });
    }))
}

async fn respond<T: Transport>(inner: &Arc<Inner<T>>, request: &Message, payload: Vec<u8>) {
    if request.response_id.is_none() {
        return;
    }
    send_response(inner, request, payload).await;
}

async fn send_response<T: Transport>(inner: &Arc<Inner<T>>, request: &Message, payload: Vec<u8>) {
    let response = request.to_response(inner.own_id, payload);
    // Routing hands the response back when the requester is this node;
    // it then resolves the pending entry directly.
    if let Some(local) = inner.forwarder.route(response).await {
        if let Some(id) = local.response_id {
            inner.registry.execute_task(id, local);
        }
    }
}

/// Inbound connect: kick off the asynchronous key lookup; admission
/// continues on the event loop when the key arrives.
fn accept_connect<T: Transport>(inner: &Arc<Inner<T>>, msg: Message) {
    let connect = match deserialize_bounded::<ConnectRequest>(&msg.payload) {
        Ok(connect) => connect,
        Err(e) => {
            debug!(source = %msg.source, error = %e, "malformed connect request dropped");
            return;
        }
    };
    if connect.requester != msg.source && !msg.source.is_zero() {
        debug!(source = %msg.source, "connect requester does not match source, dropped");
        return;
    }

    let functors = inner.functors.read().clone();
    let Some(request_key) = functors.request_public_key.as_ref() else {
        warn!("no key lookup installed, connect refused");
        return;
    };

    let cmd_tx = inner.cmd_tx.read().clone();
    let Some(cmd_tx) = cmd_tx else {
        return;
    };
    let requester = connect.requester;
    let mut slot = Some((Box::new(msg), connect));
    let deliver: KeyDeliveryFn = Box::new(move |key| {
        if let Some((request, connect)) = slot.take() {
            let _ = cmd_tx.try_send(Cmd::KeyForAccept {
                request,
                connect,
                key,
            });
        }
    });
    request_key(requester, deliver);
}

/// Start a connect handshake toward a discovered peer.
fn initiate_connect<T: Transport>(inner: &Arc<Inner<T>>, id: NodeId, addr: SocketAddr) {
    if id == inner.own_id || id.is_zero() || inner.table.read().contains(&id) {
        return;
    }
    let functors = inner.functors.read().clone();
    let Some(request_key) = functors.request_public_key.as_ref() else {
        warn!(peer = %id, "no key lookup installed, cannot connect");
        return;
    };
    let cmd_tx = inner.cmd_tx.read().clone();
    let Some(cmd_tx) = cmd_tx else {
        return;
    };
    trace!(peer = %id, %addr, "requesting key for discovered peer");
    let deliver: KeyDeliveryFn = Box::new(move |key| {
        let _ = cmd_tx.try_send(Cmd::KeyForConnect { id, addr, key });
    });
    request_key(id, deliver);
}

/// Key arrived for a peer we want: open the connection and send the
/// connect request; admission completes when the peer accepts.
async fn handle_key_for_connect<T: Transport>(
    inner: &Arc<Inner<T>>,
    id: NodeId,
    addr: SocketAddr,
    key: Option<VerifyingKey>,
) {
    let Some(key) = key else {
        debug!(peer = %id, "key lookup returned nothing, peer skipped");
        return;
    };
    let peer = PeerInfo::new(id, key).with_endpoints(EndpointPair::symmetric(addr));
    if !inner.table.read().check_node(&peer) {
        trace!(peer = %id, "admission would refuse peer, not connecting");
        return;
    }

    let (our_endpoint, _) = match inner.transport.get_available_endpoint(addr).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(peer = %id, error = %e, "no endpoint available for peer");
            return;
        }
    };
    if let Err(e) = inner
        .transport
        .add(our_endpoint.local, addr, inner.own_id.as_bytes().to_vec())
        .await
    {
        debug!(peer = %id, error = %e, "transport add failed");
        return;
    }

    // The peer's acceptance completes admission on the event loop.
    let cmd_tx = inner.cmd_tx.read().clone();
    let Some(cmd_tx) = cmd_tx else {
        return;
    };
    let mut pending = Some(peer);
    let handler: ResponseHandler = Box::new(move |event| {
        if let ResponseEvent::Payload(msg) = event {
            if let Ok(accept) = deserialize_bounded::<ConnectResponse>(&msg.payload) {
                if accept.accepted {
                    if let Some(mut peer) = pending.take() {
                        peer.dimension_list = accept.dimension_list;
                        peer.connection_state = ConnectionState::Connected;
                        let _ = cmd_tx.try_send(Cmd::PeerValidated {
                            peer: Box::new(peer),
                        });
                    }
                }
            }
        }
    });
    let task = inner
        .registry
        .add_task(inner.params.default_response_timeout, 1, handler);

    let close_ids: Vec<NodeId> = inner
        .table
        .read()
        .closest_nodes_snapshot()
        .iter()
        .map(|p| p.id)
        .collect();
    let body = ConnectRequest {
        requester: inner.own_id,
        endpoints: *inner.our_endpoints.read(),
        nat_type: *inner.nat_type.read(),
        dimension_list: close_ids,
        client: false,
    };
    let request = match serialize(&body) {
        Ok(payload) => {
            let mut request = Message::request(MessageKind::Connect, inner.own_id, id)
                .with_payload(payload)
                .with_response_id(task);
            // Until the peer admits us we are not routable; refusals come
            // back on the external endpoint.
            request.relay_endpoint = Some(inner.our_endpoints.read().external);
            request
        }
        Err(e) => {
            warn!(error = %e, "connect request encode failed");
            inner.registry.cancel_task(task);
            return;
        }
    };
    let bytes = match request.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "connect request encode failed");
            inner.registry.cancel_task(task);
            return;
        }
    };
    if let Err(e) = inner.transport.send(addr, bytes).await {
        debug!(peer = %id, error = %e, "connect request send failed");
        inner
            .registry
            .fail_task(task, RoutingError::Transport(e.to_string()));
    }
}

/// Key arrived for an inbound connect: admit and answer.
async fn handle_key_for_accept<T: Transport>(
    inner: &Arc<Inner<T>>,
    request: Message,
    connect: ConnectRequest,
    key: Option<VerifyingKey>,
) {
    let Some(key) = key else {
        debug!(peer = %connect.requester, "key lookup returned nothing, connect refused");
        return;
    };

    let mut peer = PeerInfo::new(connect.requester, key)
        .with_endpoints(connect.endpoints)
        .with_state(ConnectionState::Connected);
    peer.nat_type = connect.nat_type;
    peer.dimension_list = connect.dimension_list.clone();

    let accepted = if connect.client {
        inner.clients.write().add_client(peer.clone())
    } else if inner.table.read().check_node(&peer) {
        let peer_endpoint = peer.send_endpoint();
        match inner.transport.get_available_endpoint(peer_endpoint).await {
            Ok((our_endpoint, _)) => {
                if let Err(e) = inner
                    .transport
                    .add(
                        our_endpoint.local,
                        peer_endpoint,
                        inner.own_id.as_bytes().to_vec(),
                    )
                    .await
                {
                    debug!(peer = %peer.id, error = %e, "transport add failed");
                }
            }
            Err(e) => {
                debug!(peer = %peer.id, error = %e, "no endpoint available for peer");
            }
        }
        add_peer(inner, peer)
    } else {
        false
    };

    let close_ids: Vec<NodeId> = inner
        .table
        .read()
        .closest_nodes_snapshot()
        .iter()
        .map(|p| p.id)
        .collect();
    let body = ConnectResponse {
        accepted,
        responder: inner.own_id,
        endpoints: *inner.our_endpoints.read(),
        dimension_list: close_ids,
    };
    match serialize(&body) {
        Ok(payload) => respond(inner, &request, payload).await,
        Err(e) => warn!(error = %e, "connect response encode failed"),
    }
}

/// Admit a validated peer and publish the follow-on notifications.
fn add_peer<T: Transport>(inner: &Arc<Inner<T>>, peer: PeerInfo) -> bool {
    let (outcome, snapshot, size) = {
        let mut table = inner.table.write();
        let outcome = table.add_node(peer.clone());
        (outcome, table.closest_nodes_snapshot(), table.size())
    };
    if !outcome.added {
        trace!(peer = %peer.id, "peer not admitted");
        return false;
    }

    {
        let mut matrix = inner.matrix.write();
        matrix.update_row(peer.id, peer.dimension_list.clone());
        if let Some(evicted) = &outcome.evicted {
            matrix.remove_row(&evicted.id);
        }
    }
    if let Some(evicted) = outcome.evicted {
        let transport = inner.transport.clone();
        let endpoint = evicted.send_endpoint();
        tokio::spawn(async move {
            transport.remove(endpoint).await;
        });
    }

    let functors = inner.functors.read().clone();
    if outcome.close_set_changed {
        if let Some(cb) = functors.close_node_replaced.as_ref() {
            cb(snapshot);
        }
    }
    if let Some(cb) = functors.network_status.as_ref() {
        cb(inner.params.network_status(size));
    }
    info!(peer = %peer.id, size, "peer admitted");
    true
}

async fn handle_connection_lost<T: Transport>(inner: &Arc<Inner<T>>, endpoint: SocketAddr) {
    let peer_id = inner
        .table
        .read()
        .peers()
        .find(|p| p.send_endpoint() == endpoint)
        .map(|p| p.id);

    match peer_id {
        Some(id) => {
            let (outcome, snapshot, size) = {
                let mut table = inner.table.write();
                let outcome = table.drop_node(&id);
                (outcome, table.closest_nodes_snapshot(), table.size())
            };
            if outcome.removed.is_some() {
                inner.matrix.write().remove_row(&id);
                let functors = inner.functors.read().clone();
                if outcome.close_set_changed {
                    if let Some(cb) = functors.close_node_replaced.as_ref() {
                        cb(snapshot);
                    }
                }
                if let Some(cb) = functors.network_status.as_ref() {
                    cb(inner.params.network_status(size));
                }
                info!(peer = %id, %endpoint, size, "peer lost");
            }
        }
        None => {
            if inner.clients.write().drop_client_at(endpoint).is_some() {
                debug!(%endpoint, "client connection lost");
            }
        }
    }
}
