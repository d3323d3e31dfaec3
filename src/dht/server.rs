use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::error::DhtError;
use super::flood::FloodBarrier;
use super::id::{NodeId, ID_LEN};
use super::lookup::{LookupEvent, LookupOutcome, LookupState, LookupTermination};
use super::message::{DhtMessage, DhtQuery, DhtResponse, TransactionId, ERR_METHOD_UNKNOWN, ERR_PROTOCOL};
use super::node::Node;
use super::querier::Querier;
use super::routing::{InsertOutcome, RoutingTable};
use super::state;
use super::store::PeerStore;
use super::token::TokenManager;
use crate::constants::{
    ALPHA, BOOTSTRAP_NODES, DEFAULT_PORT, K, LOOKUP_CHANNEL_CAPACITY, LOOKUP_TIMEOUT,
    MAX_QUERY_ATTEMPTS, MAX_REFRESHES_PER_TICK, QUERY_TIMEOUT,
};

/// Receive buffer; comfortably above any KRPC datagram.
const RECV_BUF_LEN: usize = 65535;

/// Startup configuration for a [`DhtServer`].
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// UDP port to bind on all IPv4 interfaces; 0 picks an ephemeral port.
    pub port: u16,
    /// Entry points (`host:port`) used while the routing table is empty.
    pub bootstrap: Vec<String>,
    /// Whether announce_peer honors `implied_port`, registering the
    /// announcer under its UDP source port instead of the stated one.
    /// Clients behind NAT rely on this; defaults to on.
    pub honor_implied_port: bool,
    /// A previous [`DhtServer::dump_state`] blob to restore the node id
    /// and seed contacts from.
    pub state: Option<Vec<u8>>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bootstrap: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            honor_implied_port: true,
            state: None,
        }
    }
}

/// Which query a lookup repeats while it walks toward its target.
#[derive(Clone, Copy)]
enum LookupKind {
    Peers([u8; ID_LEN]),
    Nodes,
}

/// A BitTorrent Mainline DHT node ([BEP-5]).
///
/// One server owns one UDP socket plus all DHT state: the routing table,
/// the announce store, the token secrets, and the in-flight query table.
/// Everything is driven by [`run`](Self::run), which must be spawned once;
/// the other methods can then be called from anywhere.
///
/// # Examples
///
/// ```no_run
/// use rdht::dht::{DhtConfig, DhtServer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = DhtServer::bind(DhtConfig::default()).await?;
/// tokio::spawn(dht.clone().run());
///
/// dht.bootstrap().await?;
///
/// let info_hash = [0u8; 20];
/// let peers = dht.get_peers(info_hash).await?;
/// println!("found {} peers", peers.len());
///
/// dht.shutdown();
/// # Ok(())
/// # }
/// ```
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
pub struct DhtServer {
    socket: UdpSocket,
    our_id: NodeId,
    port: u16,
    honor_implied_port: bool,
    bootstrap: Vec<String>,
    routing: RwLock<RoutingTable>,
    querier: Mutex<Querier>,
    tokens: Mutex<TokenManager>,
    store: Mutex<PeerStore>,
    flood: Mutex<FloodBarrier>,
    shutdown: watch::Sender<bool>,
    /// Self-handle for the background tasks the server spawns.
    me: Weak<DhtServer>,
}

impl DhtServer {
    /// Binds the UDP socket and assembles the node. If `config.state`
    /// holds a readable snapshot, the node id and seed contacts come from
    /// it; otherwise a fresh random id is generated.
    pub async fn bind(config: DhtConfig) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
        let local_addr = socket.local_addr()?;
        let now = Instant::now();

        let (our_id, seeds) = match &config.state {
            Some(blob) => {
                let (id, contacts) = state::parse_state(blob);
                (id.unwrap_or_else(NodeId::generate), contacts)
            }
            None => (NodeId::generate(), Vec::new()),
        };

        let mut routing = RoutingTable::new(our_id, now);
        for node in seeds {
            routing.restore(node, now);
        }
        if !routing.is_empty() {
            info!(contacts = routing.node_count(), "restored routing seeds");
        }

        info!(addr = %local_addr, id = %our_id, "dht server bound");

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new_cyclic(|me| Self {
            socket,
            our_id,
            port: local_addr.port(),
            honor_implied_port: config.honor_implied_port,
            bootstrap: config.bootstrap,
            routing: RwLock::new(routing),
            querier: Mutex::new(Querier::new()),
            tokens: Mutex::new(TokenManager::new(now)),
            store: Mutex::new(PeerStore::new()),
            flood: Mutex::new(FloodBarrier::new()),
            shutdown,
            me: me.clone(),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    pub fn node_count(&self) -> usize {
        self.routing.read().node_count()
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops the event loop, wakes every pending query and lookup, and
    /// makes further API calls fail with [`DhtError::Cancelled`].
    /// In-flight queries are not cancelled on the wire; late answers are
    /// dropped as unknown transactions.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.querier.lock().abort_all();
        info!("dht server shut down");
    }

    // ========================================================================
    // Reactor
    // ========================================================================

    /// The event loop: receives datagrams, drives bucket refresh and
    /// liveness pings, and stops on [`shutdown`](Self::shutdown). Spawn
    /// this exactly once right after binding.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut shutdown_rx = self.shutdown.subscribe();

        let mut refresh = tokio::time::interval(crate::constants::REFRESH_INTERVAL);
        let mut liveness = tokio::time::interval(crate::constants::LIVENESS_PING_INTERVAL);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        refresh.tick().await;
        liveness.tick().await;

        loop {
            if self.is_shutdown() {
                break;
            }
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => warn!(error = %e, "socket receive failed"),
                    }
                }
                _ = refresh.tick() => self.refresh_stale_buckets(),
                _ = liveness.tick() => self.ping_questionable(),
                _ = shutdown_rx.changed() => break,
            }
        }

        debug!("event loop stopped");
    }

    /// Ingress path: flood barrier, then codec, then dispatch.
    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        if !self.flood.lock().admit(from.ip(), now) {
            trace!(%from, "packet rejected by flood barrier");
            return;
        }

        let message = match DhtMessage::parse(data) {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed packet");
                return;
            }
        };

        if message.response.is_some() {
            let reply_tx = self.querier.lock().complete(&message.transaction_id, from);
            if let Some(tx) = reply_tx {
                let _ = tx.try_send(message);
            }
            return;
        }

        if message.query.is_some() {
            self.handle_query(message, from).await;
        }
    }

    // ========================================================================
    // Responder
    // ========================================================================

    async fn handle_query(&self, message: DhtMessage, from: SocketAddr) {
        let now = Instant::now();
        let tid = message.transaction_id.clone();
        let (Some(query), Some(sender_id)) = (message.query, message.sender_id) else {
            return;
        };

        // Stumbled-upon nodes populate the table too.
        let sender = Node::new(sender_id, from).with_version(message.version);
        self.routing.write().note_query(&sender, now);

        let reply = match query {
            DhtQuery::Ping => DhtMessage::pong(tid, &self.our_id),

            DhtQuery::FindNode { target } => {
                let nodes = self.routing.read().closest(&target, K, now);
                DhtMessage::found_nodes(tid, &self.our_id, nodes)
            }

            DhtQuery::GetPeers { info_hash } => {
                let token = self.tokens.lock().generate(&from, now);
                let peers = self.store.lock().get(&info_hash, now);

                if peers.is_empty() {
                    let target = NodeId(info_hash);
                    let nodes = self.routing.read().closest(&target, K, now);
                    DhtMessage::found_peers(tid, &self.our_id, token, None, Some(nodes))
                } else {
                    DhtMessage::found_peers(tid, &self.our_id, token, Some(peers), None)
                }
            }

            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.tokens.lock().validate(&from, &token, now) {
                    debug!(%from, "announce_peer with invalid token");
                    DhtMessage::error(tid, ERR_PROTOCOL, "Invalid token")
                } else {
                    let peer_port = if implied_port && self.honor_implied_port {
                        from.port()
                    } else {
                        port
                    };
                    let peer = SocketAddr::new(from.ip(), peer_port);
                    self.store.lock().put(info_hash, peer, now);
                    trace!(%peer, "stored announced peer");
                    DhtMessage::announce_ack(tid, &self.our_id)
                }
            }

            DhtQuery::Unknown { method } => {
                debug!(%from, %method, "query with unknown method");
                DhtMessage::error(tid, ERR_METHOD_UNKNOWN, "Method Unknown")
            }
        };

        if let Err(e) = self.socket.send_to(&reply.to_bytes(), from).await {
            debug!(%from, error = %e, "failed to send reply");
        }
    }

    // ========================================================================
    // Querier
    // ========================================================================

    /// Sends one query, retrying with a fresh transaction id after each
    /// [`QUERY_TIMEOUT`], up to [`MAX_QUERY_ATTEMPTS`] attempts. Returns
    /// the raw response message and the round-trip time of the answered
    /// attempt.
    async fn send_query<F>(
        &self,
        addr: SocketAddr,
        build: F,
    ) -> Result<(DhtMessage, Duration), DhtError>
    where
        F: Fn(TransactionId) -> DhtMessage,
    {
        for _attempt in 0..MAX_QUERY_ATTEMPTS {
            let (tid, mut reply_rx) = self.querier.lock().register(addr)?;
            let message = build(tid.clone());
            let sent_at = Instant::now();

            if let Err(e) = self.socket.send_to(&message.to_bytes(), addr).await {
                self.querier.lock().forget(&tid);
                return Err(e.into());
            }

            match timeout(QUERY_TIMEOUT, reply_rx.recv()).await {
                Ok(Some(response)) => return Ok((response, sent_at.elapsed())),
                // Channel dropped by abort_all: the server is going away.
                Ok(None) => {
                    self.querier.lock().forget(&tid);
                    return Err(DhtError::Cancelled);
                }
                Err(_) => {
                    self.querier.lock().forget(&tid);
                    trace!(%addr, "query attempt timed out");
                }
            }
        }

        Err(DhtError::Timeout)
    }

    /// Pings an address and returns the responding contact with its
    /// round-trip time.
    pub async fn ping(&self, addr: SocketAddr) -> Result<(Node, Duration), DhtError> {
        let our_id = self.our_id;
        let (message, rtt) = self
            .send_query(addr, |tid| DhtMessage::ping(tid, &our_id))
            .await?;

        match message.response {
            Some(DhtResponse::Error { code, message }) => Err(DhtError::Remote { code, message }),
            Some(response) => {
                let id = response.sender_id().ok_or(DhtError::InvalidNodeId)?;
                Ok((Node::new(id, addr).with_version(message.version), rtt))
            }
            None => Err(DhtError::Malformed("response without payload".into())),
        }
    }

    /// Feeds a responding node into the routing table, kicking off the
    /// full-bucket liveness check when needed: the bucket head gets one
    /// ping, and the freshest of head and newcomer keeps the seat.
    fn integrate_response(&self, node: &Node, rtt: Option<Duration>) {
        let outcome = self.routing.write().note_response(node, rtt, Instant::now());

        if let InsertOutcome::Full { oldest } = outcome {
            let Some(server) = self.me.upgrade() else {
                return;
            };
            let candidate = node.clone();
            tokio::spawn(async move {
                let alive = server.ping(oldest.addr).await.is_ok();
                server
                    .routing
                    .write()
                    .resolve_full(&oldest.id, alive, candidate, Instant::now());
            });
        }
    }

    // ========================================================================
    // Lookup driver
    // ========================================================================

    async fn lookup_query(
        &self,
        queried: Option<Node>,
        addr: SocketAddr,
        target: NodeId,
        kind: LookupKind,
    ) -> (
        Option<Node>,
        SocketAddr,
        Result<(DhtMessage, Duration), DhtError>,
    ) {
        let our_id = self.our_id;
        let result = match kind {
            LookupKind::Peers(info_hash) => {
                self.send_query(addr, move |tid| DhtMessage::get_peers(tid, &our_id, info_hash))
                    .await
            }
            LookupKind::Nodes => {
                self.send_query(addr, move |tid| DhtMessage::find_node(tid, &our_id, target))
                    .await
            }
        };
        (queried, addr, result)
    }

    /// Runs one iterative lookup to completion: seeds from the routing
    /// table (or the bootstrap entry points on a cold table), keeps up to
    /// [`ALPHA`] queries in flight, streams fresh peers through `events`,
    /// and, given a `bt_port`, announces to the top responders afterwards.
    /// Returns the outcome and the number of successful announces.
    async fn drive_lookup(
        &self,
        target: NodeId,
        kind: LookupKind,
        bt_port: Option<u16>,
        events: Option<&mpsc::Sender<LookupEvent>>,
    ) -> (LookupOutcome, usize) {
        let started = Instant::now();
        let seeds = self.routing.read().closest(&target, K, started);
        let mut state = LookupState::new(target, self.our_id, seeds);
        let mut queries = FuturesUnordered::new();

        // Cold table: walk in through the bootstrap entry points, whose
        // node ids we learn from their first response.
        if self.routing.read().is_empty() {
            for addr in self.bootstrap_addrs().await {
                if state.visit(addr) {
                    queries.push(self.lookup_query(None, addr, target, kind));
                }
            }
        }

        let deadline = tokio::time::Instant::now() + LOOKUP_TIMEOUT;
        let timed_out = tokio::time::sleep_until(deadline);
        tokio::pin!(timed_out);
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut forced_termination = None;

        loop {
            if self.is_shutdown() {
                forced_termination = Some(LookupTermination::Cancelled);
                break;
            }

            for node in state.start_queries(ALPHA) {
                let addr = node.addr;
                queries.push(self.lookup_query(Some(node), addr, target, kind));
            }

            if queries.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut timed_out => {
                    debug!(%target, elapsed_ms = started.elapsed().as_millis() as u64, "lookup hit its deadline");
                    forced_termination = Some(LookupTermination::Timeout);
                    break;
                }
                _ = shutdown_rx.changed() => {
                    forced_termination = Some(LookupTermination::Cancelled);
                    break;
                }
                completed = queries.next() => {
                    let Some((queried, addr, result)) = completed else { continue };
                    let fresh = self.absorb_lookup_result(&mut state, queried, addr, result);
                    if !fresh.is_empty() {
                        if let Some(tx) = events {
                            let _ = tx.send(LookupEvent::Peers(fresh)).await;
                        }
                    }
                }
            }
        }

        let termination = forced_termination.unwrap_or_else(|| state.termination());

        let mut announced = 0;
        if let (Some(port), LookupKind::Peers(info_hash)) = (bt_port, kind) {
            if termination != LookupTermination::Cancelled {
                announced = self.announce_to_responders(&state, info_hash, port).await;
            }
        }

        debug!(
            %target,
            peers = state.peers().len(),
            announced,
            ?termination,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "lookup finished"
        );

        let outcome = state.into_outcome(termination);
        if let Some(tx) = events {
            let _ = tx.send(LookupEvent::Done(outcome.clone())).await;
        }
        (outcome, announced)
    }

    /// Applies one completed lookup query to the state machine and the
    /// routing table; returns any newly discovered peers.
    fn absorb_lookup_result(
        &self,
        state: &mut LookupState,
        queried: Option<Node>,
        addr: SocketAddr,
        result: Result<(DhtMessage, Duration), DhtError>,
    ) -> Vec<SocketAddr> {
        let response = match result {
            Ok((message, rtt)) => match message.response {
                Some(DhtResponse::Error { code, message: text }) => {
                    trace!(%addr, code, %text, "lookup query answered with error");
                    None
                }
                Some(response) => Some((response, message.version, rtt)),
                None => None,
            },
            Err(e) => {
                trace!(%addr, error = %e, "lookup query failed");
                None
            }
        };

        let Some((response, version, rtt)) = response else {
            if let Some(node) = &queried {
                self.routing.write().note_failure(&node.id, Instant::now());
            }
            state.on_failure();
            return Vec::new();
        };

        let Some(id) = response.sender_id() else {
            state.on_failure();
            return Vec::new();
        };
        let from = Node::new(id, addr).with_version(version);
        self.integrate_response(&from, Some(rtt));

        let (token, nodes, values) = match response {
            DhtResponse::GetPeers {
                token,
                peers,
                nodes,
                ..
            } => (
                Some(token).filter(|t| !t.is_empty()),
                nodes.unwrap_or_default(),
                peers.unwrap_or_default(),
            ),
            DhtResponse::FindNode { nodes, .. } => (None, nodes, Vec::new()),
            DhtResponse::Ping { .. } | DhtResponse::AnnouncePeer { .. } => {
                (None, Vec::new(), Vec::new())
            }
            DhtResponse::Error { .. } => unreachable!(),
        };

        state.on_response(&from, token, nodes, values)
    }

    /// Sends announce_peer to every top responder that issued a token.
    /// Failures are absorbed; callers only learn the success count.
    async fn announce_to_responders(
        &self,
        state: &LookupState,
        info_hash: [u8; ID_LEN],
        bt_port: u16,
    ) -> usize {
        let our_id = self.our_id;
        let announces = state.announce_targets().into_iter().map(|(node, token)| {
            let addr = node.addr;
            async move {
                self.send_query(addr, move |tid| {
                    DhtMessage::announce_peer(tid, &our_id, info_hash, bt_port, token.clone())
                })
                .await
                .map(|(message, _)| {
                    !matches!(message.response, Some(DhtResponse::Error { .. }))
                })
                .unwrap_or(false)
            }
        });

        futures::future::join_all(announces)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    // ========================================================================
    // Routing manager
    // ========================================================================

    /// Resolves the configured bootstrap contacts to socket addresses,
    /// keeping IPv4 results only.
    async fn bootstrap_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for entry in &self.bootstrap {
            match tokio::net::lookup_host(entry.as_str()).await {
                Ok(resolved) => addrs.extend(resolved.filter(|a| a.is_ipv4())),
                Err(e) => debug!(%entry, error = %e, "failed to resolve bootstrap contact"),
            }
        }
        addrs
    }

    /// Joins the network: pings the bootstrap contacts, then runs a
    /// lookup on our own id so the closest-neighborhood buckets fill up.
    pub async fn bootstrap(&self) -> Result<(), DhtError> {
        if self.is_shutdown() {
            return Err(DhtError::Cancelled);
        }
        info!("starting bootstrap");

        if self.routing.read().is_empty() {
            let addrs = self.bootstrap_addrs().await;
            let pings = addrs.iter().map(|addr| self.ping(*addr));
            for result in futures::future::join_all(pings).await {
                if let Ok((node, rtt)) = result {
                    self.integrate_response(&node, Some(rtt));
                }
            }
        }

        let (outcome, _) = self
            .drive_lookup(self.our_id, LookupKind::Nodes, None, None)
            .await;
        if outcome.termination == LookupTermination::Cancelled {
            return Err(DhtError::Cancelled);
        }

        let nodes = self.node_count();
        if nodes == 0 {
            warn!("bootstrap finished with an empty routing table");
        } else {
            info!(nodes, "bootstrap complete");
        }
        Ok(())
    }

    /// Refreshes buckets that have seen no traffic for a while by looking
    /// up a random id inside each one's distance band.
    fn refresh_stale_buckets(&self) {
        let now = Instant::now();
        let mut stale = self.routing.read().stale_buckets(now);
        stale.truncate(MAX_REFRESHES_PER_TICK);
        if stale.is_empty() {
            return;
        }

        debug!(buckets = stale.len(), "refreshing stale buckets");
        {
            let mut routing = self.routing.write();
            for &idx in &stale {
                routing.mark_refreshed(idx, now);
            }
        }

        let Some(server) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            for idx in stale {
                let Ok(target) = server.our_id.at_log_distance(idx as i32) else {
                    continue;
                };
                server
                    .drive_lookup(target, LookupKind::Nodes, None, None)
                    .await;
            }
        });
    }

    /// Pings the oldest questionable node of each bucket; a response
    /// refreshes it, repeated silence fails it out of the table.
    fn ping_questionable(&self) {
        let due = self.routing.write().ping_candidates(Instant::now());
        if due.is_empty() {
            return;
        }

        trace!(count = due.len(), "pinging questionable nodes");
        let Some(server) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let pings = due.iter().map(|node| {
                let server = &server;
                async move { (node, server.ping(node.addr).await) }
            });

            for (node, result) in futures::future::join_all(pings).await {
                match result {
                    Ok((ponger, rtt)) if ponger.id == node.id => {
                        server.integrate_response(&ponger, Some(rtt));
                    }
                    // Answered with an unexpected id: the address changed
                    // hands, so the old entry is as good as dead.
                    Ok(_) | Err(_) => {
                        server.routing.write().note_failure(&node.id, Instant::now());
                    }
                }
            }
        });
    }

    // ========================================================================
    // Public lookup API
    // ========================================================================

    /// Collects peers for an info-hash. Convenience wrapper that runs the
    /// lookup to completion and returns every peer found; an empty vec
    /// means the lookup converged without finding announcers (or timed
    /// out).
    pub async fn get_peers(
        &self,
        info_hash: [u8; ID_LEN],
    ) -> Result<Vec<SocketAddr>, DhtError> {
        if self.is_shutdown() {
            return Err(DhtError::Cancelled);
        }

        let (outcome, _) = self
            .drive_lookup(NodeId(info_hash), LookupKind::Peers(info_hash), None, None)
            .await;
        match outcome.termination {
            LookupTermination::Cancelled => Err(DhtError::Cancelled),
            _ => Ok(outcome.peers),
        }
    }

    /// Starts a peer lookup and returns a stream of [`LookupEvent`]s:
    /// zero or more incremental `Peers` batches in arrival order, then
    /// exactly one `Done` carrying the full result and the termination
    /// reason. With a `bt_port`, the top responders are sent
    /// announce_peer once the lookup settles.
    pub fn get_peers_streaming(
        &self,
        info_hash: [u8; ID_LEN],
        bt_port: Option<u16>,
    ) -> mpsc::Receiver<LookupEvent> {
        let (tx, rx) = mpsc::channel(LOOKUP_CHANNEL_CAPACITY);
        let Some(server) = self.me.upgrade() else {
            return rx;
        };
        tokio::spawn(async move {
            server
                .drive_lookup(
                    NodeId(info_hash),
                    LookupKind::Peers(info_hash),
                    bt_port,
                    Some(&tx),
                )
                .await;
        });
        rx
    }

    /// Announces that we are downloading `info_hash` on `bt_port`: runs a
    /// peer lookup and sends announce_peer with the collected tokens to
    /// the top responders. Returns how many accepted.
    pub async fn announce(
        &self,
        info_hash: [u8; ID_LEN],
        bt_port: u16,
    ) -> Result<usize, DhtError> {
        if self.is_shutdown() {
            return Err(DhtError::Cancelled);
        }

        let (outcome, announced) = self
            .drive_lookup(
                NodeId(info_hash),
                LookupKind::Peers(info_hash),
                Some(bt_port),
                None,
            )
            .await;
        match outcome.termination {
            LookupTermination::Cancelled => Err(DhtError::Cancelled),
            _ => Ok(announced),
        }
    }

    /// Finds the closest nodes to an arbitrary id; mostly useful for
    /// diagnostics and tests.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Node>, DhtError> {
        if self.is_shutdown() {
            return Err(DhtError::Cancelled);
        }

        let (outcome, _) = self
            .drive_lookup(target, LookupKind::Nodes, None, None)
            .await;
        match outcome.termination {
            LookupTermination::Cancelled => Err(DhtError::Cancelled),
            _ => Ok(outcome.closest),
        }
    }

    // ========================================================================
    // State snapshots
    // ========================================================================

    /// Serializes the node id and the live routing table into an opaque
    /// blob that a later run can pass in through [`DhtConfig::state`].
    pub fn dump_state(&self) -> Vec<u8> {
        let now = Instant::now();
        let entries = self.routing.read().entries(now);
        state::encode_state(&self.our_id, &entries, now)
    }
}
