//! # RPC Layer
//!
//! QUIC transport for every protocol in the crate. One bidirectional stream
//! carries exactly one request and its response, each framed as a big-endian
//! `u32` length followed by a bincode body.
//!
//! ## Architecture
//!
//! - [`RpcNode`]: cheap-to-clone client handle implementing [`SkipNodeRpc`]
//!   and [`IssuerRpc`].
//! - `RpcNodeActor`: owns the LRU connection cache, keyed by socket address.
//!   Dials run in spawned tasks bounded by the RPC timeout and report back to
//!   the actor, so one unreachable peer does not hold up the others.
//! - [`serve`] / [`handle_connection`]: server side, dispatching each decoded
//!   [`RpcRequest`] to the local [`RpcService`].
//!
//! ## Failure mapping
//!
//! Transport problems (connect, stream, timeout, malformed frame) surface as
//! `RoutingFailure` and invalidate the cached connection. A typed error sent
//! back by the peer is returned unchanged.
//!
//! `SetGuardNeighbor` is only honoured when it arrives from the node's own
//! registered address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint, Incoming};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::crypto::SERVER_NAME;
use crate::error::{SkipGraphError, SkipGraphResult};
use crate::identity::{Direction, Level, NodeInfo, NumId};
use crate::issuer::{Issuer, Registration};
use crate::messages::{
    self, IssuerRequest, IssuerResponse, MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE, NodeStatus,
    RpcRequest, RpcResponse, SkipNodeRequest, SkipNodeResponse,
};
use crate::protocols::{IssuerRpc, SkipNodeRpc};
use crate::skipnode::SkipNode;
use crate::transcript::{GuardSignature, RoutingTranscript, SignedTranscript};

/// Maximum number of cached QUIC connections.
const MAX_CACHED_CONNECTIONS: usize = 1_000;

/// Idle connections older than this are re-validated before reuse.
const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum number of peers being dialled at once.
const MAX_IN_FLIGHT_CONNECTIONS: usize = 100;

const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Processing bound for issuer requests, which never fan out.
const ISSUER_PROCESS_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Actor Commands
// ============================================================================

enum RpcCommand {
    GetOrConnect {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<Connection>>,
    },
    Connected {
        addr: SocketAddr,
        result: std::result::Result<Connection, String>,
    },
    InvalidateConnection {
        addr: SocketAddr,
    },
    MarkSuccess {
        addr: SocketAddr,
    },
    Quit,
}

type ConnectWaiters = Vec<oneshot::Sender<Result<Connection>>>;

// ============================================================================
// Actor (owns the connection cache)
// ============================================================================

struct RpcNodeActor {
    endpoint: Endpoint,
    client_config: ClientConfig,
    connect_timeout: Duration,
    /// Dial tasks report back through this; weak so that dropping every
    /// `RpcNode` still ends the actor.
    cmd_tx: mpsc::WeakSender<RpcCommand>,
    connections: LruCache<SocketAddr, CachedConnection>,
    /// Callers waiting on a dial, one dial per peer.
    in_flight: HashMap<SocketAddr, ConnectWaiters>,
}

impl RpcNodeActor {
    fn new(
        endpoint: Endpoint,
        client_config: ClientConfig,
        connect_timeout: Duration,
        cmd_tx: mpsc::WeakSender<RpcCommand>,
    ) -> Self {
        let capacity = NonZeroUsize::new(MAX_CACHED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN);
        Self {
            endpoint,
            client_config,
            connect_timeout,
            cmd_tx,
            connections: LruCache::new(capacity),
            in_flight: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        let mut cleanup_interval = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup_interval.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RpcCommand::GetOrConnect { addr, reply }) => {
                            self.get_or_connect(addr, reply);
                        }
                        Some(RpcCommand::Connected { addr, result }) => {
                            self.finish_connect(addr, result);
                        }
                        Some(RpcCommand::InvalidateConnection { addr }) => {
                            if self.connections.pop(&addr).is_some() {
                                debug!(peer = %addr, "invalidated cached connection after failure");
                            }
                        }
                        Some(RpcCommand::MarkSuccess { addr }) => {
                            if let Some(cached) = self.connections.get_mut(&addr) {
                                cached.mark_success();
                            }
                        }
                        Some(RpcCommand::Quit) | None => {
                            debug!("RpcNode actor shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_stale_connections();
                }
            }
        }
    }

    fn cleanup_stale_connections(&mut self) {
        let stale: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|(_, cached)| cached.is_closed() || cached.is_stale())
            .map(|(addr, _)| *addr)
            .collect();

        for addr in stale {
            self.connections.pop(&addr);
            trace!(peer = %addr, "cleaned up stale connection");
        }
    }

    fn cached(&mut self, addr: SocketAddr) -> Option<Connection> {
        let cached = self.connections.get_mut(&addr)?;
        if cached.is_closed() {
            trace!(peer = %addr, "cached connection is closed, removing");
        } else if !cached.is_stale() || cached.check_health_passive() {
            cached.mark_success();
            return Some(cached.connection.clone());
        } else {
            debug!(peer = %addr, "stale connection failed passive health check, removing");
        }
        self.connections.pop(&addr);
        None
    }

    /// Answers from the cache, or parks `reply` until a dial to `addr`
    /// finishes. The dial runs in its own task so a silent peer never stalls
    /// requests to other peers.
    fn get_or_connect(&mut self, addr: SocketAddr, reply: oneshot::Sender<Result<Connection>>) {
        if let Some(conn) = self.cached(addr) {
            let _ = reply.send(Ok(conn));
            return;
        }

        if !self.in_flight.contains_key(&addr) && self.in_flight.len() >= MAX_IN_FLIGHT_CONNECTIONS {
            warn!(peer = %addr, max = MAX_IN_FLIGHT_CONNECTIONS, "too many connection attempts in flight");
            let _ = reply.send(Err(anyhow::anyhow!(
                "too many connection attempts in flight (max {MAX_IN_FLIGHT_CONNECTIONS})"
            )));
            return;
        }

        let waiters = self.in_flight.entry(addr).or_default();
        waiters.push(reply);
        if waiters.len() > 1 {
            trace!(peer = %addr, waiting = waiters.len(), "joining in-flight connection attempt");
            return;
        }

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, SERVER_NAME);
        let connect_timeout = self.connect_timeout;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = match connecting {
                Err(e) => Err(format!("failed to initiate connection to {addr}: {e}")),
                Ok(connecting) => match tokio::time::timeout(connect_timeout, connecting).await {
                    Ok(Ok(conn)) => Ok(conn),
                    Ok(Err(e)) => Err(format!("failed to establish connection to {addr}: {e}")),
                    Err(_) => Err(format!(
                        "connection to {addr} timed out after {connect_timeout:?}"
                    )),
                },
            };
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                let _ = cmd_tx.send(RpcCommand::Connected { addr, result }).await;
            }
        });
    }

    fn finish_connect(&mut self, addr: SocketAddr, result: std::result::Result<Connection, String>) {
        let waiters = self.in_flight.remove(&addr).unwrap_or_default();
        match result {
            Ok(conn) => {
                self.connections.put(addr, CachedConnection::new(conn.clone()));
                for waiter in waiters {
                    let _ = waiter.send(Ok(conn.clone()));
                }
            }
            Err(e) => {
                debug!(peer = %addr, error = %e, waiters = waiters.len(), "connection attempt failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(anyhow::anyhow!(e.clone())));
                }
            }
        }
    }
}

struct CachedConnection {
    connection: Connection,
    last_success: Instant,
}

impl CachedConnection {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            last_success: Instant::now(),
        }
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    fn is_stale(&self) -> bool {
        self.last_success.elapsed() > CONNECTION_STALE_TIMEOUT
    }

    fn mark_success(&mut self) {
        self.last_success = Instant::now();
    }

    fn check_health_passive(&self) -> bool {
        !self.is_closed() && !self.connection.rtt().is_zero()
    }
}

// ============================================================================
// RpcNode Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct RpcNode {
    endpoint: Endpoint,
    cmd_tx: mpsc::Sender<RpcCommand>,
    rpc_timeout: Duration,
}

impl RpcNode {
    /// Spawns the connection actor. Must be called inside a tokio runtime.
    pub fn new(endpoint: Endpoint, client_config: ClientConfig, rpc_timeout: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        let actor = RpcNodeActor::new(
            endpoint.clone(),
            client_config,
            rpc_timeout,
            cmd_tx.downgrade(),
        );
        tokio::spawn(actor.run(cmd_rx));
        Self {
            endpoint,
            cmd_tx,
            rpc_timeout,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("endpoint has no local address")
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RpcCommand::Quit).await;
    }

    async fn get_or_connect(&self, addr: SocketAddr) -> Result<Connection> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::GetOrConnect {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("RPC actor closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("RPC actor closed"))?
    }

    async fn rpc_raw(&self, address: &str, request: RpcRequest) -> Result<RpcResponse> {
        let addr: SocketAddr = address
            .parse()
            .with_context(|| format!("invalid socket address: {address}"))?;
        let conn = tokio::time::timeout(self.rpc_timeout, self.get_or_connect(addr))
            .await
            .with_context(|| format!("connecting to {addr} timed out"))??;

        let result = self.rpc_inner(&conn, addr, &request).await;
        let cmd = match &result {
            Ok(_) => RpcCommand::MarkSuccess { addr },
            Err(_) => RpcCommand::InvalidateConnection { addr },
        };
        let _ = self.cmd_tx.send(cmd).await;
        result
    }

    async fn rpc_inner(
        &self,
        conn: &Connection,
        addr: SocketAddr,
        request: &RpcRequest,
    ) -> Result<RpcResponse> {
        tokio::time::timeout(self.rpc_timeout, async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .context("failed to open bidirectional stream")?;

            let request_bytes =
                messages::serialize(request).context("failed to serialize request")?;
            send.write_all(&(request_bytes.len() as u32).to_be_bytes()).await?;
            send.write_all(&request_bytes).await?;
            send.finish()?;

            let mut len_buf = [0u8; 4];
            recv.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_RESPONSE_SIZE {
                warn!(peer = %addr, size = len, max = MAX_RESPONSE_SIZE, "peer sent oversized response");
                anyhow::bail!("response too large: {len} bytes (max {MAX_RESPONSE_SIZE})");
            }

            let mut response_bytes = vec![0u8; len];
            recv.read_exact(&mut response_bytes).await?;
            let response: RpcResponse = messages::deserialize_bounded(&response_bytes)
                .context("failed to deserialize response")?;
            Ok(response)
        })
        .await
        .context("RPC timed out")?
    }

    async fn skipnode_rpc(
        &self,
        to: &NodeInfo,
        request: SkipNodeRequest,
    ) -> SkipGraphResult<SkipNodeResponse> {
        let kind = request.kind();
        match self.rpc_raw(&to.address, RpcRequest::SkipNode(request)).await {
            Ok(RpcResponse::SkipNode(response)) => Ok(response),
            Ok(RpcResponse::Error(err)) => Err(err),
            Ok(other) => Err(unexpected(kind, &other)),
            Err(e) => {
                debug!(peer = %to, kind, error = %e, "skip node RPC failed");
                Err(e.into())
            }
        }
    }

    /// `GetInfo` against a bare address, for callers that know where a node
    /// listens but not who it is.
    pub async fn status_at(&self, address: &str) -> SkipGraphResult<NodeStatus> {
        match self
            .rpc_raw(address, RpcRequest::SkipNode(SkipNodeRequest::GetInfo))
            .await?
        {
            RpcResponse::SkipNode(SkipNodeResponse::Info(status)) => Ok(status),
            RpcResponse::Error(err) => Err(err),
            other => Err(unexpected("GetInfo", &other)),
        }
    }

    async fn issuer_rpc(&self, issuer: &str, request: IssuerRequest) -> SkipGraphResult<IssuerResponse> {
        match self.rpc_raw(issuer, RpcRequest::Issuer(request)).await? {
            RpcResponse::Issuer(response) => Ok(response),
            RpcResponse::Error(err) => Err(err),
            other => Err(unexpected("Issuer", &other)),
        }
    }
}

fn unexpected(kind: &str, response: &impl std::fmt::Debug) -> SkipGraphError {
    SkipGraphError::routing(format!("unexpected response to {kind}: {response:?}"))
}

#[async_trait]
impl SkipNodeRpc for RpcNode {
    async fn get_neighbor(
        &self,
        to: &NodeInfo,
        level: Level,
        direction: Direction,
    ) -> SkipGraphResult<Option<NodeInfo>> {
        match self
            .skipnode_rpc(to, SkipNodeRequest::GetNeighbor { level, direction })
            .await?
        {
            SkipNodeResponse::Neighbor(node) => Ok(node),
            other => Err(unexpected("GetNeighbor", &other)),
        }
    }

    async fn find_ladder(
        &self,
        to: &NodeInfo,
        level: Level,
        direction: Direction,
        prefix: &str,
    ) -> SkipGraphResult<Option<NodeInfo>> {
        let request = SkipNodeRequest::FindLadder {
            level,
            direction,
            prefix: prefix.to_string(),
        };
        match self.skipnode_rpc(to, request).await? {
            SkipNodeResponse::Neighbor(node) => Ok(node),
            other => Err(unexpected("FindLadder", &other)),
        }
    }

    async fn route_search(
        &self,
        to: &NodeInfo,
        target: NumId,
        level: Option<Level>,
    ) -> SkipGraphResult<NodeInfo> {
        match self
            .skipnode_rpc(to, SkipNodeRequest::RouteSearchByNumId { target, level })
            .await?
        {
            SkipNodeResponse::Found(node) => Ok(node),
            other => Err(unexpected("RouteSearchByNumId", &other)),
        }
    }

    async fn route_closest(
        &self,
        to: &NodeInfo,
        target: NumId,
        level: Option<Level>,
    ) -> SkipGraphResult<NodeInfo> {
        match self
            .skipnode_rpc(to, SkipNodeRequest::RouteClosest { target, level })
            .await?
        {
            SkipNodeResponse::Found(node) => Ok(node),
            other => Err(unexpected("RouteClosest", &other)),
        }
    }

    async fn route_authenticated_search(
        &self,
        to: &NodeInfo,
        target: NumId,
        level: Option<Level>,
        transcript: RoutingTranscript,
    ) -> SkipGraphResult<(NodeInfo, SignedTranscript)> {
        let request = SkipNodeRequest::RouteAuthSearchByNumId {
            target,
            level,
            transcript,
        };
        match self.skipnode_rpc(to, request).await? {
            SkipNodeResponse::Authenticated { result, transcript } => Ok((result, transcript)),
            other => Err(unexpected("RouteAuthSearchByNumId", &other)),
        }
    }

    async fn update_neighbor(
        &self,
        to: &NodeInfo,
        level: Level,
        direction: Direction,
        node: Option<NodeInfo>,
        expected: Option<NumId>,
    ) -> SkipGraphResult<()> {
        let request = SkipNodeRequest::UpdateNeighbor {
            level,
            direction,
            node,
            expected,
        };
        match self.skipnode_rpc(to, request).await? {
            SkipNodeResponse::Ack => Ok(()),
            other => Err(unexpected("UpdateNeighbor", &other)),
        }
    }

    async fn set_guard_neighbor(
        &self,
        to: &NodeInfo,
        position: usize,
        neighbor: &NodeInfo,
    ) -> SkipGraphResult<()> {
        let request = SkipNodeRequest::SetGuardNeighbor {
            position,
            neighbor: neighbor.clone(),
        };
        match self.skipnode_rpc(to, request).await? {
            SkipNodeResponse::Ack => Ok(()),
            other => Err(unexpected("SetGuardNeighbor", &other)),
        }
    }

    async fn get_guard_signature(
        &self,
        guard: &NodeInfo,
        requester: &NodeInfo,
        transcript: &RoutingTranscript,
    ) -> SkipGraphResult<GuardSignature> {
        let request = SkipNodeRequest::GetGuardSignature {
            requester: requester.clone(),
            transcript: transcript.clone(),
        };
        match self.skipnode_rpc(guard, request).await? {
            SkipNodeResponse::GuardSignature(signature) => Ok(signature),
            other => Err(unexpected("GetGuardSignature", &other)),
        }
    }
}

#[async_trait]
impl IssuerRpc for RpcNode {
    async fn register(&self, issuer: &str) -> SkipGraphResult<Registration> {
        match self.issuer_rpc(issuer, IssuerRequest::Register).await? {
            IssuerResponse::Registered(registration) => Ok(*registration),
            other => Err(unexpected("Register", &other)),
        }
    }

    async fn deregister(&self, issuer: &str, num_id: NumId) -> SkipGraphResult<()> {
        match self
            .issuer_rpc(issuer, IssuerRequest::Deregister { num_id })
            .await?
        {
            IssuerResponse::Deregistered => Ok(()),
            other => Err(unexpected("Deregister", &other)),
        }
    }
}

// ============================================================================
// Server side
// ============================================================================

/// What a listening endpoint answers for.
#[derive(Clone)]
pub enum RpcService {
    Issuer(Issuer),
    SkipNode(SkipNode<RpcNode>),
}

impl RpcService {
    fn process_timeout(&self) -> Duration {
        match self {
            RpcService::Issuer(_) => ISSUER_PROCESS_TIMEOUT,
            RpcService::SkipNode(node) => node.config().request_timeout,
        }
    }
}

/// Accepts connections until the endpoint is closed.
pub async fn serve(endpoint: Endpoint, service: RpcService) {
    while let Some(incoming) = endpoint.accept().await {
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(service, incoming).await {
                debug!(error = ?e, "connection error");
            }
        });
    }
    debug!("endpoint closed, listener exiting");
}

pub async fn handle_connection(service: RpcService, incoming: Incoming) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();
    trace!(remote = %remote, "peer connected");

    loop {
        let stream = match connection.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(remote = %remote, "connection closed");
                break Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "connection idle timeout");
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        };

        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(service, stream, remote).await {
                debug!(remote = %remote, error = ?e, "stream error");
            }
        });
    }
}

async fn write_response(send: &mut quinn::SendStream, response: &RpcResponse) -> Result<()> {
    let bytes = messages::serialize(response).context("failed to serialize response")?;
    send.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    send.write_all(&bytes).await?;
    send.finish()?;
    Ok(())
}

async fn handle_stream(
    service: RpcService,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    remote: SocketAddr,
) -> Result<()> {
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .map_err(|_| anyhow::anyhow!("request header read timed out"))??;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_REQUEST_SIZE {
        warn!(remote = %remote, size = len, max = MAX_REQUEST_SIZE, "rejecting oversized request");
        let response = RpcResponse::Error(SkipGraphError::InvalidRequest(format!(
            "request too large: {len} bytes (max {MAX_REQUEST_SIZE})"
        )));
        return write_response(&mut send, &response).await;
    }

    let mut request_bytes = vec![0u8; len];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut request_bytes))
        .await
        .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

    let request: RpcRequest = match messages::deserialize_bounded(&request_bytes) {
        Ok(request) => request,
        Err(e) => {
            warn!(remote = %remote, error = %e, "malformed request");
            let response =
                RpcResponse::Error(SkipGraphError::InvalidRequest(format!("malformed request: {e}")));
            return write_response(&mut send, &response).await;
        }
    };

    let timeout = service.process_timeout();
    let response = match tokio::time::timeout(timeout, handle_rpc_request(&service, request, remote)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(remote = %remote, "request processing timed out");
            RpcResponse::Error(SkipGraphError::routing("request processing timeout"))
        }
    };

    write_response(&mut send, &response).await
}

async fn handle_rpc_request(service: &RpcService, request: RpcRequest, remote: SocketAddr) -> RpcResponse {
    let result = match (service, request) {
        (RpcService::Issuer(issuer), RpcRequest::Issuer(request)) => {
            handle_issuer_rpc(issuer, request, remote).map(RpcResponse::Issuer)
        }
        (RpcService::SkipNode(node), RpcRequest::SkipNode(request)) => {
            handle_skipnode_rpc(node, request, remote)
                .await
                .map(RpcResponse::SkipNode)
        }
        (RpcService::Issuer(_), RpcRequest::SkipNode(request)) => Err(SkipGraphError::InvalidRequest(
            format!("issuer does not serve {}", request.kind()),
        )),
        (RpcService::SkipNode(_), RpcRequest::Issuer(_)) => Err(SkipGraphError::InvalidRequest(
            "skip graph node does not serve issuer requests".into(),
        )),
    };
    result.unwrap_or_else(RpcResponse::Error)
}

fn handle_issuer_rpc(
    issuer: &Issuer,
    request: IssuerRequest,
    remote: SocketAddr,
) -> SkipGraphResult<IssuerResponse> {
    let address = remote.to_string();
    match request {
        IssuerRequest::Register => {
            let registration = issuer.register(&address)?;
            Ok(IssuerResponse::Registered(Box::new(registration)))
        }
        IssuerRequest::Deregister { num_id } => {
            issuer.deregister_from(&address, num_id)?;
            Ok(IssuerResponse::Deregistered)
        }
    }
}

async fn handle_skipnode_rpc(
    node: &SkipNode<RpcNode>,
    request: SkipNodeRequest,
    remote: SocketAddr,
) -> SkipGraphResult<SkipNodeResponse> {
    trace!(num_id = node.info().num_id, kind = request.kind(), "handling request");
    match request {
        SkipNodeRequest::GetInfo => Ok(SkipNodeResponse::Info(node.status().await)),
        SkipNodeRequest::GetNeighbor { level, direction } => node
            .handle_get_neighbor(level, direction)
            .await
            .map(SkipNodeResponse::Neighbor),
        SkipNodeRequest::FindLadder {
            level,
            direction,
            prefix,
        } => node
            .handle_find_ladder(level, direction, &prefix)
            .await
            .map(SkipNodeResponse::Neighbor),
        SkipNodeRequest::RouteSearchByNumId { target, level } => node
            .handle_route_search(target, level)
            .await
            .map(SkipNodeResponse::Found),
        SkipNodeRequest::RouteClosest { target, level } => node
            .handle_route_closest(target, level)
            .await
            .map(SkipNodeResponse::Found),
        SkipNodeRequest::RouteAuthSearchByNumId {
            target,
            level,
            transcript,
        } => node
            .handle_route_auth_search(target, level, transcript)
            .await
            .map(|(result, transcript)| SkipNodeResponse::Authenticated { result, transcript }),
        SkipNodeRequest::UpdateNeighbor {
            level,
            direction,
            node: neighbor,
            expected,
        } => node
            .handle_update_neighbor(level, direction, neighbor, expected)
            .await
            .map(|()| SkipNodeResponse::Ack),
        SkipNodeRequest::SetGuardNeighbor { position, neighbor } => {
            // Guard assignment is the node's own decision; peers cannot make it.
            if remote.to_string() != node.info().address {
                warn!(
                    num_id = node.info().num_id,
                    remote = %remote,
                    "rejecting guard assignment from another node"
                );
                return Err(SkipGraphError::InvalidRequest(
                    "guards can only be set by the node itself".into(),
                ));
            }
            node.handle_set_guard_neighbor(position, neighbor)
                .await
                .map(|()| SkipNodeResponse::Ack)
        }
        SkipNodeRequest::GetGuardSignature {
            requester,
            transcript,
        } => node
            .handle_get_guard_signature(&requester, &transcript)
            .await
            .map(SkipNodeResponse::GuardSignature),
    }
}
