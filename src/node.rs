//! # High-Level Node API
//!
//! [`IssuerNode`] hosts the trusted issuer on a QUIC endpoint. [`Node`] is a
//! skip graph member: it registers with the issuer, listens for peers and
//! exposes join, search and termination.
//!
//! ```ignore
//! let issuer = IssuerNode::bind("127.0.0.1:0", SystemParameters::default(), Some(7)).await?;
//! let issuer_addr = issuer.local_addr()?.to_string();
//!
//! let first = Node::register("127.0.0.1:0", &issuer_addr, SkipGraphConfig::default()).await?;
//! first.join(None).await?;
//!
//! let second = Node::register("127.0.0.1:0", &issuer_addr, SkipGraphConfig::default()).await?;
//! second.join(Some(first.info())).await?;
//! second.initialize_guards().await?;
//! first.initialize_guards().await?;
//!
//! let (found, transcript) = first.authenticated_search(second.info().num_id).await?;
//! ```

use std::net::SocketAddr;

use anyhow::{Context, Result};
use quinn::Endpoint;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{SkipGraphConfig, SystemParameters};
use crate::crypto::{create_client_config, create_server_config, generate_transport_cert};
use crate::error::SkipGraphResult;
use crate::identity::{NodeInfo, NumId};
use crate::issuer::{Issuer, Registration};
use crate::messages::NodeStatus;
use crate::protocols::IssuerRpc;
use crate::rpc::{self, RpcNode, RpcService};
use crate::skipnode::{JoinReport, SkipNode};
use crate::transcript::SignedTranscript;

fn bind_endpoint(addr: &str) -> Result<Endpoint> {
    let addr: SocketAddr = addr.parse().context("invalid socket address")?;
    let (certs, key) = generate_transport_cert()?;
    let server_config = create_server_config(certs, key)?;
    let mut endpoint =
        Endpoint::server(server_config, addr).with_context(|| format!("failed to bind {addr}"))?;
    endpoint.set_default_client_config(create_client_config()?);
    Ok(endpoint)
}

pub struct IssuerNode {
    issuer: Issuer,
    endpoint: Endpoint,
    listener: JoinHandle<()>,
}

impl IssuerNode {
    /// Binds the issuer service. `seed` makes identifier assignment and the
    /// master key reproducible.
    pub async fn bind(addr: &str, params: SystemParameters, seed: Option<u64>) -> Result<Self> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let issuer = Issuer::new(params, rng)?;
        let endpoint = bind_endpoint(addr)?;
        let listener = tokio::spawn(rpc::serve(endpoint.clone(), RpcService::Issuer(issuer.clone())));
        info!(addr = %endpoint.local_addr()?, "issuer listening");
        Ok(Self {
            issuer,
            endpoint,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("endpoint has no local address")
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub async fn shutdown(&self) {
        self.listener.abort();
        self.endpoint.close(0u32.into(), b"issuer shutdown");
    }
}

pub struct Node {
    skipnode: SkipNode<RpcNode>,
    rpcnode: RpcNode,
    endpoint: Endpoint,
    issuer_addr: String,
    listener: JoinHandle<()>,
}

impl Node {
    /// Binds `addr`, registers with the issuer at `issuer_addr` and starts
    /// answering peers. The node is not part of the overlay until [`Node::join`].
    pub async fn register(addr: &str, issuer_addr: &str, config: SkipGraphConfig) -> Result<Self> {
        let endpoint = bind_endpoint(addr)?;
        let client_config = create_client_config()?;
        let rpcnode = RpcNode::new(endpoint.clone(), client_config, config.rpc_timeout);

        let registration = rpcnode
            .register(issuer_addr)
            .await
            .with_context(|| format!("registration with issuer {issuer_addr} failed"))?;
        info!(
            num_id = registration.node.num_id,
            name_id = %registration.node.name_id,
            address = %registration.node.address,
            "registered with issuer"
        );

        let skipnode = SkipNode::new(registration, config, rpcnode.clone());
        let listener = tokio::spawn(rpc::serve(
            endpoint.clone(),
            RpcService::SkipNode(skipnode.clone()),
        ));

        Ok(Self {
            skipnode,
            rpcnode,
            endpoint,
            issuer_addr: issuer_addr.to_string(),
            listener,
        })
    }

    pub fn info(&self) -> &NodeInfo {
        self.skipnode.info()
    }

    pub fn registration(&self) -> &Registration {
        self.skipnode.registration()
    }

    pub fn skipnode(&self) -> &SkipNode<RpcNode> {
        &self.skipnode
    }

    /// Client handle this node uses to reach peers.
    pub fn rpc(&self) -> &RpcNode {
        &self.rpcnode
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.rpcnode.local_addr()
    }

    pub async fn join(&self, entry: Option<&NodeInfo>) -> SkipGraphResult<JoinReport> {
        self.skipnode.join(entry).await
    }

    /// Joins through the node listening at `entry_addr`.
    pub async fn join_address(&self, entry_addr: &str) -> SkipGraphResult<JoinReport> {
        let entry = self.rpcnode.status_at(entry_addr).await?;
        self.skipnode.join(Some(&entry.node)).await
    }

    pub async fn initialize_guards(&self) -> SkipGraphResult<Vec<NodeInfo>> {
        self.skipnode.initialize_guards().await
    }

    pub async fn search(&self, target: NumId) -> SkipGraphResult<NodeInfo> {
        self.skipnode.search_by_num_id(target).await
    }

    pub async fn authenticated_search(
        &self,
        target: NumId,
    ) -> SkipGraphResult<(NodeInfo, SignedTranscript)> {
        self.skipnode.authenticated_search_by_num_id(target).await
    }

    pub async fn status(&self) -> NodeStatus {
        self.skipnode.status().await
    }

    /// Releases this node's identifiers at the issuer and closes the endpoint.
    /// The endpoint is closed even if deregistration fails.
    pub async fn terminate(&self) -> SkipGraphResult<()> {
        let result = self
            .rpcnode
            .deregister(&self.issuer_addr, self.info().num_id)
            .await;
        if let Err(e) = &result {
            warn!(num_id = self.info().num_id, error = %e, "deregistration failed");
        }
        self.listener.abort();
        self.rpcnode.quit().await;
        self.endpoint.close(0u32.into(), b"terminated");
        info!(num_id = self.info().num_id, "node terminated");
        result
    }
}
