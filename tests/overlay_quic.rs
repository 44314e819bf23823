//! Integration tests over real QUIC endpoints on loopback.
//!
//! An issuer and a handful of nodes run inside one runtime. Every request,
//! including the nodes' requests to themselves, crosses the RPC layer.

use std::time::{Duration, Instant};

use skipguard::{
    Direction, GuardPolicy, IssuerNode, NameId, Node, NodeInfo, SkipGraphConfig, SkipGraphError,
    SkipNodeRpc, SystemParameters,
};
use tokio::time::timeout;

const LOOPBACK: &str = "127.0.0.1:0";

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

async fn issuer(capacity: u64, seed: u64) -> (IssuerNode, String) {
    let params = SystemParameters::with_capacity(capacity).expect("params");
    let issuer = IssuerNode::bind(LOOPBACK, params, Some(seed))
        .await
        .expect("issuer bind failed");
    let addr = issuer.local_addr().expect("issuer addr").to_string();
    (issuer, addr)
}

fn config(guard_policy: GuardPolicy) -> SkipGraphConfig {
    SkipGraphConfig {
        guard_policy,
        rpc_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
    }
}

/// Registers `count` nodes and joins them one after another through the first.
async fn overlay(issuer_addr: &str, count: usize, policy: GuardPolicy) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::with_capacity(count);
    for _ in 0..count {
        let node = Node::register(LOOPBACK, issuer_addr, config(policy))
            .await
            .expect("register failed");
        let entry = nodes.first().map(|n| n.info().clone());
        node.join(entry.as_ref()).await.expect("join failed");
        nodes.push(node);
    }
    for node in &nodes {
        node.initialize_guards().await.expect("guard initialization failed");
    }
    nodes
}

async fn assert_ideal_neighbors(nodes: &[Node]) {
    let infos: Vec<NodeInfo> = nodes.iter().map(|n| n.info().clone()).collect();
    for node in nodes {
        let me = node.info();
        let status = node.status().await;
        assert_eq!(status.levels.len(), me.max_level() + 1);
        for snapshot in &status.levels {
            let level = snapshot.level;
            let peers = infos
                .iter()
                .filter(|n| !n.same_node(me) && n.name_id.common_prefix_len(&me.name_id) >= level);
            let left = peers
                .clone()
                .filter(|n| n.num_id < me.num_id)
                .max_by_key(|n| n.num_id);
            let right = peers
                .filter(|n| n.num_id > me.num_id)
                .min_by_key(|n| n.num_id);
            assert_eq!(snapshot.left.as_ref(), left, "left of {} at {level}", me.num_id);
            assert_eq!(snapshot.right.as_ref(), right, "right of {} at {level}", me.num_id);
        }
    }
}

#[tokio::test]
async fn nodes_register_with_distinct_identifiers() {
    let (issuer, issuer_addr) = issuer(16, 11).await;
    let nodes = timeout(TEST_TIMEOUT, async {
        let mut nodes = Vec::new();
        for _ in 0..4 {
            nodes.push(
                Node::register(LOOPBACK, &issuer_addr, SkipGraphConfig::default())
                    .await
                    .expect("register failed"),
            );
        }
        nodes
    })
    .await
    .expect("registration timed out");

    let mut nums: Vec<_> = nodes.iter().map(|n| n.info().num_id).collect();
    let mut names: Vec<_> = nodes.iter().map(|n| n.info().name_id.clone()).collect();
    nums.sort_unstable();
    nums.dedup();
    names.sort();
    names.dedup();
    assert_eq!(nums.len(), 4);
    assert_eq!(names.len(), 4);
    assert_eq!(issuer.issuer().registered().len(), 4);

    // The issuer records the address it observed, which is where the node listens.
    for node in &nodes {
        let local = node.local_addr().expect("local addr");
        assert_eq!(node.info().address, local.to_string());
        assert!(nums.contains(&node.info().num_id));
    }

    for node in &nodes {
        node.terminate().await.expect("terminate failed");
    }
    issuer.shutdown().await;
}

#[tokio::test]
async fn overlay_links_levels_and_finds_every_member() {
    let (issuer, issuer_addr) = issuer(16, 5).await;
    let nodes = timeout(TEST_TIMEOUT, overlay(&issuer_addr, 4, GuardPolicy::Single))
        .await
        .expect("overlay construction timed out");

    assert_ideal_neighbors(&nodes).await;

    for origin in &nodes {
        for target in &nodes {
            let found = timeout(TEST_TIMEOUT, origin.search(target.info().num_id))
                .await
                .expect("search timed out")
                .expect("search failed");
            assert_eq!(&found, target.info());
        }
    }

    let members: Vec<_> = nodes.iter().map(|n| n.info().num_id).collect();
    let absent = (0..16).find(|id| !members.contains(id)).expect("free id");
    let err = nodes[0].search(absent).await.unwrap_err();
    assert_eq!(err, SkipGraphError::NotFound { target: absent });

    for node in &nodes {
        node.terminate().await.expect("terminate failed");
    }
    issuer.shutdown().await;
}

#[tokio::test]
async fn authenticated_search_over_quic_verifies() {
    let (issuer, issuer_addr) = issuer(16, 9).await;
    let nodes = timeout(TEST_TIMEOUT, overlay(&issuer_addr, 3, GuardPolicy::Single))
        .await
        .expect("overlay construction timed out");
    let params = issuer.issuer().public_parameters();

    for origin in &nodes {
        for target in &nodes {
            let (found, transcript) =
                timeout(TEST_TIMEOUT, origin.authenticated_search(target.info().num_id))
                    .await
                    .expect("authenticated search timed out")
                    .expect("authenticated search failed");
            assert_eq!(&found, target.info());
            transcript.verify(&params, &found).expect("transcript must verify");

            let hops = &transcript.transcript().hops;
            assert_eq!(&hops[0].node, origin.info());
            assert_eq!(&hops[hops.len() - 1].node, target.info());

            let guards = target.status().await.guards;
            assert_eq!(guards.len(), 1);
            assert_eq!(transcript.guard_signatures()[0].guard, guards[0]);
        }
    }

    // A transcript for one result does not vouch for another.
    let (found, transcript) = nodes[0]
        .authenticated_search(nodes[1].info().num_id)
        .await
        .expect("authenticated search failed");
    assert_eq!(&found, nodes[1].info());
    assert!(matches!(
        transcript.verify(&params, nodes[2].info()),
        Err(SkipGraphError::InvalidTranscript(_))
    ));

    for node in &nodes {
        node.terminate().await.expect("terminate failed");
    }
    issuer.shutdown().await;
}

#[tokio::test]
async fn every_level_guards_all_sign() {
    let (issuer, issuer_addr) = issuer(16, 21).await;
    let nodes = timeout(TEST_TIMEOUT, overlay(&issuer_addr, 4, GuardPolicy::EveryLevel))
        .await
        .expect("overlay construction timed out");

    for target in &nodes {
        let guards = target.status().await.guards;
        assert!(!guards.is_empty());
        let (_, transcript) = nodes[0]
            .authenticated_search(target.info().num_id)
            .await
            .expect("authenticated search failed");
        let signers: Vec<_> = transcript
            .guard_signatures()
            .iter()
            .map(|g| g.guard.clone())
            .collect();
        assert_eq!(signers, guards);
    }

    for node in &nodes {
        node.terminate().await.expect("terminate failed");
    }
    issuer.shutdown().await;
}

#[tokio::test]
async fn join_through_address_only() {
    let (issuer, issuer_addr) = issuer(8, 3).await;
    let first = Node::register(LOOPBACK, &issuer_addr, SkipGraphConfig::default())
        .await
        .expect("register failed");
    first.join(None).await.expect("bootstrap join failed");

    let second = Node::register(LOOPBACK, &issuer_addr, SkipGraphConfig::default())
        .await
        .expect("register failed");
    let entry = first.local_addr().expect("local addr").to_string();
    let report = timeout(TEST_TIMEOUT, second.join_address(&entry))
        .await
        .expect("join timed out")
        .expect("join failed");
    assert!(report.levels_linked >= 1);

    let status = first.status().await;
    let direction = if second.info().num_id > first.info().num_id {
        Direction::Right
    } else {
        Direction::Left
    };
    let level0 = &status.levels[0];
    let linked = match direction {
        Direction::Right => level0.right.as_ref(),
        Direction::Left => level0.left.as_ref(),
    };
    assert_eq!(linked, Some(second.info()));

    second.terminate().await.expect("terminate failed");
    first.terminate().await.expect("terminate failed");
    issuer.shutdown().await;
}

#[tokio::test]
async fn terminated_nodes_release_identifiers() {
    let (issuer, issuer_addr) = issuer(4, 13).await;
    let node = Node::register(LOOPBACK, &issuer_addr, SkipGraphConfig::default())
        .await
        .expect("register failed");
    let num_id = node.info().num_id;
    assert!(issuer.issuer().registered().iter().any(|n| n.num_id == num_id));

    node.terminate().await.expect("terminate failed");
    assert!(issuer.issuer().registered().is_empty());

    issuer.shutdown().await;
}

#[tokio::test]
async fn lone_node_has_no_guard() {
    let (issuer, issuer_addr) = issuer(4, 17).await;
    let node = Node::register(LOOPBACK, &issuer_addr, SkipGraphConfig::default())
        .await
        .expect("register failed");
    let report = node.join(None).await.expect("bootstrap join failed");
    assert_eq!(report.levels_linked, 0);

    let err = node.initialize_guards().await.unwrap_err();
    assert_eq!(
        err,
        SkipGraphError::NoGuard {
            num_id: node.info().num_id
        }
    );

    node.terminate().await.expect("terminate failed");
    issuer.shutdown().await;
}

#[tokio::test]
async fn peers_cannot_assign_guards() {
    let (issuer, issuer_addr) = issuer(16, 23).await;
    let nodes = timeout(TEST_TIMEOUT, overlay(&issuer_addr, 3, GuardPolicy::Single))
        .await
        .expect("overlay construction timed out");
    let a = &nodes[0];
    let status = a.status().await;
    let level0 = &status.levels[0];
    let neighbor = level0.left.as_ref().or(level0.right.as_ref()).expect("a has a neighbor");
    let b = nodes.iter().find(|n| n.info() == neighbor).expect("neighbor is a member");
    let before = status.guards.clone();
    assert_eq!(before.len(), 1);

    // b is a neighbor and position 1 is free, so only the sender check can
    // refuse this.
    let err = b
        .rpc()
        .set_guard_neighbor(a.info(), 1, b.info())
        .await
        .unwrap_err();
    assert!(matches!(err, SkipGraphError::InvalidRequest(_)), "{err:?}");
    assert_eq!(a.status().await.guards, before);

    // The node itself still can.
    a.initialize_guards().await.expect("guard initialization failed");

    for node in &nodes {
        node.terminate().await.expect("terminate failed");
    }
    issuer.shutdown().await;
}

#[tokio::test]
async fn silent_peer_does_not_stall_other_requests() {
    let (issuer, issuer_addr) = issuer(16, 29).await;
    let fast = SkipGraphConfig {
        rpc_timeout: Duration::from_secs(2),
        ..config(GuardPolicy::Single)
    };
    let first = Node::register(LOOPBACK, &issuer_addr, fast.clone())
        .await
        .expect("register failed");
    first.join(None).await.expect("bootstrap join failed");
    let second = Node::register(LOOPBACK, &issuer_addr, fast)
        .await
        .expect("register failed");
    second.join(Some(first.info())).await.expect("join failed");

    // Bound but never answers, so the QUIC handshake cannot complete.
    let silent = std::net::UdpSocket::bind(LOOPBACK).expect("bind silent socket");
    let silent_addr = silent.local_addr().expect("silent addr").to_string();
    let unreachable = NodeInfo::new(15, NameId::new("1111").expect("name id"), silent_addr);

    let (join, search) = tokio::join!(
        async {
            let started = Instant::now();
            (second.join(Some(&unreachable)).await, started.elapsed())
        },
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let started = Instant::now();
            (second.search(first.info().num_id).await, started.elapsed())
        },
    );

    let (found, search_elapsed) = search;
    assert_eq!(&found.expect("search failed"), first.info());
    assert!(search_elapsed < Duration::from_secs(1), "search took {search_elapsed:?}");

    let (result, join_elapsed) = join;
    assert!(
        matches!(result, Err(SkipGraphError::PartialJoin { level: 0, .. })),
        "{result:?}"
    );
    assert!(join_elapsed < Duration::from_secs(5), "join took {join_elapsed:?}");

    second.terminate().await.expect("terminate failed");
    first.terminate().await.expect("terminate failed");
    issuer.shutdown().await;
}
