//! End-to-end scenarios over the in-memory transport: elections, redirected
//! client traffic, leader failover, membership change, and persist-error
//! shutdown.

use bytes::Bytes;
use raft_replica::{
    Client, Config, ClientError, ConfigManager, Log, MemberChangeStatus, MemoryConfigManager,
    MemoryLog, MemorySnapshotStore, MemoryStateMachine, MemoryTransport, Notify, Options,
    RaftNode, ServerAddress, SnapshotStore, SnapshotWriter, StateMachine,
};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration, Instant};

fn discard_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn test_options() -> Options {
    Options {
        heartbeat_timeout: Some(Duration::from_millis(30)),
        election_timeout: Some(Duration::from_millis(100)),
        rpc_timeout: Some(Duration::from_millis(500)),
        persist_error_notify_timeout: Some(Duration::from_millis(100)),
        // Small batches so multi-entry catch-up exercises batching.
        max_append_entries_size: Some(4),
        ..Options::default()
    }
}

fn addr(name: &str) -> ServerAddress {
    ServerAddress::new(name)
}

fn addrs(names: &[&str]) -> Vec<ServerAddress> {
    names.iter().map(|n| addr(n)).collect()
}

struct TestNode {
    addr: ServerAddress,
    node: RaftNode,
    log: Arc<MemoryLog>,
    state_machine: Arc<MemoryStateMachine>,
    config_manager: Arc<MemoryConfigManager>,
    snapshots: Arc<MemorySnapshotStore>,
}

impl TestNode {
    fn spawn(transport: &MemoryTransport, local: &ServerAddress, members: &[ServerAddress]) -> Self {
        let log = Arc::new(MemoryLog::new());
        let state_machine = Arc::new(MemoryStateMachine::new());
        let config_manager = Arc::new(MemoryConfigManager::new(Config::normal(members.to_vec())));
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let node = Self::start(
            transport,
            local,
            Arc::clone(&log),
            Arc::clone(&state_machine),
            Arc::clone(&config_manager),
            Arc::clone(&snapshots),
        );
        TestNode {
            addr: local.clone(),
            node,
            log,
            state_machine,
            config_manager,
            snapshots,
        }
    }

    fn start(
        transport: &MemoryTransport,
        local: &ServerAddress,
        log: Arc<MemoryLog>,
        state_machine: Arc<MemoryStateMachine>,
        config_manager: Arc<MemoryConfigManager>,
        snapshots: Arc<MemorySnapshotStore>,
    ) -> RaftNode {
        RaftNode::new(
            discard_logger(),
            test_options(),
            local.clone(),
            log as Arc<dyn Log>,
            state_machine as Arc<dyn StateMachine>,
            config_manager as Arc<dyn ConfigManager>,
            snapshots as Arc<dyn SnapshotStore>,
            Arc::new(transport.client()),
            Box::new(transport.server(local.clone())),
        )
        .expect("node boots")
    }

    /// Restart after a simulated crash: same durable stores, fresh host state
    /// machine rebuilt by log replay.
    fn restart(&mut self, transport: &MemoryTransport) {
        self.state_machine = Arc::new(MemoryStateMachine::new());
        self.node = Self::start(
            transport,
            &self.addr,
            Arc::clone(&self.log),
            Arc::clone(&self.state_machine),
            Arc::clone(&self.config_manager),
            Arc::clone(&self.snapshots),
        );
    }
}

async fn wait_for_leader(nodes: &[&TestNode]) -> ServerAddress {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        for node in nodes {
            if let Some(leader) = node.node.local().leader() {
                let agreed = nodes
                    .iter()
                    .all(|n| n.node.local().leader().as_ref() == Some(&leader));
                let leads_itself = nodes.iter().any(|n| n.addr == leader);
                if agreed && leads_itself {
                    return leader;
                }
            }
        }
        assert!(Instant::now() < deadline, "no leader agreed upon in time");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_applied(state_machine: &MemoryStateMachine, expected: &[&[u8]]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let applied = state_machine.applied();
        if applied.len() >= expected.len() {
            let tail: Vec<Bytes> = expected.iter().map(|d| Bytes::copy_from_slice(d)).collect();
            assert_eq!(applied[applied.len() - tail.len()..], tail[..]);
            return;
        }
        assert!(
            Instant::now() < deadline,
            "state machine stuck at {:?}",
            applied
        );
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn single_node_cluster_applies_appends() {
    let transport = MemoryTransport::new();
    let members = addrs(&["a"]);
    let node = TestNode::spawn(&transport, &members[0], &members);

    let result = node.node.client().append(Bytes::from_static(b"x")).await;
    assert_eq!(result.unwrap(), Bytes::from_static(b"x"));
    assert_eq!(node.state_machine.applied(), vec![Bytes::from_static(b"x")]);
    assert_eq!(node.node.local().leader(), Some(members[0].clone()));

    node.node.close().await;
}

#[tokio::test]
async fn two_nodes_elect_one_leader() {
    let transport = MemoryTransport::new();
    let members = addrs(&["a", "b"]);
    let a = TestNode::spawn(&transport, &members[0], &members);
    let b = TestNode::spawn(&transport, &members[1], &members);

    let leader = wait_for_leader(&[&a, &b]).await;
    assert!(members.contains(&leader));

    // Exactly one of them leads.
    let leading: Vec<bool> = [&a, &b]
        .iter()
        .map(|n| n.node.local().leader() == Some(n.addr.clone()))
        .collect();
    assert_eq!(leading.iter().filter(|l| **l).count(), 1);

    a.node.close().await;
    b.node.close().await;
}

#[tokio::test]
async fn followers_redirect_client_requests_to_the_leader() {
    let transport = MemoryTransport::new();
    let members = addrs(&["a", "b", "c"]);
    let nodes: Vec<TestNode> = members
        .iter()
        .map(|m| TestNode::spawn(&transport, m, &members))
        .collect();

    let leader = wait_for_leader(&nodes.iter().collect::<Vec<_>>()).await;
    let follower = nodes.iter().find(|n| n.addr != leader).unwrap();
    let leader_node = nodes.iter().find(|n| n.addr == leader).unwrap();
    let before = leader_node.log.last_index().unwrap();

    let result = follower.node.client().append(Bytes::from_static(b"y")).await;
    assert_eq!(result.unwrap(), Bytes::from_static(b"y"));
    assert!(leader_node.log.last_index().unwrap() > before);
    wait_for_applied(&leader_node.state_machine, &[b"y"]).await;

    for node in &nodes {
        node.node.close().await;
    }
}

#[tokio::test]
async fn cluster_survives_leader_failure_and_converges() {
    let transport = MemoryTransport::new();
    let members = addrs(&["a", "b", "c"]);
    let mut nodes: Vec<TestNode> = members
        .iter()
        .map(|m| TestNode::spawn(&transport, m, &members))
        .collect();

    let first_leader = wait_for_leader(&nodes.iter().collect::<Vec<_>>()).await;
    let result = nodes[0].node.client().append(Bytes::from_static(b"z")).await;
    assert!(result.is_ok());

    // Crash the leader.
    let crashed = nodes.iter().position(|n| n.addr == first_leader).unwrap();
    nodes[crashed].node.close().await;

    // The survivors elect a new leader and keep accepting writes.
    let survivors: Vec<&TestNode> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != crashed)
        .map(|(_, n)| n)
        .collect();
    let second_leader = wait_for_leader(&survivors).await;
    assert_ne!(second_leader, first_leader);

    let result = survivors[0].node.client().append(Bytes::from_static(b"w")).await;
    assert!(result.is_ok());

    // The crashed node rejoins and replays to the same state.
    nodes[crashed].restart(&transport);
    wait_for_applied(&nodes[crashed].state_machine, &[b"z", b"w"]).await;

    for node in &nodes {
        node.node.close().await;
    }
}

#[tokio::test]
async fn membership_change_grows_the_cluster() {
    let transport = MemoryTransport::new();
    let members = addrs(&["a", "b", "c"]);
    let grown = addrs(&["a", "b", "c", "d", "e"]);

    let nodes: Vec<TestNode> = members
        .iter()
        .map(|m| TestNode::spawn(&transport, m, &members))
        .collect();
    // New members boot with the old seed config and learn the rest by
    // replication.
    let d = TestNode::spawn(&transport, &grown[3], &members);
    let e = TestNode::spawn(&transport, &grown[4], &members);

    wait_for_leader(&nodes.iter().collect::<Vec<_>>()).await;

    let result = nodes[0]
        .node
        .client()
        .change_config(Config::normal(grown.clone()))
        .await;
    assert!(result.is_ok(), "change_config failed: {:?}", result);

    // Everyone settles out of the change and the new members replicate.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let settled = nodes
            .iter()
            .chain([&d, &e])
            .all(|n| {
                n.node.local().member_change_status() == MemberChangeStatus::NotInMemberChange
            });
        if settled {
            break;
        }
        assert!(Instant::now() < deadline, "membership change never settled");
        sleep(Duration::from_millis(20)).await;
    }
    let conf = nodes[0].node.client().get_config().await.unwrap();
    assert_eq!(conf, Config::normal(grown.clone()));

    let result = nodes[0].node.client().append(Bytes::from_static(b"v")).await;
    assert!(result.is_ok());
    wait_for_applied(&d.state_machine, &[b"v"]).await;
    wait_for_applied(&e.state_machine, &[b"v"]).await;

    for node in nodes.iter().chain([&d, &e]) {
        node.node.close().await;
    }
}

#[tokio::test]
async fn snapshot_transfer_brings_a_trailing_member_up() {
    let transport = MemoryTransport::new();
    let seed = addrs(&["a"]);
    let a = TestNode::spawn(&transport, &seed[0], &seed);
    let b = TestNode::spawn(&transport, &addr("b"), &seed);

    for payload in [&b"x1"[..], b"x2", b"x3"] {
        let result = a.node.client().append(Bytes::copy_from_slice(payload)).await;
        assert!(result.is_ok());
    }

    // Host-side compaction: snapshot the applied state and discard the log
    // prefix. The new member will trail the retained log and must recover
    // over a chunked snapshot transfer.
    let last = a.log.last_index().unwrap();
    let last_term = a.log.last_term().unwrap();
    let mut writer = a
        .snapshots
        .create(last, last_term, seed.clone())
        .unwrap();
    writer.write_chunk(0, b"snapshot-state").unwrap();
    writer.commit().unwrap();
    a.log.reset(last, last_term).unwrap();

    let result = a
        .node
        .client()
        .change_config(Config::normal(addrs(&["a", "b"])))
        .await;
    assert!(result.is_ok(), "change_config failed: {:?}", result);

    // b received the snapshot and replicates past it.
    assert!(!b.snapshots.list().unwrap().is_empty());
    let result = a.node.client().append(Bytes::from_static(b"v")).await;
    assert!(result.is_ok());
    wait_for_applied(&b.state_machine, &[b"v"]).await;

    a.node.close().await;
    b.node.close().await;
}

#[tokio::test]
async fn persist_error_halts_the_node() {
    let transport = MemoryTransport::new();
    let members = addrs(&["a"]);
    let node = TestNode::spawn(&transport, &members[0], &members);
    let mut notifications = node.node.subscribe();

    // Let it elect itself and sync first.
    let result = node.node.client().append(Bytes::from_static(b"ok")).await;
    assert!(result.is_ok());

    node.log.fail_committed_index_stores();
    let result = node.node.client().append(Bytes::from_static(b"boom")).await;
    assert!(matches!(result, Err(ClientError::PersistError)));

    // An error notification goes out before the node winds itself down.
    let deadline = Duration::from_secs(2);
    let notified = timeout(deadline, async {
        loop {
            match notifications.recv().await {
                Ok(Notify::Error { .. }) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;
    assert!(matches!(notified, Ok(true)));

    // After the linger period the loop is gone and requests observe a closed
    // backend.
    sleep(Duration::from_millis(300)).await;
    let result = node.node.client().append(Bytes::from_static(b"late")).await;
    assert!(matches!(
        result,
        Err(ClientError::Closed) | Err(ClientError::Timeout)
    ));
}
