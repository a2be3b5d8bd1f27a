//! Multi-node integration tests for the QUASAR consensus core.
//!
//! Every test builds a small cluster on an in-memory network with one
//! shared manual clock, so slot boundaries happen exactly when the test
//! says so. Messages are pumped by hand: each node's inbound queue is
//! drained into `handle_inbound` until the cluster goes quiet.

use std::sync::Arc;
use std::time::Duration;

use quasar_protocol::config::NodeConfig;
use quasar_protocol::consensus::ManualClock;
use quasar_protocol::crypto::NodeKeypair;
use quasar_protocol::events::ConsensusEvent;
use quasar_protocol::network::{Inbound, MemoryNetwork, TransactionPool};
use quasar_protocol::storage::ChainStore;
use quasar_protocol::transaction::Transaction;
use quasar_protocol::ConsensusNode;

const GENESIS: u64 = 1_700_000_000_000;
const SLOT_MS: u64 = 2_000;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct Cluster {
    net: Arc<MemoryNetwork>,
    clock: Arc<ManualClock>,
    nodes: Vec<Arc<ConsensusNode>>,
    inbound: Vec<Inbound>,
}

fn config(id: &str, bootstrap: Vec<String>) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node_id = Some(id.to_string());
    config.network.listen_addr = format!("mem://{id}");
    config.network.bootstrap_peers = bootstrap;
    config.schedule.genesis_unix_ms = GENESIS;
    config.schedule.slot_duration_ms = SLOT_MS;
    config.schedule.slots_per_epoch = 8;
    config
}

/// `n` nodes. `meshed` nodes know each other up front; otherwise every
/// node but `n0` only knows `n0` as a bootstrap peer.
fn cluster(n: usize, meshed: bool) -> Cluster {
    let clock = Arc::new(ManualClock::new(GENESIS));
    let net = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(n);
    let mut inbound = Vec::with_capacity(n);

    for i in 0..n {
        let id = format!("n{i}");
        let bootstrap = if meshed || i == 0 {
            Vec::new()
        } else {
            vec!["mem://n0".to_string()]
        };
        let (transport, rx) = net.endpoint(&format!("mem://{id}"));
        let node = ConsensusNode::new(
            config(&id, bootstrap),
            NodeKeypair::from_seed(&[i as u8 + 1; 32]),
            Arc::new(transport),
            clock.clone(),
        )
        .expect("node");
        nodes.push(Arc::new(node));
        inbound.push(rx);
    }

    if meshed {
        for a in &nodes {
            for b in &nodes {
                if a.node_id() != b.node_id() {
                    a.add_peer(b.node_id(), b.public_key(), b.address());
                }
            }
        }
    }

    Cluster {
        net,
        clock,
        nodes,
        inbound,
    }
}

impl Cluster {
    /// Deliver messages until nobody has anything left to say.
    async fn pump(&mut self) -> usize {
        let mut total = 0;
        loop {
            // Let spawned sends land in the queues.
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut handled = 0;
            for (node, rx) in self.nodes.iter().zip(self.inbound.iter_mut()) {
                while let Ok((from, bytes)) = rx.try_recv() {
                    let _ = node.handle_inbound(&from, &bytes).await;
                    handled += 1;
                }
            }
            if handled == 0 {
                return total;
            }
            total += handled;
        }
    }

    async fn tick_all(&self) {
        for node in &self.nodes {
            node.on_slot_tick().await.expect("slot tick");
        }
    }

    async fn advance_slot(&mut self) {
        self.clock.advance(SLOT_MS);
        self.tick_all().await;
        self.pump().await;
    }

    async fn gossip_all(&mut self) {
        for node in &self.nodes {
            node.gossip_round();
        }
        self.pump().await;
    }

    fn node(&self, id: &str) -> &Arc<ConsensusNode> {
        self.nodes
            .iter()
            .find(|n| n.node_id() == id)
            .expect("node in cluster")
    }
}

fn transfer(seed: u8, payload: &[u8]) -> Transaction {
    Transaction::new_signed(&NodeKeypair::from_seed(&[seed; 32]), payload.to_vec(), GENESIS)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_registries_produce_identical_schedules() {
    let c = cluster(3, true);
    c.tick_all().await;

    let digests: Vec<_> = c
        .nodes
        .iter()
        .map(|n| n.schedule().current_table().expect("table").digest())
        .collect();
    assert!(digests.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(
        c.nodes[0].schedule().current_table().unwrap().distinct_leaders(),
        3
    );
}

#[tokio::test]
async fn transaction_reaches_leaders_and_lands_in_a_block() {
    let mut c = cluster(3, true);
    c.tick_all().await;

    let leader_id = c.nodes[0].schedule().leader_for_slot(1).expect("leader for slot 1");
    let submitter = c
        .nodes
        .iter()
        .find(|n| *n.node_id() != leader_id)
        .cloned()
        .expect("a non-leader");

    let tx = transfer(42, b"pay alice 10");
    let report = submitter.submit_transaction(tx.clone()).await.unwrap();
    assert_eq!(report.delivered.len(), 2);
    c.pump().await;

    // INV -> GETDATA -> TX: every node now holds the transaction.
    for node in &c.nodes {
        assert!(node.mempool().contains(&tx.id), "{} lacks tx", node.node_id());
    }

    let mut events = c.node(&leader_id).events().subscribe();
    c.advance_slot().await; // slot 1 begins
    c.advance_slot().await; // slot 1 ends: its leader produces

    for node in &c.nodes {
        assert_eq!(node.chain().height(), 2, "{} height", node.node_id());
        let block = node.chain().block_at_slot(1).expect("block for slot 1");
        assert_eq!(block.transactions, vec![tx.clone()]);
        assert!(node.mempool().is_empty());
        assert!(node.forwarder().record(&tx.id).is_none());
    }

    let mut produced = false;
    while let Ok(event) = events.try_recv() {
        if let ConsensusEvent::BlockProduced { slot: 1, transactions: 1, .. } = event {
            produced = true;
        }
    }
    assert!(produced);
}

#[tokio::test]
async fn legacy_transaction_uses_the_same_admission_path() {
    let mut c = cluster(2, true);
    let tx = transfer(5, b"legacy");
    let mut forged = tx.clone();
    forged.payload = b"tampered".to_vec();

    // Hand-built legacy envelopes from n0 to n1.
    let genuine = quasar_protocol::network::Envelope::new(
        "n0".into(),
        "mem://n0".into(),
        GENESIS,
        quasar_protocol::network::MessageKind::Transaction(tx.clone()),
    );
    let bogus = quasar_protocol::network::Envelope::new(
        "n0".into(),
        "mem://n0".into(),
        GENESIS + 1,
        quasar_protocol::network::MessageKind::Transaction(forged),
    );
    let n1 = c.nodes[1].clone();
    n1.handle_inbound("mem://n0", &genuine.encode().unwrap())
        .await
        .unwrap();
    assert!(n1
        .handle_inbound("mem://n0", &bogus.encode().unwrap())
        .await
        .is_err());
    c.pump().await;

    assert!(n1.mempool().contains(&tx.id));
    assert_eq!(n1.mempool().len(), 1);
}

#[tokio::test]
async fn legacy_transaction_at_a_non_leader_reaches_the_leader() {
    let mut c = cluster(3, true);
    c.tick_all().await;
    let leader_id = c.nodes[0].schedule().current_leader().expect("leader");
    let entry = c
        .nodes
        .iter()
        .find(|n| *n.node_id() != leader_id)
        .cloned()
        .expect("a non-leader");

    // A client that is not a cluster member hands the transaction over.
    let tx = transfer(11, b"legacy to follower");
    let envelope = quasar_protocol::network::Envelope::new(
        "client".into(),
        "mem://client".into(),
        GENESIS,
        quasar_protocol::network::MessageKind::Transaction(tx.clone()),
    );
    entry
        .handle_inbound("mem://client", &envelope.encode().unwrap())
        .await
        .unwrap();
    c.pump().await;

    assert!(c.node(&leader_id).mempool().contains(&tx.id));
    let record = entry.forwarder().record(&tx.id).expect("forwarding record");
    assert!(record.delivered.contains_key(&leader_id));
}

#[tokio::test]
async fn partitioned_node_catches_up_through_sync() {
    let mut c = cluster(3, true);
    c.tick_all().await;
    let leader_id = c.nodes[0].schedule().leader_for_slot(1).unwrap();
    let follower = c
        .nodes
        .iter()
        .find(|n| *n.node_id() != leader_id)
        .cloned()
        .unwrap();

    c.net.set_down(follower.address(), true);
    c.advance_slot().await;
    c.advance_slot().await;
    assert_eq!(c.node(&leader_id).chain().height(), 2);
    assert_eq!(follower.chain().height(), 1);

    c.net.set_down(follower.address(), false);
    let leader_addr = c.node(&leader_id).address().to_string();
    follower.request_sync(Some(&leader_addr));
    c.pump().await;

    assert_eq!(follower.chain().height(), 2);
    assert_eq!(
        follower.chain().tip().hash(),
        c.node(&leader_id).chain().tip().hash()
    );
}

#[tokio::test]
async fn gossip_discovers_the_whole_cluster_from_one_bootstrap_peer() {
    let mut c = cluster(4, false);
    for node in &c.nodes {
        node.bootstrap().await;
    }
    c.pump().await;
    assert_eq!(c.nodes[0].registry().len(), 4);

    for _ in 0..3 {
        c.gossip_all().await;
    }

    for node in &c.nodes {
        assert_eq!(node.registry().len(), 4, "{} registry", node.node_id());
        assert_eq!(node.gossip().peer_count(), 3, "{} peers", node.node_id());
        assert_eq!(node.registry().addressed_peers().len(), 4);
    }
}

#[tokio::test]
async fn schedules_are_published_through_gossip() {
    let mut c = cluster(3, true);
    c.tick_all().await;
    for _ in 0..2 {
        c.gossip_all().await;
    }

    // Contact info plus one schedule per node, everywhere.
    for node in &c.nodes {
        assert_eq!(node.gossip().table().len(), 6, "{} crds", node.node_id());
    }
    let reference = c.nodes[0].schedule().current_table().unwrap().digest();
    for node in &c.nodes {
        assert_eq!(node.schedule().current_table().unwrap().digest(), reference);
    }
}

#[tokio::test]
async fn unreachable_peer_is_demoted_and_recovers() {
    let mut c = cluster(2, true);
    let mut events = c.nodes[0].events().subscribe();
    c.net.set_down("mem://n1", true);

    let timeout = c.nodes[0].config().gossip.liveness_timeout_ms;
    let rounds = c.nodes[0].config().gossip.max_failed_rounds;
    c.gossip_all().await;
    for _ in 0..rounds {
        c.clock.advance(timeout);
        c.gossip_all().await;
    }
    assert!(c.nodes[0].gossip().peer_health("n1").unwrap().demoted);

    c.net.set_down("mem://n1", false);
    c.clock.advance(timeout);
    c.gossip_all().await;
    assert!(!c.nodes[0].gossip().peer_health("n1").unwrap().demoted);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ConsensusEvent::PeerDemoted { node_id } => seen.push(format!("down:{node_id}")),
            ConsensusEvent::PeerRecovered { node_id } => seen.push(format!("up:{node_id}")),
            _ => {}
        }
    }
    assert_eq!(seen, vec!["down:n1", "up:n1"]);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let mut c = cluster(1, true);
    let node = c.nodes[0].clone();
    let inbound = c.inbound.remove(0);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(node.clone().run(inbound, shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("node stopped in time")
        .expect("run task");
    assert!(node.schedule().current_table().is_some());
}
