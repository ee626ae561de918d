//! Integration test: SWIM failure detection across three logical
//! servers, no sockets.
//!
//! A scripted "network" routes SwimOutput frames between three
//! `Membership` state machines with a controllable partition. Verifies:
//! a partitioned node is suspected and then failed within the configured
//! windows; its virtual positions leave the ring; on heal it refutes
//! with a raised incarnation and rejoins within one exchange.

use std::collections::BTreeMap;
use std::time::Duration;

use wasl_gossip::{GossipConfig, Membership, SwimOutput};
use wasl_ring::{HashRing, RingNode};
use wasl_types::{MembershipEntry, NodeId, PeerStatus, ServerId};

const STEP_MS: u64 = 500;

fn make_entry(byte: u8) -> MembershipEntry {
    MembershipEntry {
        server_id: ServerId::from_public_key(&[byte; 32]),
        node_id: NodeId([byte; 20]),
        endpoint: format!("ws://10.0.0.{byte}:9000"),
        public_key: format!("pk-{byte}"),
        status: PeerStatus::Alive,
        incarnation: 0,
        last_seen_ms: 0,
        metadata: BTreeMap::new(),
    }
}

fn test_config() -> GossipConfig {
    GossipConfig {
        tick_interval: Duration::from_millis(STEP_MS),
        probe_timeout: Duration::from_millis(1_000),
        suspicion_timeout: Duration::from_millis(2_000),
        failure_timeout: Duration::from_millis(3_000),
        indirect_ping_count: 2,
        state_exchange_interval: Duration::from_millis(4_000),
        failed_gc_horizon: Duration::from_millis(600_000),
        max_piggyback: 8,
    }
}

/// Three membership machines and a message network with a partition set.
struct Cluster {
    nodes: Vec<Membership>,
    ids: Vec<ServerId>,
    /// Indices currently cut off from everyone else.
    partitioned: Vec<usize>,
    now_ms: u64,
}

impl Cluster {
    fn new() -> Cluster {
        let ids: Vec<ServerId> = (1..=3u8)
            .map(|byte| make_entry(byte).server_id)
            .collect();
        let mut nodes = Vec::new();
        for byte in 1..=3u8 {
            let mut membership = Membership::new(test_config(), make_entry(byte));
            for other in 1..=3u8 {
                if other != byte {
                    membership.apply_remote(make_entry(other), 0);
                }
            }
            nodes.push(membership);
        }
        Cluster {
            nodes,
            ids,
            partitioned: Vec::new(),
            now_ms: 0,
        }
    }

    fn index_of(&self, id: &ServerId) -> usize {
        self.ids
            .iter()
            .position(|candidate| candidate == id)
            .unwrap_or_else(|| panic!("unknown id {id}"))
    }

    fn reachable(&self, a: usize, b: usize) -> bool {
        !self.partitioned.contains(&a) && !self.partitioned.contains(&b)
    }

    /// Advance one tick on every node, routing all produced frames.
    fn step(&mut self) {
        self.now_ms += STEP_MS;
        let now = self.now_ms;

        let mut inflight: Vec<(usize, usize, SwimOutput)> = Vec::new();
        for index in 0..self.nodes.len() {
            for output in self.nodes[index].tick(now) {
                if let Some(to) = destination(&output) {
                    inflight.push((index, self.index_of(&to), output));
                }
            }
        }

        // Deliver until quiescent (acks generate more frames).
        while let Some((from, to, output)) = inflight.pop() {
            if !self.reachable(from, to) {
                continue;
            }
            let from_id = self.ids[from].clone();
            let responses = match output {
                SwimOutput::SendPing { seq, .. } => self.nodes[to].on_ping(&from_id, seq, now),
                SwimOutput::SendAck { seq, .. } => self.nodes[to].on_ack(&from_id, seq, now),
                SwimOutput::SendIndirectPing { target, seq, .. } => {
                    self.nodes[to].on_indirect_ping(&from_id, &target, seq, now)
                }
                SwimOutput::SendStateExchange { members, .. } => {
                    self.nodes[to].on_state_exchange(members, now)
                }
                _ => Vec::new(),
            };
            for response in responses {
                if let Some(next_to) = destination(&response) {
                    inflight.push((to, self.index_of(&next_to), response));
                }
            }
        }
    }

    fn status_at(&self, observer: usize, subject: usize) -> Option<PeerStatus> {
        self.nodes[observer]
            .entry(&self.ids[subject])
            .map(|entry| entry.status)
    }

    fn run_until(&mut self, max_steps: usize, mut done: impl FnMut(&Cluster) -> bool) -> bool {
        for _ in 0..max_steps {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }
}

fn destination(output: &SwimOutput) -> Option<ServerId> {
    match output {
        SwimOutput::SendPing { to, .. }
        | SwimOutput::SendAck { to, .. }
        | SwimOutput::SendStateExchange { to, .. } => Some(to.clone()),
        SwimOutput::SendIndirectPing { via, .. } => Some(via.clone()),
        SwimOutput::StatusChanged { .. } | SwimOutput::MemberRemoved { .. } => None,
    }
}

#[test]
fn test_partition_suspects_then_fails() {
    let mut cluster = Cluster::new();

    // Healthy cluster stays healthy
    assert!(cluster.run_until(20, |c| {
        c.status_at(0, 2) == Some(PeerStatus::Alive) && c.status_at(1, 2) == Some(PeerStatus::Alive)
    }));

    // Cut node 3 off
    cluster.partitioned = vec![2];

    // Suspicion first...
    assert!(
        cluster.run_until(40, |c| c.status_at(0, 2) == Some(PeerStatus::Suspect)
            || c.status_at(0, 2) == Some(PeerStatus::Failed)),
        "S1 never suspected S3"
    );
    // ...then failure on both observers within the failure window
    assert!(
        cluster.run_until(40, |c| {
            c.status_at(0, 2) == Some(PeerStatus::Failed)
                && c.status_at(1, 2) == Some(PeerStatus::Failed)
        }),
        "S3 never marked failed"
    );
}

#[test]
fn test_failed_node_leaves_ring_and_rejoins_after_refutation() {
    let mut cluster = Cluster::new();

    // Mirror S1's view into a ring
    let mut ring = HashRing::new(32);
    for byte in 1..=3u8 {
        let entry = make_entry(byte);
        ring.add_node(RingNode {
            server_id: entry.server_id,
            node_id: entry.node_id,
            endpoint: entry.endpoint,
            status: PeerStatus::Alive,
        })
        .expect("add");
    }

    cluster.partitioned = vec![2];
    assert!(cluster.run_until(80, |c| c.status_at(0, 2) == Some(PeerStatus::Failed)));

    let s3 = cluster.ids[2].clone();
    ring.update_status(&s3, PeerStatus::Failed).expect("update");
    for key in ["k1", "k2", "k3", "k4"] {
        assert!(
            ring.responsible_nodes(key, 3)
                .iter()
                .all(|n| n.server_id != s3),
            "failed node still owns {key}"
        );
    }

    // Heal the partition. S3 learns it was declared failed via a state
    // exchange, raises its incarnation, and the refutation spreads.
    cluster.partitioned = Vec::new();
    let s1_view = cluster.nodes[0].snapshot();
    let now = cluster.now_ms;
    cluster.nodes[2].on_state_exchange(s1_view, now);
    assert!(
        cluster.nodes[2].local_entry().incarnation > 0,
        "S3 must refute with a raised incarnation"
    );

    // Deliver S3's refutation the way the wire would: as a piggy-backed
    // delta on its next frame.
    let refutation = cluster.nodes[2].take_piggyback(8);
    let now = cluster.now_ms;
    for entry in refutation {
        cluster.nodes[0].apply_remote(entry.clone(), now);
        cluster.nodes[1].apply_remote(entry, now);
    }

    assert_eq!(cluster.status_at(0, 2), Some(PeerStatus::Alive));
    assert_eq!(cluster.status_at(1, 2), Some(PeerStatus::Alive));

    ring.update_status(&s3, PeerStatus::Alive).expect("update");
    let owners_somewhere = ["k1", "k2", "k3", "k4", "k5", "k6", "k7", "k8"]
        .iter()
        .any(|key| {
            ring.responsible_nodes(key, 1)
                .iter()
                .any(|n| n.server_id == s3)
        });
    assert!(owners_somewhere, "rejoined node owns nothing");
}

#[test]
fn test_incarnation_monotonic_under_churn() {
    let mut cluster = Cluster::new();
    let mut observed: Vec<u64> = Vec::new();

    let record = |cluster: &Cluster, observed: &mut Vec<u64>| {
        if let Some(entry) = cluster.nodes[0].entry(&cluster.ids[2]) {
            observed.push(entry.incarnation);
        }
    };

    for round in 0..3 {
        cluster.partitioned = vec![2];
        for _ in 0..20 {
            cluster.step();
            record(&cluster, &mut observed);
        }
        cluster.partitioned = Vec::new();
        let view = cluster.nodes[0].snapshot();
        let now = cluster.now_ms;
        cluster.nodes[2].on_state_exchange(view, now);
        let refutation = cluster.nodes[2].take_piggyback(8);
        for entry in refutation {
            cluster.nodes[0].apply_remote(entry, now);
        }
        record(&cluster, &mut observed);
        assert_eq!(
            cluster.status_at(0, 2),
            Some(PeerStatus::Alive),
            "round {round}: refutation failed"
        );
    }

    assert!(
        observed.windows(2).all(|w| w[0] <= w[1]),
        "incarnations regressed: {observed:?}"
    );
}
