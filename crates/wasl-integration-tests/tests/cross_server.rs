//! Integration test: two full servers federate over real sockets.
//!
//! Covers the signed cluster handshake, gossip connectivity, rendezvous
//! replication across the ring, and the redirect path a client follows
//! when a key's owner is unreachable from its server.

use std::time::Duration;

use serde_json::json;

use wasl_identity::keypair::derive_node_id;
use wasl_ring::{HashRing, RingNode};
use wasl_server::Server;
use wasl_types::{MembershipEntry, PeerStatus, ServerId};

use wasl_integration_tests::{TestClient, TestServer};

/// Membership seed describing a running server, optionally with a
/// different advertised endpoint.
fn entry_for(server: &Server, endpoint: &str) -> MembershipEntry {
    let key = server
        .state
        .server_id
        .decode_public_key()
        .expect("server key");
    MembershipEntry {
        server_id: server.state.server_id.clone(),
        node_id: derive_node_id(&key),
        endpoint: endpoint.to_string(),
        public_key: server.state.keypair.public_key_base64(),
        status: PeerStatus::Alive,
        incarnation: 0,
        last_seen_ms: 0,
        metadata: Default::default(),
    }
}

#[tokio::test]
async fn test_handshake_gossip_and_replicated_query() {
    let s1 = TestServer::start(|_| {}).await;
    let s2 = TestServer::start(|_| {}).await;

    // Introduce the servers to each other; the dial tasks take it from
    // there (tie-break leaves exactly one live link usable by both).
    s1.server
        .state
        .runner
        .add_seed(entry_for(&s2.server, &s2.server.ws_base()))
        .await
        .expect("seed s1");
    s2.server
        .state
        .runner
        .add_seed(entry_for(&s1.server, &s1.server.ws_base()))
        .await
        .expect("seed s2");

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        let linked = s1.server.state.peers.connection_count().await >= 1
            && s2.server.state.peers.connection_count().await >= 1;
        if linked {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "cluster link never formed"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Bob publishes an hourly token on S2. Both servers own every key on
    // a two-node ring with replication factor 3, so the write replicates
    // to S1 over the new link.
    let mut bob = TestClient::connect(&s2.ws_url()).await;
    bob.register("XYZ567", "PK_B").await;
    bob.send_json(json!({
        "type": "rv_publish_hourly",
        "tokenHash": "feedbabe01",
        "relayId": "relay-9",
    }))
    .await;

    // Alice queries on S1 and finds Bob without leaving her server.
    let mut alice = TestClient::connect(&s1.ws_url()).await;
    alice.register("ABC234", "PK_A").await;

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    let live = loop {
        alice
            .send_json(json!({"type": "rv_query", "hourlyTokens": ["feedbabe01"]}))
            .await;
        let reply = alice.expect_type("rendezvous_result").await;
        let matches = reply["liveMatches"].as_array().expect("liveMatches").clone();
        if !matches.is_empty() {
            break matches;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "token never replicated to S1"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    assert_eq!(live[0]["tokenHash"], "feedbabe01");
    assert_eq!(live[0]["peerId"], "PK_B");
    assert_eq!(live[0]["relayId"], "relay-9");

    s1.stop().await;
    s2.stop().await;
}

#[tokio::test]
async fn test_redirect_to_owning_server() {
    // Replication factor 1: each key has exactly one owner. Long
    // suspicion windows keep the unreachable peer routable for the
    // duration of the test, so the redirect path stays active.
    let s1 = TestServer::start(|config| {
        config.dht.replication_factor = 1;
        config.dht.write_quorum = 1;
        config.gossip.suspicion_timeout_ms = 120_000;
        config.gossip.failure_timeout_ms = 240_000;
    })
    .await;
    let s2 = TestServer::start(|config| {
        config.dht.replication_factor = 1;
        config.dht.write_quorum = 1;
    })
    .await;

    // S1 learns about S2 under an unreachable endpoint: the ring routes
    // to S2 but every forward fails, so clients get redirects.
    let advertised = "ws://127.0.0.1:1";
    s1.server
        .state
        .runner
        .add_seed(entry_for(&s2.server, advertised))
        .await
        .expect("seed");

    // Pick a token hash that S2 owns, computed exactly the way the
    // servers compute it.
    let mut ring = HashRing::new(150);
    for server in [&s1.server, &s2.server] {
        let key = server.state.server_id.decode_public_key().expect("key");
        ring.add_node(RingNode {
            server_id: server.state.server_id.clone(),
            node_id: derive_node_id(&key),
            endpoint: String::new(),
            status: PeerStatus::Alive,
        })
        .expect("add");
    }
    let s2_id: ServerId = s2.server.state.server_id.clone();
    let token = (0..10_000)
        .map(|i| format!("tok{i:04x}"))
        .find(|candidate| {
            ring.primary_owner(candidate)
                .map(|owner| owner.server_id == s2_id)
                .unwrap_or(false)
        })
        .expect("some token owned by S2");

    // Bob is attached to S2 (its real address) and publishes there.
    let mut bob = TestClient::connect(&s2.ws_url()).await;
    bob.register("XYZ567", "PK_B").await;
    bob.send_json(json!({
        "type": "rv_publish_hourly",
        "tokenHash": token,
    }))
    .await;

    // Alice, on S1, gets a partial answer pointing at S2.
    let mut alice = TestClient::connect(&s1.ws_url()).await;
    alice.register("ABC234", "PK_A").await;

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    let redirect = loop {
        alice
            .send_json(json!({"type": "rv_query", "hourlyTokens": [token]}))
            .await;
        let reply = alice.next_json().await.expect("reply");
        if reply["type"] == "rendezvous_partial" {
            let redirects = reply["redirects"].as_array().expect("redirects").clone();
            assert!(!redirects.is_empty());
            break redirects[0].clone();
        }
        // The ring update from the seed may still be in flight
        assert_eq!(reply["type"], "rendezvous_result");
        assert!(
            std::time::Instant::now() < deadline,
            "never received a redirect"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    assert_eq!(redirect["serverId"], s2_id.as_str());
    assert_eq!(redirect["endpoint"], advertised);
    assert_eq!(redirect["hourlyTokens"][0], token);

    // Alice follows the redirect (using S2's reachable address) and the
    // owner answers with the live match.
    let mut alice_on_s2 = TestClient::connect(&s2.ws_url()).await;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        alice_on_s2
            .send_json(json!({"type": "rv_query", "hourlyTokens": [token]}))
            .await;
        let reply = alice_on_s2.expect_type("rendezvous_result").await;
        let matches = reply["liveMatches"].as_array().expect("matches");
        if !matches.is_empty() {
            assert_eq!(matches[0]["peerId"], "PK_B");
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "owner never returned the token"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    s1.stop().await;
    s2.stop().await;
}
