//! The client WebSocket endpoint.
//!
//! `GET /ws` upgrades, greets with a signed `server_info`, then processes
//! frames strictly in arrival order. Outbound traffic goes through the
//! connection's bounded queue; a writer task pumps it to the socket and
//! closes with the recorded reason when the queue is dropped.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

use wasl_pairing::{ClientSink, PairError, SignalKind};
use wasl_proto::{ClientMessage, ProtoError, ServerMessage, MAX_FRAME_BYTES};
use wasl_types::ConnId;

use crate::client::rate_limit::{StrikeCounter, TokenBucket};
use crate::client::CLOSE_SLOW_CONSUMER;
use crate::state::{now_ms, AppState};

/// Strike window for protocol violations.
const STRIKE_WINDOW_MS: u64 = 60_000;

/// Violations tolerated per window before the connection closes.
const MAX_STRIKES: usize = 5;

/// `GET /ws` — client WebSocket upgrade.
pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (conn_id, mut outbound_rx) = state.clients.add();
    state.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(conn_id, "client connected");

    let (mut sender, mut receiver) = socket.split();

    // Writer task: queue -> socket, closing with the recorded reason.
    let clients = Arc::clone(&state.clients);
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let Ok(json) = message.to_json() else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
        let reason = clients.take_close_reason(conn_id).unwrap_or("closed");
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: reason.into(),
            })))
            .await;
    });

    send_server_info(&state, conn_id);

    let mut bucket = TokenBucket::per_minute(state.config.client.rate_limit_per_minute, now_ms());
    let mut strikes = StrikeCounter::new(STRIKE_WINDOW_MS, MAX_STRIKES);
    let idle_window =
        std::time::Duration::from_secs(state.config.client.heartbeat_timeout_secs.max(1));

    loop {
        // A connection silent past the heartbeat timeout is dead weight.
        let frame = match tokio::time::timeout(idle_window, receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(_) => break,
            Err(_) => {
                tracing::debug!(conn_id, "client idle past heartbeat timeout");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if !process_frame(&state, conn_id, &text, &mut bucket, &mut strikes).await {
                    break;
                }
            }
            Message::Binary(_) => {
                state
                    .clients
                    .send(conn_id, ServerMessage::error("bad_request"));
                if register_strike(&state, conn_id, &mut strikes) {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
        if !state.clients.is_open(conn_id) {
            break;
        }
    }

    // Deterministic per-connection cleanup: pending pairs, code, relay
    // registration, connection slot.
    state.pairing.connection_closed(conn_id).await;
    if let Some(peer_id) = state.clients.peer_id(conn_id) {
        if let Err(err) = state.engine.relay_disconnect(&peer_id).await {
            tracing::debug!(error = %err, "relay cleanup failed");
        }
    }
    state.clients.remove(conn_id);
    // Give the writer a moment to flush its close frame.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    tracing::debug!(conn_id, "client disconnected");
}

fn send_server_info(state: &Arc<AppState>, conn_id: ConnId) {
    let mut nonce_bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce_bytes);
    let nonce = hex::encode(nonce_bytes);
    let signature = state.keypair.sign(nonce.as_bytes());
    state.clients.send(
        conn_id,
        ServerMessage::ServerInfo {
            server_id: state.server_id.clone(),
            public_key: state.keypair.public_key_base64(),
            nonce,
            signature,
        },
    );
}

/// Handle one text frame. Returns false when the connection must close.
async fn process_frame(
    state: &Arc<AppState>,
    conn_id: ConnId,
    text: &str,
    bucket: &mut TokenBucket,
    strikes: &mut StrikeCounter,
) -> bool {
    let now = now_ms();

    if !bucket.try_consume(now) {
        state.metrics.rate_limit_trips.fetch_add(1, Ordering::Relaxed);
        state.clients.send(conn_id, ServerMessage::error("rate_limit"));
        return !register_strike(state, conn_id, strikes);
    }

    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(ProtoError::UnknownType(tag)) => {
            state.metrics.unknown_types.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(conn_id, tag, "unknown message type");
            state
                .clients
                .send(conn_id, ServerMessage::error("unknown_type"));
            return true;
        }
        Err(_) => {
            state
                .clients
                .send(conn_id, ServerMessage::error("bad_request"));
            return !register_strike(state, conn_id, strikes);
        }
    };

    dispatch(state, conn_id, message, now).await;
    true
}

/// Record a violation; on trip, close the connection with
/// `slow_consumer`. Returns true when tripped.
fn register_strike(state: &Arc<AppState>, conn_id: ConnId, strikes: &mut StrikeCounter) -> bool {
    state.metrics.protocol_strikes.fetch_add(1, Ordering::Relaxed);
    if strikes.strike(now_ms()) {
        tracing::debug!(conn_id, "closing repeat offender");
        state.clients.force_close(conn_id, CLOSE_SLOW_CONSUMER);
        true
    } else {
        false
    }
}

async fn dispatch(state: &Arc<AppState>, conn_id: ConnId, message: ClientMessage, now: u64) {
    match message {
        ClientMessage::Register {
            pairing_code,
            public_key,
        } => {
            if !state.clients.bind_peer(conn_id, &public_key) {
                state
                    .clients
                    .send(conn_id, ServerMessage::error("too_many_connections"));
                return;
            }
            match state.pairing.register(conn_id, &pairing_code, &public_key).await {
                Ok(()) => {
                    state.clients.send(
                        conn_id,
                        ServerMessage::Registered {
                            server_id: state.server_id.clone(),
                        },
                    );
                }
                Err(err) => send_pair_error(state, conn_id, &err),
            }
        }
        ClientMessage::PairRequest { target_code } => {
            if let Err(err) = state.pairing.pair_request(conn_id, &target_code).await {
                send_pair_error(state, conn_id, &err);
            }
        }
        ClientMessage::PairResponse {
            target_code,
            accepted,
        } => {
            if let Err(err) = state.pairing.pair_response(conn_id, &target_code, accepted).await {
                send_pair_error(state, conn_id, &err);
            }
        }
        ClientMessage::PairCancel { target_code } => {
            if let Err(err) = state.pairing.pair_cancel(conn_id, &target_code).await {
                send_pair_error(state, conn_id, &err);
            }
        }
        ClientMessage::Offer { target, payload } => {
            relay_signal(state, conn_id, &target, SignalKind::Offer, payload);
        }
        ClientMessage::Answer { target, payload } => {
            relay_signal(state, conn_id, &target, SignalKind::Answer, payload);
        }
        ClientMessage::IceCandidate { target, payload } => {
            relay_signal(state, conn_id, &target, SignalKind::IceCandidate, payload);
        }
        ClientMessage::RvPublishDaily {
            point_hash,
            dead_drop,
            relay_id,
            ttl_ms,
        } => {
            let Some(peer_id) = state.clients.peer_id(conn_id) else {
                state
                    .clients
                    .send(conn_id, ServerMessage::error("not_registered"));
                return;
            };
            match state
                .engine
                .publish_daily(&point_hash, &peer_id, dead_drop, relay_id, ttl_ms, now)
                .await
            {
                Ok(outcome) if !outcome.quorum_met => {
                    tracing::debug!(
                        acks = outcome.acks,
                        target = outcome.quorum_target,
                        "daily publish below write quorum"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "daily publish failed");
                    state
                        .clients
                        .send(conn_id, ServerMessage::error("publish_failed"));
                }
            }
        }
        ClientMessage::RvPublishHourly {
            token_hash,
            relay_id,
            ttl_ms,
        } => {
            let Some(peer_id) = state.clients.peer_id(conn_id) else {
                state
                    .clients
                    .send(conn_id, ServerMessage::error("not_registered"));
                return;
            };
            match state
                .engine
                .publish_hourly(&token_hash, &peer_id, relay_id, ttl_ms, now)
                .await
            {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "hourly publish failed");
                    state
                        .clients
                        .send(conn_id, ServerMessage::error("publish_failed"));
                }
            }
        }
        ClientMessage::RvQuery {
            daily_points,
            hourly_tokens,
        } => {
            let outcome = state.engine.query(&daily_points, &hourly_tokens, now).await;
            let reply = if outcome.is_complete() {
                ServerMessage::RendezvousResult {
                    live_matches: outcome.live_matches,
                    dead_drops: outcome.dead_drops,
                }
            } else {
                ServerMessage::RendezvousPartial {
                    live_matches: outcome.live_matches,
                    dead_drops: outcome.dead_drops,
                    redirects: outcome.redirects,
                }
            };
            state.clients.send(conn_id, reply);
        }
        ClientMessage::RelayAnnounce {
            max_connections,
            public_key,
        } => {
            let Some(peer_id) = state.clients.peer_id(conn_id) else {
                state
                    .clients
                    .send(conn_id, ServerMessage::error("not_registered"));
                return;
            };
            if let Err(err) = state
                .engine
                .announce_relay(&peer_id, max_connections, public_key, now)
                .await
            {
                tracing::warn!(error = %err, "relay announce failed");
            }
        }
        ClientMessage::RelayUpdate { connected_count } => {
            let Some(peer_id) = state.clients.peer_id(conn_id) else {
                state
                    .clients
                    .send(conn_id, ServerMessage::error("not_registered"));
                return;
            };
            match state
                .engine
                .update_relay_load(&peer_id, connected_count, now)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    state
                        .clients
                        .send(conn_id, ServerMessage::error("not_announced"));
                }
                Err(err) => tracing::warn!(error = %err, "relay update failed"),
            }
        }
        ClientMessage::Ping => {
            state.clients.send(conn_id, ServerMessage::Pong);
        }
    }
}

fn relay_signal(
    state: &Arc<AppState>,
    conn_id: ConnId,
    target: &str,
    kind: SignalKind,
    payload: serde_json::Value,
) {
    let Some(from_code) = state.pairing.code_for_conn(conn_id) else {
        state
            .clients
            .send(conn_id, ServerMessage::error("not_registered"));
        return;
    };
    match state.relay.relay(&from_code, target, kind, payload) {
        Ok(()) => {}
        Err(wasl_pairing::relay::RelayError::NotPaired) => {
            state.clients.send(conn_id, ServerMessage::error("not_paired"));
        }
        Err(wasl_pairing::relay::RelayError::PeerUnavailable) => {
            state
                .clients
                .send(conn_id, ServerMessage::error("peer_unavailable"));
        }
    }
}

fn send_pair_error(state: &Arc<AppState>, conn_id: ConnId, err: &PairError) {
    state.clients.send(
        conn_id,
        ServerMessage::PairError {
            code: err.wire_code().to_string(),
        },
    );
}
