//! Outgoing peer connections.
//!
//! One `connect_peer` task per wanted peer. The task dials, performs the
//! signed handshake, registers with the [`PeerManager`](crate::PeerManager)
//! and then pumps frames both ways until the socket dies, the queue is
//! replaced by a duplicate winner, or shutdown is signalled. Failures
//! retry with capped exponential backoff and ±1 s jitter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use wasl_identity::Keypair;
use wasl_proto::{Handshake, PeerMessage};
use wasl_types::ServerId;

use crate::peer::{ConnectionKind, PeerManager, RegisterOutcome};
use crate::{backoff_delay, Result, TransportConfig, TransportError, CLOSE_REASON_DUPLICATE};

/// Maximum accepted handshake timestamp skew (5 minutes).
pub const MAX_HANDSHAKE_SKEW_MS: u64 = 5 * 60 * 1000;

/// How a dial session ended.
enum SessionEnd {
    /// Socket closed or errored; retry after backoff.
    Disconnected,
    /// Lost the duplicate tie-break; the other connection carries traffic.
    Duplicate,
    /// Our queue was replaced by a newer registration; stop quietly.
    Replaced,
}

/// Check a verified handshake's freshness.
///
/// # Errors
///
/// Returns [`TransportError::Handshake`] when the timestamp is outside
/// the replay window.
pub fn check_handshake_fresh(handshake: &Handshake, now_ms: u64) -> Result<()> {
    let age = now_ms.abs_diff(handshake.timestamp_ms);
    if age > MAX_HANDSHAKE_SKEW_MS {
        return Err(TransportError::Handshake(format!(
            "timestamp skew {age} ms exceeds {MAX_HANDSHAKE_SKEW_MS} ms"
        )));
    }
    Ok(())
}

/// Dial and maintain a connection to one peer until shutdown.
///
/// The task ends when `shutdown` fires, when the peer wins the duplicate
/// tie-break (the surviving connection is managed elsewhere), or when the
/// registration is replaced.
#[allow(clippy::too_many_arguments)]
pub async fn connect_peer(
    manager: Arc<PeerManager>,
    keypair: Arc<Keypair>,
    config: TransportConfig,
    local_endpoint: String,
    metadata: BTreeMap<String, String>,
    target_id: ServerId,
    target_endpoint: String,
    inbound: mpsc::Sender<(ServerId, PeerMessage)>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut attempt: u32 = 0;

    loop {
        let session = tokio::select! {
            end = run_session(
                &manager,
                &keypair,
                &config,
                &local_endpoint,
                &metadata,
                &target_id,
                &target_endpoint,
                &inbound,
            ) => end,
            _ = shutdown.recv() => return,
        };

        match session {
            Ok(SessionEnd::Replaced) => return,
            Ok(SessionEnd::Duplicate) => {
                // The peer keeps its outgoing side; back off hard and
                // re-check in case that connection dies.
                attempt = 0;
                tokio::select! {
                    _ = tokio::time::sleep(config.reconnect_max_interval) => {}
                    _ = shutdown.recv() => return,
                }
                if manager.is_connected(&target_id).await {
                    continue;
                }
            }
            Ok(SessionEnd::Disconnected) => {
                attempt = 0; // a completed session resets the backoff
            }
            Err(err) => {
                tracing::debug!(peer = %target_id, error = %err, attempt, "dial failed");
                attempt = attempt.saturating_add(1);
            }
        }

        let delay = backoff_delay(&config, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    manager: &Arc<PeerManager>,
    keypair: &Arc<Keypair>,
    config: &TransportConfig,
    local_endpoint: &str,
    metadata: &BTreeMap<String, String>,
    target_id: &ServerId,
    target_endpoint: &str,
    inbound: &mpsc::Sender<(ServerId, PeerMessage)>,
) -> Result<SessionEnd> {
    let url = format!("{}/cluster", target_endpoint.trim_end_matches('/'));
    let (ws, _response) = tokio::time::timeout(
        config.handshake_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await
    .map_err(|_| TransportError::Connection(format!("connect timeout to {url}")))?
    .map_err(|e| TransportError::Connection(e.to_string()))?;

    let (mut sink, mut stream) = ws.split();

    // Opening handshake
    let handshake = Handshake::build(keypair, local_endpoint, metadata.clone(), unix_ms())?;
    let frame = PeerMessage::Handshake(handshake).to_json()?;
    sink.send(Message::Text(frame.into()))
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    // Await the signed ack
    let ack = tokio::time::timeout(config.handshake_timeout, read_handshake_ack(&mut stream))
        .await
        .map_err(|_| TransportError::Handshake("ack timeout".to_string()))??;

    ack.verify()?;
    check_handshake_fresh(&ack, unix_ms())?;
    if ack.server_id != *target_id {
        return Err(TransportError::IdentityMismatch {
            expected: target_id.to_string(),
            actual: ack.server_id.to_string(),
        });
    }

    // Register; losing the tie-break closes this socket
    let rx = match manager
        .register(target_id.clone(), ConnectionKind::Outgoing)
        .await
    {
        RegisterOutcome::Registered(rx) => rx,
        RegisterOutcome::RejectDuplicate => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: CLOSE_REASON_DUPLICATE.into(),
                })))
                .await;
            return Ok(SessionEnd::Duplicate);
        }
    };

    tracing::info!(peer = %target_id, endpoint = %target_endpoint, "peer connected (outgoing)");

    let last_pong = Arc::new(AtomicU64::new(unix_ms()));
    let end = tokio::select! {
        end = write_pump(&mut sink, rx, config, &last_pong) => end,
        () = read_pump(&mut stream, target_id, inbound, &last_pong) => SessionEnd::Disconnected,
    };

    match end {
        SessionEnd::Replaced => {
            tracing::debug!(peer = %target_id, "connection replaced by tie-break winner");
            Ok(SessionEnd::Replaced)
        }
        other => {
            manager.unregister(target_id).await;
            tracing::info!(peer = %target_id, "peer disconnected");
            Ok(other)
        }
    }
}

async fn read_handshake_ack<S>(stream: &mut S) -> Result<Handshake>
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| TransportError::Connection(e.to_string()))?;
        match frame {
            Message::Text(text) => {
                return match PeerMessage::from_json(text.as_str())? {
                    PeerMessage::HandshakeAck(ack) => Ok(ack),
                    other => Err(TransportError::Handshake(format!(
                        "expected handshake_ack, got {other:?}"
                    ))),
                };
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                return Err(TransportError::Handshake(format!(
                    "unexpected frame during handshake: {other:?}"
                )));
            }
        }
    }
    Err(TransportError::Handshake(
        "connection closed during handshake".to_string(),
    ))
}

/// Drain the peer queue into the socket, keeping the connection alive
/// with periodic pings. Two missed pongs end the session.
async fn write_pump<S>(
    sink: &mut S,
    mut rx: mpsc::Receiver<PeerMessage>,
    config: &TransportConfig,
    last_pong: &AtomicU64,
) -> SessionEnd
where
    S: Sink<Message> + Unpin,
{
    let mut ping_timer = tokio::time::interval(config.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_timer.tick().await; // immediate first tick

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(message) = frame else {
                    // Queue dropped: replaced or unregistered.
                    return SessionEnd::Replaced;
                };
                let Ok(json) = message.to_json() else {
                    continue;
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    return SessionEnd::Disconnected;
                }
            }
            _ = ping_timer.tick() => {
                let idle = unix_ms().saturating_sub(last_pong.load(Ordering::Relaxed));
                if idle > 2 * config.ping_interval.as_millis() as u64 {
                    tracing::debug!("peer missed pongs, closing");
                    return SessionEnd::Disconnected;
                }
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    return SessionEnd::Disconnected;
                }
            }
        }
    }
}

/// Forward inbound frames to the cluster router until the socket ends.
async fn read_pump<S>(
    stream: &mut S,
    peer_id: &ServerId,
    inbound: &mpsc::Sender<(ServerId, PeerMessage)>,
    last_pong: &AtomicU64,
) where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let Ok(frame) = frame else {
            return;
        };
        match frame {
            Message::Text(text) => match PeerMessage::from_json(text.as_str()) {
                Ok(message) => {
                    if inbound.send((peer_id.clone(), message)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::trace!(peer = %peer_id, error = %err, "ignoring bad peer frame");
                }
            },
            Message::Pong(_) => {
                last_pong.store(unix_ms(), Ordering::Relaxed);
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
