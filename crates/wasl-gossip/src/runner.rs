//! Async driver for the SWIM core.
//!
//! The runner owns the clock and the channels: it ticks the state
//! machine, signs every outbound envelope, verifies every inbound one
//! (silent drop + counter on failure), attaches piggy-backed membership
//! deltas, and publishes membership transitions as [`MembershipEvent`]s
//! for the ring and transport to react to.
//!
//! The membership lock is never held across a channel send.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};

use wasl_identity::Keypair;
use wasl_proto::{GossipEnvelope, GossipPayload, PeerMessage};
use wasl_types::{MembershipEntry, PeerStatus, ServerId};

use crate::membership::{DropReason, Membership, SwimOutput};
use crate::{GossipConfig, GossipError, Result};

/// Membership transitions other subsystems react to.
#[derive(Clone, Debug, PartialEq)]
pub enum MembershipEvent {
    /// A member joined or changed status; carries the full entry so the
    /// ring and transport can act without another lookup.
    Updated(MembershipEntry),
    /// A member left the table entirely.
    Removed(ServerId),
}

/// Drives a [`Membership`] on a fixed tick.
pub struct GossipRunner {
    membership: Arc<Mutex<Membership>>,
    keypair: Arc<Keypair>,
    config: GossipConfig,
    outbound: mpsc::Sender<(ServerId, PeerMessage)>,
    events: mpsc::Sender<MembershipEvent>,
}

impl GossipRunner {
    /// Create a runner around an existing membership table.
    pub fn new(
        membership: Arc<Mutex<Membership>>,
        keypair: Arc<Keypair>,
        config: GossipConfig,
        outbound: mpsc::Sender<(ServerId, PeerMessage)>,
        events: mpsc::Sender<MembershipEvent>,
    ) -> Self {
        Self {
            membership,
            keypair,
            config,
            outbound,
            events,
        }
    }

    /// Shared handle to the membership table.
    pub fn membership(&self) -> Arc<Mutex<Membership>> {
        Arc::clone(&self.membership)
    }

    /// Run the probe/exchange loop until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outputs = {
                        let mut membership = self.membership.lock().await;
                        membership.tick(now_ms())
                    };
                    if let Err(err) = self.dispatch(outputs).await {
                        tracing::warn!(error = %err, "gossip dispatch failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("gossip runner stopping");
                    return;
                }
            }
        }
    }

    /// Feed a seed entry (from the directory or a handshake) into the
    /// table.
    pub async fn add_seed(&self, entry: MembershipEntry) -> Result<()> {
        let outputs = {
            let mut membership = self.membership.lock().await;
            membership.apply_remote(entry, now_ms())
        };
        self.dispatch(outputs).await
    }

    /// Handle an inbound gossip envelope.
    ///
    /// Verifies the signature (bad envelopes are dropped silently with a
    /// counter), applies the piggy-backed membership delta, and consumes
    /// SWIM payloads. Payloads the failure detector does not own
    /// (rendezvous, pairing) are handed back to the caller.
    pub async fn handle_envelope(
        &self,
        envelope: GossipEnvelope,
    ) -> Result<Option<(ServerId, GossipPayload)>> {
        if envelope.verify().is_err() {
            let mut membership = self.membership.lock().await;
            membership.record_drop(DropReason::BadSignature);
            tracing::trace!(from = %envelope.from, "dropping gossip with bad signature");
            return Ok(None);
        }

        let now = now_ms();
        let from = envelope.from.clone();

        let (outputs, passthrough) = {
            let mut membership = self.membership.lock().await;
            let mut outputs = Vec::new();
            for entry in envelope.membership_delta {
                outputs.extend(membership.apply_remote(entry, now));
            }

            let passthrough = match envelope.payload {
                GossipPayload::Ping { seq } => {
                    outputs.extend(membership.on_ping(&from, seq, now));
                    None
                }
                GossipPayload::Ack { seq } => {
                    outputs.extend(membership.on_ack(&from, seq, now));
                    None
                }
                GossipPayload::IndirectPing { target, seq } => {
                    outputs.extend(membership.on_indirect_ping(&from, &target, seq, now));
                    None
                }
                GossipPayload::StateExchange { members } => {
                    outputs.extend(membership.on_state_exchange(members, now));
                    None
                }
                other => Some((from, other)),
            };
            (outputs, passthrough)
        };

        self.dispatch(outputs).await?;
        Ok(passthrough)
    }

    /// Build a signed envelope carrying `payload` plus any pending
    /// membership delta.
    pub async fn build_envelope(&self, payload: GossipPayload) -> Result<GossipEnvelope> {
        let delta = {
            let mut membership = self.membership.lock().await;
            membership.take_piggyback(self.config.max_piggyback)
        };
        Ok(GossipEnvelope::build(
            &self.keypair,
            payload,
            delta,
            now_ms(),
        )?)
    }

    /// Translate state-machine outputs into signed frames and events.
    async fn dispatch(&self, outputs: Vec<SwimOutput>) -> Result<()> {
        for output in outputs {
            match output {
                SwimOutput::SendPing { to, seq } => {
                    self.send_payload(to, GossipPayload::Ping { seq }).await?;
                }
                SwimOutput::SendAck { to, seq } => {
                    self.send_payload(to, GossipPayload::Ack { seq }).await?;
                }
                SwimOutput::SendIndirectPing { via, target, seq } => {
                    self.send_payload(via, GossipPayload::IndirectPing { target, seq })
                        .await?;
                }
                SwimOutput::SendStateExchange { to, members } => {
                    self.send_payload(to, GossipPayload::StateExchange { members })
                        .await?;
                }
                SwimOutput::StatusChanged {
                    server_id,
                    status,
                    incarnation,
                } => {
                    let entry = {
                        let membership = self.membership.lock().await;
                        membership.entry(&server_id).cloned()
                    };
                    // The entry is gone if `left` raced the event; synthesize
                    // enough for listeners either way.
                    if let Some(entry) = entry {
                        self.emit_sync(MembershipEvent::Updated(entry));
                    } else {
                        tracing::trace!(
                            server_id = %server_id,
                            ?status,
                            incarnation,
                            "status change for departed member"
                        );
                    }
                }
                SwimOutput::MemberRemoved { server_id } => {
                    self.emit_sync(MembershipEvent::Removed(server_id));
                }
            }
        }
        Ok(())
    }

    /// Queue one signed frame. Uses `try_send`: SWIM tolerates frame
    /// loss, and blocking here could deadlock the consumer of the
    /// outbound channel when it is the one feeding us inbound traffic.
    async fn send_payload(&self, to: ServerId, payload: GossipPayload) -> Result<()> {
        let envelope = self.build_envelope(payload).await?;
        match self.outbound.try_send((to, PeerMessage::Gossip(envelope))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("gossip outbound channel full, dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GossipError::TransportClosed),
        }
    }

    fn emit_sync(&self, event: MembershipEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "membership event channel full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("membership event listener gone");
            }
        }
    }
}

/// Current Unix time in milliseconds.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
