//! Pairing state machine.
//!
//! Pairing is the explicit, user-visible act that establishes trust
//! between two devices. Each peer moves through the states in
//! [`PairingState`]; the only transition that pins a fingerprint is an
//! explicit local acceptance (or the peer accepting a request we sent).
//! Trust is never elevated as a side effect of traffic.
//!
//! All state mutations for a peer are serialized through a single mutex,
//! so concurrent pair packets and user decisions cannot interleave into an
//! inconsistent state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use protocol::{DeviceId, Fingerprint, PairBody};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::trust::{PairingState, TrustStore};

/// Capacity of the pairing event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Pairing operation errors.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("peer {0} is already paired")]
    AlreadyPaired(DeviceId),

    #[error("a pairing request for peer {0} is already pending")]
    RequestAlreadyPending(DeviceId),

    #[error("no pending pairing request for peer {0}")]
    NoPendingRequest(DeviceId),

    #[error("connection fingerprint for peer {device_id} does not match its pin")]
    FingerprintMismatch {
        device_id: DeviceId,
        pinned: Fingerprint,
        presented: Fingerprint,
    },

    #[error("trust store operation failed: {0}")]
    Store(String),
}

/// What an incoming pair packet amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairDisposition {
    /// A request is now pending local user decision; no automatic reply.
    RequestPending,
    /// The peer accepted our outgoing request; it is now pinned.
    Accepted,
    /// The peer rejected our outgoing request.
    RejectedByPeer,
    /// The peer unpaired from us; its pin was removed.
    Unpaired,
    /// The peer cancelled its own pending request.
    Cancelled,
}

/// Pairing lifecycle notifications.
#[derive(Debug, Clone)]
pub enum PairingEvent {
    /// A peer requested pairing (or re-pairing); awaiting local decision.
    Requested {
        device_id: DeviceId,
        name: String,
        fingerprint: Fingerprint,
    },
    /// Pairing completed; the peer's fingerprint is pinned.
    Paired(DeviceId),
    /// An outgoing request was rejected by the peer.
    Rejected(DeviceId),
    /// The pairing relationship was dissolved.
    Unpaired(DeviceId),
    /// A pending request aged out without a decision.
    RequestExpired(DeviceId),
}

/// Per-peer transient pairing bookkeeping.
#[derive(Debug, Clone)]
struct PeerPairing {
    state: PairingState,
    /// When the current pending request was created.
    requested_at: Option<Instant>,
    /// Fingerprint presented with an incoming request, pinned only on
    /// acceptance.
    pending_fingerprint: Option<Fingerprint>,
    /// Name announced with an incoming request.
    pending_name: Option<String>,
}

impl PeerPairing {
    fn unpaired() -> Self {
        Self {
            state: PairingState::Unpaired,
            requested_at: None,
            pending_fingerprint: None,
            pending_name: None,
        }
    }
}

/// The pairing state machine over all peers.
pub struct PairingManager {
    trust: Arc<TrustStore>,
    /// Single writer for all pairing transitions.
    peers: Mutex<HashMap<DeviceId, PeerPairing>>,
    events: broadcast::Sender<PairingEvent>,
}

impl PairingManager {
    /// Creates a pairing manager over the given trust store.
    ///
    /// Peers already pinned in the store start in the `Paired` state.
    pub fn new(trust: Arc<TrustStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            trust,
            peers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to pairing lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    /// Returns the current pairing state for a peer.
    pub fn state(&self, device_id: &DeviceId) -> PairingState {
        let peers = self.lock();
        if let Some(peer) = peers.get(device_id) {
            return peer.state;
        }
        drop(peers);
        if self.trust.is_paired(device_id).unwrap_or(false) {
            PairingState::Paired
        } else {
            PairingState::Unpaired
        }
    }

    /// Returns whether the peer is currently paired.
    pub fn is_paired(&self, device_id: &DeviceId) -> bool {
        self.state(device_id) == PairingState::Paired
    }

    /// Initiates an outgoing pairing request.
    ///
    /// Valid from `Unpaired` or `Rejected`. Returns the pair packet body
    /// to send to the peer.
    pub fn request_pairing(&self, device_id: DeviceId) -> Result<PairBody, PairingError> {
        let mut peers = self.lock();
        let current = self.effective_state(&peers, &device_id);

        match current {
            PairingState::Paired => return Err(PairingError::AlreadyPaired(device_id)),
            PairingState::RequestSentLocal | PairingState::RequestReceivedRemote => {
                return Err(PairingError::RequestAlreadyPending(device_id));
            }
            PairingState::Unpaired | PairingState::Rejected => {}
        }

        let entry = peers.entry(device_id).or_insert_with(PeerPairing::unpaired);
        entry.state = PairingState::RequestSentLocal;
        entry.requested_at = Some(Instant::now());
        entry.pending_fingerprint = None;
        entry.pending_name = None;

        tracing::info!("Sent pairing request to {}", device_id);
        Ok(PairBody { pair: true })
    }

    /// Processes an incoming pair packet from an authenticated connection.
    ///
    /// `name` and `fingerprint` describe the connection the packet arrived
    /// on; the fingerprint is pinned only if this packet completes a
    /// pairing we initiated. A connection whose fingerprint contradicts an
    /// existing pin can neither dissolve the pairing nor complete an
    /// acceptance; such packets fail with
    /// [`PairingError::FingerprintMismatch`]. It may still surface a
    /// re-pair request, which pins nothing by itself.
    pub fn handle_pair_packet(
        &self,
        device_id: DeviceId,
        name: &str,
        fingerprint: Fingerprint,
        body: PairBody,
    ) -> Result<PairDisposition, PairingError> {
        let mut peers = self.lock();
        let current = self.effective_state(&peers, &device_id);

        let pinned = self
            .trust
            .pinned_fingerprint(&device_id)
            .map_err(|e| PairingError::Store(e.to_string()))?;
        if let Some(pin) = pinned {
            let trust_affecting = !body.pair || current == PairingState::RequestSentLocal;
            if pin != fingerprint && trust_affecting {
                tracing::warn!(
                    "Rejecting pair packet from {}: connection fingerprint does not match pin",
                    device_id
                );
                return Err(PairingError::FingerprintMismatch {
                    device_id,
                    pinned: pin,
                    presented: fingerprint,
                });
            }
        }

        if body.pair {
            match current {
                // The peer answered the request we sent: mutual accept.
                PairingState::RequestSentLocal => {
                    self.trust
                        .pin(device_id, name.to_string(), fingerprint)
                        .map_err(|e| PairingError::Store(e.to_string()))?;
                    peers.insert(
                        device_id,
                        PeerPairing {
                            state: PairingState::Paired,
                            requested_at: None,
                            pending_fingerprint: None,
                            pending_name: None,
                        },
                    );
                    tracing::info!("Peer {} accepted pairing", device_id);
                    let _ = self.events.send(PairingEvent::Paired(device_id));
                    Ok(PairDisposition::Accepted)
                }
                // A duplicate request replaces the previous pending one.
                PairingState::RequestReceivedRemote
                | PairingState::Unpaired
                | PairingState::Rejected => {
                    self.surface_request(&mut peers, device_id, name, fingerprint);
                    Ok(PairDisposition::RequestPending)
                }
                // Re-pairing while paired needs an explicit re-acceptance.
                // The old pin stays in force until the user decides.
                PairingState::Paired => {
                    tracing::warn!(
                        "Paired peer {} requested re-pairing; awaiting explicit re-acceptance",
                        device_id
                    );
                    self.surface_request(&mut peers, device_id, name, fingerprint);
                    Ok(PairDisposition::RequestPending)
                }
            }
        } else {
            match current {
                PairingState::Paired => {
                    self.trust
                        .unpin(&device_id)
                        .map_err(|e| PairingError::Store(e.to_string()))?;
                    peers.insert(device_id, PeerPairing::unpaired());
                    tracing::info!("Peer {} unpaired", device_id);
                    let _ = self.events.send(PairingEvent::Unpaired(device_id));
                    Ok(PairDisposition::Unpaired)
                }
                PairingState::RequestSentLocal => {
                    if let Some(entry) = peers.get_mut(&device_id) {
                        entry.state = PairingState::Rejected;
                        entry.requested_at = None;
                    }
                    tracing::info!("Peer {} rejected our pairing request", device_id);
                    let _ = self.events.send(PairingEvent::Rejected(device_id));
                    Ok(PairDisposition::RejectedByPeer)
                }
                PairingState::RequestReceivedRemote => {
                    peers.insert(device_id, PeerPairing::unpaired());
                    tracing::debug!("Peer {} cancelled its pairing request", device_id);
                    Ok(PairDisposition::Cancelled)
                }
                PairingState::Unpaired | PairingState::Rejected => {
                    // Nothing to dissolve; treat as a no-op cancel.
                    Ok(PairDisposition::Cancelled)
                }
            }
        }
    }

    /// Accepts the pending request from a peer, pinning its fingerprint.
    ///
    /// Returns the pair packet body to send back.
    pub fn accept_pending(&self, device_id: DeviceId) -> Result<PairBody, PairingError> {
        let mut peers = self.lock();
        let entry = peers
            .get(&device_id)
            .filter(|p| p.state == PairingState::RequestReceivedRemote)
            .cloned()
            .ok_or(PairingError::NoPendingRequest(device_id))?;

        let fingerprint = entry
            .pending_fingerprint
            .ok_or(PairingError::NoPendingRequest(device_id))?;
        let name = entry.pending_name.unwrap_or_else(|| device_id.to_string());

        self.trust
            .pin(device_id, name, fingerprint)
            .map_err(|e| PairingError::Store(e.to_string()))?;
        peers.insert(
            device_id,
            PeerPairing {
                state: PairingState::Paired,
                requested_at: None,
                pending_fingerprint: None,
                pending_name: None,
            },
        );

        tracing::info!("Accepted pairing request from {}", device_id);
        let _ = self.events.send(PairingEvent::Paired(device_id));
        Ok(PairBody { pair: true })
    }

    /// Rejects the pending request from a peer.
    ///
    /// If the request was a re-pair from an already pinned peer, the old
    /// pin is removed as well: the peer evidently rotated its key, so the
    /// stale pin can never verify again.
    ///
    /// Returns the pair packet body to send back.
    pub fn reject_pending(&self, device_id: DeviceId) -> Result<PairBody, PairingError> {
        let mut peers = self.lock();
        let pending = peers
            .get(&device_id)
            .map(|p| p.state == PairingState::RequestReceivedRemote)
            .unwrap_or(false);
        if !pending {
            return Err(PairingError::NoPendingRequest(device_id));
        }

        let was_pinned = self
            .trust
            .is_paired(&device_id)
            .map_err(|e| PairingError::Store(e.to_string()))?;
        if was_pinned {
            self.trust
                .unpin(&device_id)
                .map_err(|e| PairingError::Store(e.to_string()))?;
            let _ = self.events.send(PairingEvent::Unpaired(device_id));
        }

        peers.insert(device_id, PeerPairing::unpaired());
        tracing::info!("Rejected pairing request from {}", device_id);
        Ok(PairBody { pair: false })
    }

    /// Dissolves the pairing with a peer, removing its pin.
    ///
    /// Returns the pair packet body to send, or `None` if the peer was not
    /// paired.
    pub fn unpair(&self, device_id: DeviceId) -> Result<Option<PairBody>, PairingError> {
        let mut peers = self.lock();
        let current = self.effective_state(&peers, &device_id);
        if current != PairingState::Paired {
            return Ok(None);
        }

        self.trust
            .unpin(&device_id)
            .map_err(|e| PairingError::Store(e.to_string()))?;
        peers.insert(device_id, PeerPairing::unpaired());

        tracing::info!("Unpaired from {}", device_id);
        let _ = self.events.send(PairingEvent::Unpaired(device_id));
        Ok(Some(PairBody { pair: false }))
    }

    /// Lists peers with a request awaiting local decision.
    pub fn pending_requests(&self) -> Vec<(DeviceId, Option<String>, Option<Fingerprint>)> {
        let peers = self.lock();
        peers
            .iter()
            .filter(|(_, p)| p.state == PairingState::RequestReceivedRemote)
            .map(|(id, p)| (*id, p.pending_name.clone(), p.pending_fingerprint))
            .collect()
    }

    /// Expires pending requests older than `timeout`, in either direction.
    ///
    /// Expired peers fall back to `Unpaired` (a paired peer whose re-pair
    /// request expires stays paired under its existing pin).
    pub fn expire_pending(&self, timeout: Duration) -> Vec<DeviceId> {
        let mut peers = self.lock();
        let now = Instant::now();
        let mut expired = Vec::new();

        for (device_id, entry) in peers.iter_mut() {
            let pending = matches!(
                entry.state,
                PairingState::RequestSentLocal | PairingState::RequestReceivedRemote
            );
            let aged = entry
                .requested_at
                .map(|t| now.duration_since(t) >= timeout)
                .unwrap_or(false);
            if pending && aged {
                let fallback = if self.trust.is_paired(device_id).unwrap_or(false) {
                    PairingState::Paired
                } else {
                    PairingState::Unpaired
                };
                *entry = PeerPairing {
                    state: fallback,
                    ..PeerPairing::unpaired()
                };
                expired.push(*device_id);
            }
        }

        for device_id in &expired {
            tracing::info!("Pairing request involving {} expired", device_id);
            let _ = self.events.send(PairingEvent::RequestExpired(*device_id));
        }
        expired
    }

    fn surface_request(
        &self,
        peers: &mut HashMap<DeviceId, PeerPairing>,
        device_id: DeviceId,
        name: &str,
        fingerprint: Fingerprint,
    ) {
        peers.insert(
            device_id,
            PeerPairing {
                state: PairingState::RequestReceivedRemote,
                requested_at: Some(Instant::now()),
                pending_fingerprint: Some(fingerprint),
                pending_name: Some(name.to_string()),
            },
        );
        tracing::info!("Pairing request from {} ({}) pending decision", device_id, name);
        let _ = self.events.send(PairingEvent::Requested {
            device_id,
            name: name.to_string(),
            fingerprint,
        });
    }

    /// Resolves a peer's state, consulting the trust store for peers with
    /// no in-memory entry. Must be called with the lock held.
    fn effective_state(
        &self,
        peers: &HashMap<DeviceId, PeerPairing>,
        device_id: &DeviceId,
    ) -> PairingState {
        if let Some(peer) = peers.get(device_id) {
            peer.state
        } else if self.trust.is_paired(device_id).unwrap_or(false) {
            PairingState::Paired
        } else {
            PairingState::Unpaired
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceId, PeerPairing>> {
        // A poisoned pairing mutex means a panic mid-transition; the map
        // contents are still per-key consistent, so recover the guard.
        match self.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
