//! Capability registry and packet dispatch.
//!
//! Every packet type beyond the structural identity and pairing types is
//! owned by a capability: a [`PacketHandler`] registered under that type.
//! The registry also tracks, per peer, the negotiated capability set
//! derived from the peer's identity announcements.
//!
//! Dispatch rules, in order:
//! 1. Packets from non-paired peers are dropped and reported; only
//!    identity and pairing packets may flow before pairing, and those
//!    never reach this dispatcher.
//! 2. Packets whose type has no enabled handler are dropped silently.
//! 3. Packets whose type is outside the peer's negotiated capability set
//!    are dropped silently.
//! 4. Everything else goes to the handler, which may produce a reply.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use protocol::{
    DeviceClass, DeviceId, IdentityBody, Packet, PACKET_TYPE_PING, PROTOCOL_VERSION,
};

/// A capability handler for one packet type.
///
/// Handlers must be thread-safe; dispatch may run on any peer's task.
pub trait PacketHandler: Send + Sync {
    /// Handles one packet from a paired peer, optionally producing a
    /// reply to send back on the same connection.
    fn handle(&self, peer: DeviceId, packet: &Packet) -> Option<Packet>;
}

/// Result of offering a packet to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The packet reached its handler; the handler may have replied.
    Delivered(Option<Packet>),
    /// Dropped: the sending peer is not paired. Callers must report this
    /// as a security event.
    DroppedNotPaired,
    /// Dropped silently: no handler is registered for the type.
    DroppedUnknownType,
    /// Dropped silently: the handler for the type is disabled.
    DroppedDisabled,
    /// Dropped silently: the type is not in the capability set negotiated
    /// with the sending peer.
    DroppedNotNegotiated,
}

/// Capabilities negotiated with one peer.
///
/// Recomputed from scratch on every identity refresh; never mutated
/// incrementally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    /// Types we can send that the peer can receive.
    pub sendable: Vec<String>,
    /// Types the peer may send that we can handle.
    pub receivable: Vec<String>,
}

struct RegisteredHandler {
    handler: Arc<dyn PacketHandler>,
    enabled: bool,
}

/// Registry of capability handlers and per-peer negotiated sets.
pub struct CapabilityRegistry {
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
    peers: DashMap<DeviceId, CapabilitySet>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            peers: DashMap::new(),
        }
    }

    /// Registers a handler for a packet type, enabled.
    ///
    /// Replaces any existing handler for the same type.
    pub fn register(&self, packet_type: impl Into<String>, handler: Arc<dyn PacketHandler>) {
        let packet_type = packet_type.into();
        tracing::debug!("Registering capability handler for {}", packet_type);
        self.write().insert(
            packet_type,
            RegisteredHandler {
                handler,
                enabled: true,
            },
        );
    }

    /// Removes the handler for a packet type.
    pub fn unregister(&self, packet_type: &str) -> bool {
        self.write().remove(packet_type).is_some()
    }

    /// Enables or disables the handler for a packet type.
    ///
    /// A disabled handler stays registered but receives nothing, and its
    /// type is not advertised in identity packets. Returns false if no
    /// handler is registered for the type.
    pub fn set_enabled(&self, packet_type: &str, enabled: bool) -> bool {
        let mut handlers = self.write();
        match handlers.get_mut(packet_type) {
            Some(entry) => {
                entry.enabled = enabled;
                tracing::debug!(
                    "Capability {} {}",
                    packet_type,
                    if enabled { "enabled" } else { "disabled" }
                );
                true
            }
            None => false,
        }
    }

    /// Returns the packet types with an enabled handler, sorted.
    ///
    /// This is what identity packets advertise as incoming capabilities.
    pub fn enabled_types(&self) -> Vec<String> {
        let handlers = self.read();
        let mut types: Vec<String> = handlers
            .iter()
            .filter(|(_, h)| h.enabled)
            .map(|(t, _)| t.clone())
            .collect();
        types.sort();
        types
    }

    /// Recomputes the negotiated capability set for a peer from a fresh
    /// identity body.
    pub fn negotiate(&self, device_id: DeviceId, identity: &IdentityBody) -> CapabilitySet {
        let local = self.enabled_types();
        let mut sendable: Vec<String> = identity
            .incoming_capabilities
            .iter()
            .filter(|t| local.contains(t))
            .cloned()
            .collect();
        let mut receivable: Vec<String> = identity
            .outgoing_capabilities
            .iter()
            .filter(|t| local.contains(t))
            .cloned()
            .collect();
        sendable.sort();
        receivable.sort();

        let set = CapabilitySet {
            sendable,
            receivable,
        };
        self.peers.insert(device_id, set.clone());
        set
    }

    /// Returns the last negotiated capability set for a peer.
    pub fn peer_capabilities(&self, device_id: &DeviceId) -> Option<CapabilitySet> {
        self.peers.get(device_id).map(|e| e.value().clone())
    }

    /// Drops the negotiated set for a peer that disappeared.
    pub fn forget_peer(&self, device_id: &DeviceId) {
        self.peers.remove(device_id);
    }

    /// Offers a packet to the dispatcher.
    ///
    /// `paired` reflects the sending connection's pairing status as
    /// verified by the caller against the trust store.
    pub fn dispatch(&self, peer: DeviceId, paired: bool, packet: &Packet) -> DispatchOutcome {
        if !paired {
            tracing::warn!(
                "Dropping {} packet from non-paired peer {}",
                packet.packet_type,
                peer
            );
            return DispatchOutcome::DroppedNotPaired;
        }

        let (handler, enabled) = {
            let handlers = self.read();
            match handlers.get(&packet.packet_type) {
                Some(entry) => (entry.handler.clone(), entry.enabled),
                None => {
                    tracing::trace!(
                        "No handler for packet type {} from {}",
                        packet.packet_type,
                        peer
                    );
                    return DispatchOutcome::DroppedUnknownType;
                }
            }
        };

        if !enabled {
            tracing::trace!(
                "Handler for {} is disabled; dropping packet from {}",
                packet.packet_type,
                peer
            );
            return DispatchOutcome::DroppedDisabled;
        }

        let negotiated = self
            .peers
            .get(&peer)
            .map(|e| e.value().receivable.contains(&packet.packet_type))
            .unwrap_or(false);
        if !negotiated {
            tracing::trace!(
                "Type {} is not in the negotiated set for {}; dropping",
                packet.packet_type,
                peer
            );
            return DispatchOutcome::DroppedNotNegotiated;
        }

        DispatchOutcome::Delivered(handler.handle(peer, packet))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RegisteredHandler>> {
        match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RegisteredHandler>> {
        match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Builds the identity body announced over discovery and exchanged in
/// link handshakes.
///
/// Capabilities are read from the registry at call time, so a handler
/// registered, unregistered, or toggled after startup is reflected in the
/// next announcement and the next handshake.
pub struct IdentityAnnouncer {
    device_id: DeviceId,
    device_name: String,
    device_class: DeviceClass,
    tcp_port: u16,
    registry: Arc<CapabilityRegistry>,
}

impl IdentityAnnouncer {
    /// Creates an announcer over the given registry. `tcp_port` must be
    /// the bound control listener port.
    pub fn new(
        device_id: DeviceId,
        device_name: String,
        device_class: DeviceClass,
        tcp_port: u16,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            device_id,
            device_name,
            device_class,
            tcp_port,
            registry,
        }
    }

    /// The announced control listener port.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Builds the identity body with the registry's current enabled types.
    pub fn body(&self) -> IdentityBody {
        let capabilities = self.registry.enabled_types();
        IdentityBody {
            device_id: self.device_id.to_string(),
            device_name: self.device_name.clone(),
            device_class: self.device_class,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: capabilities.clone(),
            outgoing_capabilities: capabilities,
            tcp_port: self.tcp_port,
        }
    }
}

/// The built-in ping capability: replies to every ping with a ping.
///
/// Serves as control-plane liveness and as the reference handler
/// implementation.
pub struct PingHandler;

impl PacketHandler for PingHandler {
    fn handle(&self, peer: DeviceId, packet: &Packet) -> Option<Packet> {
        // Pings carrying a reply marker are answers to our own ping and
        // terminate the exchange.
        if packet.body_bool("isReply").unwrap_or(false) {
            tracing::debug!("Ping reply from {}", peer);
            return None;
        }

        tracing::debug!("Ping from {}", peer);
        let mut body = serde_json::Map::new();
        body.insert("isReply".to_string(), serde_json::Value::Bool(true));
        Some(Packet::new(PACKET_TYPE_PING, body))
    }
}
