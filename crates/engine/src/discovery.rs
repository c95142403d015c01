//! Device discovery over UDP broadcast.
//!
//! Each device periodically broadcasts a plaintext identity packet to a
//! well-known UDP port and listens for the same from others. Received
//! announcements are upserted into a live device registry; a sweep task
//! expires devices that stop announcing. Consumers observe the registry
//! through [`DiscoveryEvent`]s on a broadcast channel.
//!
//! Discovery is informational only. Nothing a device announces here is
//! trusted; trust is established by the pairing exchange on the encrypted
//! control channel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use protocol::{DeviceClass, DeviceId, IdentityBody, PacketCodec};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::registry::IdentityAnnouncer;

/// Capacity of the discovery event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Maximum size of a discovery datagram we will parse.
const MAX_DATAGRAM_SIZE: usize = 8192;

/// A remote device as currently known from its identity announcements.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// The peer's stable device id.
    pub device_id: DeviceId,
    /// Display name the peer announced.
    pub name: String,
    /// Device class the peer announced.
    pub class: DeviceClass,
    /// Protocol version the peer speaks.
    pub protocol_version: u8,
    /// Packet types the peer can receive.
    pub incoming_capabilities: Vec<String>,
    /// Packet types the peer can send.
    pub outgoing_capabilities: Vec<String>,
    /// Address of the peer's control channel listener.
    pub address: SocketAddr,
    /// When the last announcement from this peer arrived.
    pub last_seen: Instant,
}

impl DeviceInfo {
    /// Returns whether two snapshots announce the same visible state.
    ///
    /// `last_seen` is bookkeeping, not announced state.
    fn same_announcement(&self, other: &DeviceInfo) -> bool {
        self.name == other.name
            && self.class == other.class
            && self.protocol_version == other.protocol_version
            && self.incoming_capabilities == other.incoming_capabilities
            && self.outgoing_capabilities == other.outgoing_capabilities
            && self.address == other.address
    }
}

/// Registry change notifications.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A device announced itself for the first time.
    Found(DeviceInfo),
    /// A known device announced changed state (name, capabilities, or
    /// address).
    Updated(DeviceInfo),
    /// A device stopped announcing and was expired from the registry.
    Lost(DeviceId),
}

/// UDP broadcast discovery service.
///
/// Owns the live device registry. Cheap to clone handles out of via
/// [`DiscoveryService::devices`] snapshots; the registry itself is shared
/// with the background tasks.
pub struct DiscoveryService {
    /// Our own device id, used to filter our broadcasts out of the
    /// registry.
    local_id: DeviceId,
    /// Source of the identity we announce. The body is rebuilt per
    /// announcement so capability changes are picked up by the next
    /// broadcast.
    announce: Arc<IdentityAnnouncer>,
    discovery_port: u16,
    broadcast_interval: Duration,
    liveness_timeout: Duration,
    devices: Arc<DashMap<DeviceId, DeviceInfo>>,
    events: broadcast::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
}

impl DiscoveryService {
    /// Creates a discovery service. No sockets are opened until
    /// [`DiscoveryService::start`].
    pub fn new(
        local_id: DeviceId,
        announce: Arc<IdentityAnnouncer>,
        discovery_port: u16,
        broadcast_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local_id,
            announce,
            discovery_port,
            broadcast_interval,
            liveness_timeout,
            devices: Arc::new(DashMap::new()),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribes to registry change events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Returns a snapshot of all currently known devices.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    /// Returns the current snapshot of one device, if known.
    pub fn get(&self, device_id: &DeviceId) -> Option<DeviceInfo> {
        self.devices.get(device_id).map(|e| e.value().clone())
    }

    /// Binds the discovery socket and spawns the broadcast, receive, and
    /// sweep tasks. Returns the bound socket address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(("0.0.0.0", self.discovery_port))
            .await
            .with_context(|| {
                format!("Failed to bind discovery socket on port {}", self.discovery_port)
            })?;
        socket
            .set_broadcast(true)
            .context("Failed to enable broadcast on discovery socket")?;
        let local_addr = socket
            .local_addr()
            .context("Failed to read discovery socket address")?;
        let socket = Arc::new(socket);

        tracing::info!(
            "Discovery started on UDP port {} (interval {:?}, timeout {:?})",
            self.discovery_port,
            self.broadcast_interval,
            self.liveness_timeout
        );

        self.spawn_broadcast_task(socket.clone());
        self.spawn_recv_task(socket);
        self.spawn_sweep_task();
        Ok(local_addr)
    }

    /// Stops all discovery tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_broadcast_task(&self, socket: Arc<UdpSocket>) {
        let announce = self.announce.clone();
        let dest = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::BROADCAST),
            self.discovery_port,
        );
        let interval = self.broadcast_interval;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let codec = PacketCodec::new();
            loop {
                // A fresh body and packet per announcement, so capability
                // changes are carried by the next broadcast.
                match announce.body().to_packet().and_then(|p| codec.encode(&p)) {
                    Ok(frame) => {
                        if let Err(e) = socket.send_to(&frame, dest).await {
                            tracing::debug!("Discovery broadcast failed: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to encode identity announcement: {}", e);
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {
                        tracing::debug!("Discovery broadcast task stopped");
                        return;
                    }
                }
            }
        });
    }

    fn spawn_recv_task(&self, socket: Arc<UdpSocket>) {
        let local_id = self.local_id;
        let devices = self.devices.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let codec = PacketCodec::new();
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (len, from) = tokio::select! {
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("Discovery receive failed: {}", e);
                            continue;
                        }
                    },
                    _ = cancel.cancelled() => {
                        tracing::debug!("Discovery receive task stopped");
                        return;
                    }
                };

                let packet = match codec.decode(&buf[..len]) {
                    Ok(p) if p.is_identity() => p,
                    Ok(p) => {
                        tracing::trace!(
                            "Ignoring non-identity discovery packet of type {}",
                            p.packet_type
                        );
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!("Dropping malformed discovery datagram from {}: {}", from, e);
                        continue;
                    }
                };

                let body = match IdentityBody::from_packet(&packet) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::debug!("Dropping invalid identity body from {}: {}", from, e);
                        continue;
                    }
                };

                upsert_identity(&devices, &events, local_id, body, from.ip());
            }
        });
    }

    fn spawn_sweep_task(&self) {
        let devices = self.devices.clone();
        let events = self.events.clone();
        let timeout = self.liveness_timeout;
        let interval = self.broadcast_interval;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {
                        tracing::debug!("Discovery sweep task stopped");
                        return;
                    }
                }
                sweep_expired(&devices, &events, timeout);
            }
        });
    }

    /// Ingests an identity body received outside the UDP path, e.g. as the
    /// first packet on an incoming control connection.
    pub fn observe_identity(&self, body: IdentityBody, source_ip: IpAddr) {
        upsert_identity(&self.devices, &self.events, self.local_id, body, source_ip);
    }

    /// Expires devices not seen within the liveness timeout. Exposed for
    /// deterministic sweeping in tests; the sweep task calls this on a
    /// timer.
    pub fn sweep(&self) -> Vec<DeviceId> {
        sweep_expired(&self.devices, &self.events, self.liveness_timeout)
    }
}

/// Idempotent registry upsert from a received identity body.
///
/// Emits `Found` for a new device and `Updated` when the announced state
/// changed. A pure refresh only bumps `last_seen`.
fn upsert_identity(
    devices: &DashMap<DeviceId, DeviceInfo>,
    events: &broadcast::Sender<DiscoveryEvent>,
    local_id: DeviceId,
    body: IdentityBody,
    source_ip: IpAddr,
) {
    let device_id = match DeviceId::parse(&body.device_id) {
        Ok(id) => id,
        Err(e) => {
            tracing::debug!("Ignoring identity with invalid device id: {}", e);
            return;
        }
    };

    // Our own broadcasts come back to us on the shared port.
    if device_id == local_id {
        return;
    }

    let info = DeviceInfo {
        device_id,
        name: body.device_name,
        class: body.device_class,
        protocol_version: body.protocol_version,
        incoming_capabilities: body.incoming_capabilities,
        outgoing_capabilities: body.outgoing_capabilities,
        address: SocketAddr::new(source_ip, body.tcp_port),
        last_seen: Instant::now(),
    };

    let event = match devices.insert(device_id, info.clone()) {
        None => {
            tracing::info!("Discovered device {} ({})", device_id, info.name);
            Some(DiscoveryEvent::Found(info))
        }
        Some(previous) if !previous.same_announcement(&info) => {
            tracing::debug!("Device {} updated its announcement", device_id);
            Some(DiscoveryEvent::Updated(info))
        }
        Some(_) => None,
    };

    if let Some(event) = event {
        let _ = events.send(event);
    }
}

/// Removes devices whose last announcement is older than `timeout`.
fn sweep_expired(
    devices: &DashMap<DeviceId, DeviceInfo>,
    events: &broadcast::Sender<DiscoveryEvent>,
    timeout: Duration,
) -> Vec<DeviceId> {
    let now = Instant::now();
    let expired: Vec<DeviceId> = devices
        .iter()
        .filter(|e| now.duration_since(e.value().last_seen) >= timeout)
        .map(|e| *e.key())
        .collect();

    for device_id in &expired {
        devices.remove(device_id);
        tracing::info!("Device {} lost (no announcement within {:?})", device_id, timeout);
        let _ = events.send(DiscoveryEvent::Lost(*device_id));
    }

    expired
}
