//! Engine orchestrator for wiring together all components.
//!
//! This module provides the `Engine` that initializes and coordinates all
//! subsystems: identity and trust storage, UDP discovery, the control
//! channel listener, pairing, capability dispatch, and payload transfers.
//!
//! Packet flow for an established link: identity packets refresh the
//! discovery registry and capability sets. Pair packets drive the pairing
//! state machine, which refuses trust-affecting transitions from a
//! connection whose fingerprint contradicts the pin; such a refusal closes
//! the link and raises a security event. Everything else first has the
//! connection's fingerprint checked against the trust store pin. A pin
//! mismatch closes the link and raises a security event; traffic from an
//! unpaired peer is dropped and reported without closing the link.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{
    DeviceId, DeviceIdentity, Fingerprint, IdentityBody, Packet, PairBody, PACKET_TYPE_PING,
};
use serde_json::Map;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{DeviceInfo, DiscoveryEvent, DiscoveryService};
use crate::link::{LinkConnection, LinkSender};
use crate::pairing::{PairingError, PairingEvent, PairingManager};
use crate::registry::{CapabilityRegistry, DispatchOutcome, IdentityAnnouncer, PingHandler};
use crate::transfer::{PayloadTransferManager, TransferEvent, TransferHandle};
use crate::trust::{load_or_create_identity, TrustStore};

/// Capacity of the unified engine event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Security-relevant incidents surfaced to the application.
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    /// A pinned peer presented a different static key. The connection was
    /// closed; the pin was left untouched.
    FingerprintMismatch {
        device_id: DeviceId,
        pinned: Fingerprint,
        presented: Fingerprint,
    },
    /// A peer sent ordinary traffic without being paired. The packet was
    /// dropped; the connection stays up for pairing.
    UnpairedTraffic {
        device_id: DeviceId,
        packet_type: String,
    },
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Engine state changed.
    StateChanged(EngineState),
    /// Discovery registry changed.
    Discovery(DiscoveryEvent),
    /// Pairing state machine progressed.
    Pairing(PairingEvent),
    /// A payload transfer progressed or finished.
    Transfer(TransferEvent),
    /// A control link to a peer came up.
    PeerConnected { device_id: DeviceId },
    /// A control link to a peer went down.
    PeerDisconnected { device_id: DeviceId },
    /// A security incident occurred.
    Security(SecurityEvent),
}

/// Bookkeeping for one active control link.
struct LinkEntry {
    sender: LinkSender,
    fingerprint: Fingerprint,
}

/// Shared state handed to the per-peer dispatch tasks.
struct EngineCore {
    identity: DeviceIdentity,
    announce: Arc<IdentityAnnouncer>,
    trust: Arc<TrustStore>,
    pairing: Arc<PairingManager>,
    registry: Arc<CapabilityRegistry>,
    transfers: Arc<PayloadTransferManager>,
    discovery: Arc<DiscoveryService>,
    links: RwLock<HashMap<DeviceId, LinkEntry>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

/// The engine that manages all subsystems.
pub struct Engine {
    config: Config,
    identity: DeviceIdentity,
    state: Arc<RwLock<EngineState>>,
    trust: Arc<TrustStore>,
    pairing: Arc<PairingManager>,
    registry: Arc<CapabilityRegistry>,
    transfers: Arc<PayloadTransferManager>,
    /// Populated by `start`.
    core: Option<Arc<EngineCore>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl Engine {
    /// Creates a new engine from configuration.
    ///
    /// Loads or generates the device identity and loads the trust store.
    /// No sockets are opened until [`Engine::start`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        std::fs::create_dir_all(&config.device.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                config.device.data_dir.display()
            )
        })?;

        let identity = load_or_create_identity(&config.device.data_dir)?;
        info!(
            "Device identity: {} ({})",
            identity.device_id(),
            identity.fingerprint().to_display_string()
        );

        let trust = Arc::new(TrustStore::in_data_dir(&config.device.data_dir));
        trust.load().context("Failed to load trust store")?;

        let pairing = Arc::new(PairingManager::new(Arc::clone(&trust)));

        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(PACKET_TYPE_PING, Arc::new(PingHandler));

        let transfers = Arc::new(PayloadTransferManager::new(Duration::from_millis(
            config.transfer.progress_interval_ms,
        )));

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            identity,
            state: Arc::new(RwLock::new(EngineState::Stopped)),
            trust,
            pairing,
            registry,
            transfers,
            core: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the local device id.
    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id()
    }

    /// Returns the local static key fingerprint, the value a peer pins
    /// when it pairs with us.
    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    /// Returns the current state.
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Returns a receiver for engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the engine: binds the control listener, starts discovery,
    /// and spawns the background tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Stopped {
                anyhow::bail!("Engine is already running");
            }
            *state = EngineState::Starting;
        }
        self.emit(EngineEvent::StateChanged(EngineState::Starting));

        info!("Starting engine...");

        // Bind the control listener first so the announced tcp port is
        // the real one even when the configured port is 0.
        let listener = TcpListener::bind(("0.0.0.0", self.config.network.control_port))
            .await
            .context("Failed to bind control listener")?;
        let control_port = listener
            .local_addr()
            .context("Failed to read control listener address")?
            .port();
        info!("Control listener on port {}", control_port);

        // Capabilities are read from the registry per announcement, so
        // handlers registered after start are still advertised.
        let announce = Arc::new(IdentityAnnouncer::new(
            self.identity.device_id(),
            self.config.device.name.clone(),
            self.config.device.class,
            control_port,
            Arc::clone(&self.registry),
        ));

        let discovery = Arc::new(DiscoveryService::new(
            self.identity.device_id(),
            Arc::clone(&announce),
            self.config.network.discovery_port,
            Duration::from_secs(self.config.network.broadcast_interval),
            Duration::from_secs(self.config.network.liveness_timeout),
        ));
        discovery
            .start()
            .await
            .context("Failed to start discovery")?;

        let core = Arc::new(EngineCore {
            identity: self.identity.clone(),
            announce,
            trust: Arc::clone(&self.trust),
            pairing: Arc::clone(&self.pairing),
            registry: Arc::clone(&self.registry),
            transfers: Arc::clone(&self.transfers),
            discovery,
            links: RwLock::new(HashMap::new()),
            event_tx: self.event_tx.clone(),
        });
        self.core = Some(Arc::clone(&core));

        tokio::spawn(accept_loop(
            Arc::clone(&core),
            listener,
            self.shutdown_token.clone(),
        ));
        tokio::spawn(pairing_sweep_loop(
            Arc::clone(&core),
            Duration::from_secs(self.config.pairing.request_timeout),
            self.shutdown_token.clone(),
        ));
        tokio::spawn(forward_discovery_events(
            Arc::clone(&core),
            self.shutdown_token.clone(),
        ));
        tokio::spawn(forward_pairing_events(
            Arc::clone(&core),
            self.shutdown_token.clone(),
        ));
        tokio::spawn(forward_transfer_events(
            Arc::clone(&core),
            self.shutdown_token.clone(),
        ));

        {
            let mut state = self.state.write().await;
            *state = EngineState::Running;
        }
        self.emit(EngineEvent::StateChanged(EngineState::Running));

        info!("Engine started");
        Ok(())
    }

    /// Stops the engine gracefully.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == EngineState::Stopped {
                return Ok(());
            }
            if *state == EngineState::ShuttingDown {
                anyhow::bail!("Engine is already shutting down");
            }
            *state = EngineState::ShuttingDown;
        }
        self.emit(EngineEvent::StateChanged(EngineState::ShuttingDown));

        info!("Stopping engine...");

        self.shutdown_token.cancel();

        if let Some(core) = self.core.take() {
            core.discovery.shutdown();
            let mut links = core.links.write().await;
            for (device_id, entry) in links.drain() {
                debug!("Closing link to {}", device_id);
                entry.sender.close();
            }
        }

        if let Err(e) = self.trust.save() {
            warn!("Error saving trust store: {}", e);
        }

        {
            let mut state = self.state.write().await;
            *state = EngineState::Stopped;
        }
        self.emit(EngineEvent::StateChanged(EngineState::Stopped));

        info!("Engine stopped");
        Ok(())
    }

    /// Returns a snapshot of currently discovered devices.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        match &self.core {
            Some(core) => core.discovery.devices(),
            None => Vec::new(),
        }
    }

    /// Returns the actual control listener port, once started.
    pub fn control_port(&self) -> Option<u16> {
        self.core.as_ref().map(|c| c.announce.tcp_port())
    }

    /// Ensures a control link to a discovered peer exists, connecting if
    /// necessary.
    pub async fn connect(&self, device_id: DeviceId) -> Result<()> {
        let core = self.core()?;
        ensure_link(&core, device_id, self.shutdown_token.clone()).await?;
        Ok(())
    }

    /// Opens a control link to an explicit address, bypassing discovery.
    pub async fn connect_addr(&self, addr: SocketAddr) -> Result<DeviceId> {
        let core = self.core()?;
        let conn = LinkConnection::connect(addr, &core.identity, &core.announce.body())
            .await
            .context("Failed to establish control link")?;
        let device_id = conn.remote_device_id();
        register_link(&core, conn, self.shutdown_token.clone()).await;
        Ok(device_id)
    }

    /// Sends a pairing request to a peer, connecting first if needed.
    pub async fn request_pairing(&self, device_id: DeviceId) -> Result<()> {
        let core = self.core()?;
        let sender = ensure_link(&core, device_id, self.shutdown_token.clone()).await?;
        let body = self.pairing.request_pairing(device_id)?;
        sender.send(body.to_packet()?).await?;
        Ok(())
    }

    /// Accepts a pending incoming pairing request.
    pub async fn accept_pairing(&self, device_id: DeviceId) -> Result<()> {
        let core = self.core()?;
        let body = self.pairing.accept_pending(device_id)?;
        if let Some(sender) = link_sender(&core, &device_id).await {
            sender.send(body.to_packet()?).await?;
        }
        Ok(())
    }

    /// Rejects a pending incoming pairing request.
    pub async fn reject_pairing(&self, device_id: DeviceId) -> Result<()> {
        let core = self.core()?;
        let body = self.pairing.reject_pending(device_id)?;
        if let Some(sender) = link_sender(&core, &device_id).await {
            sender.send(body.to_packet()?).await?;
        }
        Ok(())
    }

    /// Unpairs from a peer, removing its pin and notifying it if a link
    /// is up.
    pub async fn unpair(&self, device_id: DeviceId) -> Result<()> {
        let body = self.pairing.unpair(device_id)?;
        if let (Some(body), Some(core)) = (body, self.core.as_ref()) {
            if let Some(sender) = link_sender(core, &device_id).await {
                if let Err(e) = sender.send(body.to_packet()?).await {
                    debug!("Could not notify {} of unpair: {}", device_id, e);
                }
            }
        }
        Ok(())
    }

    /// Sends a packet to a paired peer over its control link.
    pub async fn send_packet(&self, device_id: DeviceId, packet: Packet) -> Result<()> {
        let core = self.core()?;
        if !self.pairing.is_paired(&device_id) {
            anyhow::bail!("Peer {} is not paired", device_id);
        }
        let sender = ensure_link(&core, device_id, self.shutdown_token.clone()).await?;
        sender.send(packet).await?;
        Ok(())
    }

    /// Sends a packet with an attached payload to a paired peer.
    ///
    /// Opens an ephemeral payload port, announces it in the packet, and
    /// returns a handle for observing or cancelling the transfer.
    pub async fn send_payload<R>(
        &self,
        device_id: DeviceId,
        packet_type: &str,
        body: Map<String, serde_json::Value>,
        source: R,
        total: u64,
    ) -> Result<TransferHandle>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let core = self.core()?;
        if !self.pairing.is_paired(&device_id) {
            anyhow::bail!("Peer {} is not paired", device_id);
        }
        let sender = ensure_link(&core, device_id, self.shutdown_token.clone()).await?;

        let (info, handle) = self
            .transfers
            .offer(source, total)
            .await
            .context("Failed to open payload channel")?;
        let packet = Packet::new(packet_type, body).with_payload(total, info);
        sender.send(packet).await?;
        Ok(handle)
    }

    /// Fetches the payload attached to a received packet into a file.
    ///
    /// The payload port comes from the packet; the peer address comes
    /// from the discovery registry.
    pub async fn receive_payload(
        &self,
        device_id: DeviceId,
        packet: &Packet,
        dest: std::path::PathBuf,
    ) -> Result<TransferHandle> {
        let core = self.core()?;
        let (total, info) = match (packet.payload_size, &packet.payload_transfer_info) {
            (Some(size), Some(info)) => (size, info),
            _ => anyhow::bail!("Packet carries no payload"),
        };
        let device = core
            .discovery
            .get(&device_id)
            .with_context(|| format!("Peer {} is not in the discovery registry", device_id))?;
        let addr = SocketAddr::new(device.address.ip(), info.port);
        let handle = self
            .transfers
            .receive_to_file(addr, total, dest)
            .await
            .context("Failed to start payload download")?;
        Ok(handle)
    }

    /// Returns the trust store.
    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Returns the pairing manager.
    pub fn pairing(&self) -> &Arc<PairingManager> {
        &self.pairing
    }

    /// Returns the capability registry.
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Returns the number of active control links.
    pub async fn link_count(&self) -> usize {
        match &self.core {
            Some(core) => core.links.read().await.len(),
            None => 0,
        }
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    fn core(&self) -> Result<Arc<EngineCore>> {
        self.core
            .as_ref()
            .cloned()
            .context("Engine is not started")
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Looks up the sender for an existing link.
async fn link_sender(core: &Arc<EngineCore>, device_id: &DeviceId) -> Option<LinkSender> {
    core.links
        .read()
        .await
        .get(device_id)
        .map(|e| e.sender.clone())
}

/// Returns the sender for a peer's link, connecting through the
/// discovery registry if none is up.
async fn ensure_link(
    core: &Arc<EngineCore>,
    device_id: DeviceId,
    shutdown: CancellationToken,
) -> Result<LinkSender> {
    if let Some(sender) = link_sender(core, &device_id).await {
        return Ok(sender);
    }

    let device = core
        .discovery
        .get(&device_id)
        .with_context(|| format!("Peer {} is not in the discovery registry", device_id))?;
    let conn = LinkConnection::connect(device.address, &core.identity, &core.announce.body())
        .await
        .with_context(|| format!("Failed to connect to {}", device.address))?;

    if conn.remote_device_id() != device_id {
        anyhow::bail!(
            "Address {} answered as {} instead of {}",
            device.address,
            conn.remote_device_id(),
            device_id
        );
    }

    register_link(core, conn, shutdown)
        .await
        .with_context(|| format!("Link to {} closed during setup", device_id))
}

/// Registers an established connection and spawns its dispatch task.
///
/// If a link to the same peer already exists the new connection is
/// dropped and the existing sender returned.
async fn register_link(
    core: &Arc<EngineCore>,
    conn: LinkConnection,
    shutdown: CancellationToken,
) -> Option<LinkSender> {
    let device_id = conn.remote_device_id();
    let fingerprint = conn.remote_fingerprint();
    let identity = conn.remote_identity().clone();
    let peer_ip = conn.peer_addr().ok().map(|a| a.ip());

    let mut links = core.links.write().await;
    if let Some(existing) = links.get(&device_id) {
        debug!("Duplicate link to {}, keeping the existing one", device_id);
        return Some(existing.sender.clone());
    }

    let link = conn.start();
    let sender = link.sender();
    links.insert(
        device_id,
        LinkEntry {
            sender: sender.clone(),
            fingerprint,
        },
    );
    drop(links);

    // Seed the registry and discovery from the identity packet that came
    // with the handshake.
    core.registry.negotiate(device_id, &identity);
    if let Some(ip) = peer_ip {
        core.discovery.observe_identity(identity, ip);
    }

    let _ = core
        .event_tx
        .send(EngineEvent::PeerConnected { device_id });

    tokio::spawn(run_link(Arc::clone(core), link, peer_ip, shutdown));
    Some(sender)
}

/// Accepts inbound control connections until shutdown.
async fn accept_loop(core: Arc<EngineCore>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Control listener accept failed: {}", e);
                    continue;
                }
            },
        };

        debug!("Inbound control connection from {}", addr);
        let core = Arc::clone(&core);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match LinkConnection::accept(stream, &core.identity, &core.announce.body()).await {
                Ok(conn) => {
                    register_link(&core, conn, shutdown).await;
                }
                Err(e) => {
                    warn!("Handshake with {} failed: {}", addr, e);
                }
            }
        });
    }
    debug!("Control listener stopped");
}

/// The per-peer dispatch task. Processes packets strictly in arrival
/// order.
async fn run_link(
    core: Arc<EngineCore>,
    mut link: crate::link::PeerLink,
    peer_ip: Option<IpAddr>,
    shutdown: CancellationToken,
) {
    let device_id = link.device_id();
    let fingerprint = link.fingerprint();
    let sender = link.sender();

    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => break,
            packet = link.recv() => match packet {
                Some(p) => p,
                None => break,
            },
        };

        if packet.is_identity() {
            match IdentityBody::from_packet(&packet) {
                Ok(body) => {
                    core.registry.negotiate(device_id, &body);
                    if let Some(ip) = peer_ip {
                        core.discovery.observe_identity(body, ip);
                    }
                }
                Err(e) => warn!("Invalid identity packet from {}: {}", device_id, e),
            }
            continue;
        }

        if packet.is_pair() {
            match PairBody::from_packet(&packet) {
                Ok(body) => {
                    let name = link.identity().device_name.clone();
                    match core
                        .pairing
                        .handle_pair_packet(device_id, &name, fingerprint, body)
                    {
                        Ok(_) => {}
                        Err(PairingError::FingerprintMismatch {
                            pinned, presented, ..
                        }) => {
                            warn!(
                                "Fingerprint mismatch on pair packet from {}: pinned {}, presented {}",
                                device_id,
                                pinned.to_display_string(),
                                presented.to_display_string()
                            );
                            let _ = core.event_tx.send(EngineEvent::Security(
                                SecurityEvent::FingerprintMismatch {
                                    device_id,
                                    pinned,
                                    presented,
                                },
                            ));
                            link.close();
                            break;
                        }
                        Err(e) => debug!("Pair packet from {} ignored: {}", device_id, e),
                    }
                }
                Err(e) => warn!("Invalid pair packet from {}: {}", device_id, e),
            }
            continue;
        }

        // Anything beyond identity and pairing requires the pinned
        // fingerprint to match this connection.
        let pinned = core.trust.pinned_fingerprint(&device_id).unwrap_or(None);
        if let Some(pin) = pinned {
            if pin != fingerprint {
                warn!(
                    "Fingerprint mismatch for {}: pinned {}, presented {}",
                    device_id,
                    pin.to_display_string(),
                    fingerprint.to_display_string()
                );
                let _ = core
                    .event_tx
                    .send(EngineEvent::Security(SecurityEvent::FingerprintMismatch {
                        device_id,
                        pinned: pin,
                        presented: fingerprint,
                    }));
                link.close();
                break;
            }
        }

        let paired = pinned.is_some() && core.pairing.is_paired(&device_id);
        match core.registry.dispatch(device_id, paired, &packet) {
            DispatchOutcome::Delivered(Some(reply)) => {
                if let Err(e) = sender.send(reply).await {
                    debug!("Could not send reply to {}: {}", device_id, e);
                }
            }
            DispatchOutcome::Delivered(None) => {}
            DispatchOutcome::DroppedNotPaired => {
                warn!(
                    "Dropped {} packet from unpaired peer {}",
                    packet.packet_type, device_id
                );
                let _ = core
                    .event_tx
                    .send(EngineEvent::Security(SecurityEvent::UnpairedTraffic {
                        device_id,
                        packet_type: packet.packet_type.clone(),
                    }));
            }
            DispatchOutcome::DroppedUnknownType
            | DispatchOutcome::DroppedDisabled
            | DispatchOutcome::DroppedNotNegotiated => {}
        }
    }

    core.links.write().await.remove(&device_id);
    core.registry.forget_peer(&device_id);
    let _ = core
        .event_tx
        .send(EngineEvent::PeerDisconnected { device_id });
    debug!("Dispatch task for {} finished", device_id);
}

/// Expires stale pending pairing requests on a timer.
async fn pairing_sweep_loop(
    core: Arc<EngineCore>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let period = std::cmp::max(timeout / 4, Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                for device_id in core.pairing.expire_pending(timeout) {
                    debug!("Pairing request involving {} expired", device_id);
                }
            }
        }
    }
}

async fn forward_discovery_events(core: Arc<EngineCore>, shutdown: CancellationToken) {
    let mut events = core.discovery.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(e) => {
                    let _ = core.event_tx.send(EngineEvent::Discovery(e));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Discovery event forwarder lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn forward_pairing_events(core: Arc<EngineCore>, shutdown: CancellationToken) {
    let mut events = core.pairing.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(e) => {
                    let _ = core.event_tx.send(EngineEvent::Pairing(e));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Pairing event forwarder lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn forward_transfer_events(core: Arc<EngineCore>, shutdown: CancellationToken) {
    let mut events = core.transfers.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(e) => {
                    let _ = core.event_tx.send(EngineEvent::Transfer(e));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Transfer event forwarder lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
