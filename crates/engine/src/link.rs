//! The encrypted per-peer control channel.
//!
//! A control connection is a TCP stream carrying length-prefixed records:
//! `[u16 len][ciphertext]`. The first records perform a Noise XX
//! handshake; every record after that is a Noise transport message whose
//! plaintext is exactly one newline-terminated packet.
//!
//! Immediately after the handshake each side sends its identity packet,
//! so an established [`LinkConnection`] always knows who it is talking to
//! and which static key fingerprint the peer presented. Callers verify
//! that fingerprint against the trust store pin before processing
//! anything beyond identity and pairing packets.
//!
//! [`LinkConnection::start`] splits the stream into a writer task fed by
//! an mpsc queue and a reader task that forwards decoded packets in
//! arrival order, which is what keeps per-peer dispatch ordered.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use protocol::{
    DeviceId, DeviceIdentity, Fingerprint, IdentityBody, NoiseSession, Packet, PacketCodec,
    ProtocolError, Result,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Depth of the outgoing packet queue per peer.
const OUTGOING_QUEUE_DEPTH: usize = 64;

/// Depth of the incoming packet queue per peer.
const INCOMING_QUEUE_DEPTH: usize = 64;

/// Writes one length-prefixed record.
pub(crate) async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        ProtocolError::Encryption(format!("record too large: {} bytes", data.len()))
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed record.
pub(crate) async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// An authenticated, encrypted control connection, before its tasks are
/// started.
pub struct LinkConnection {
    stream: TcpStream,
    session: NoiseSession,
    remote_device_id: DeviceId,
    remote_fingerprint: Fingerprint,
    remote_identity: IdentityBody,
}

impl LinkConnection {
    /// Opens a control connection to a peer: connect, handshake as the
    /// Noise initiator, then exchange identity packets.
    pub async fn connect(
        addr: SocketAddr,
        local: &DeviceIdentity,
        announce: &IdentityBody,
    ) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let mut session = NoiseSession::new_initiator(local)?;

        // -> e
        let msg = session.write_handshake_message(&[])?;
        write_record(&mut stream, &msg).await?;
        // <- e, ee, s, es
        let msg = read_record(&mut stream).await?;
        session.read_handshake_message(&msg)?;
        // -> s, se
        let msg = session.write_handshake_message(&[])?;
        write_record(&mut stream, &msg).await?;
        session.into_transport()?;

        Self::exchange_identity(stream, session, announce, true).await
    }

    /// Accepts a control connection from a peer: handshake as the Noise
    /// responder, then exchange identity packets.
    pub async fn accept(
        mut stream: TcpStream,
        local: &DeviceIdentity,
        announce: &IdentityBody,
    ) -> Result<Self> {
        let mut session = NoiseSession::new_responder(local)?;

        // -> e
        let msg = read_record(&mut stream).await?;
        session.read_handshake_message(&msg)?;
        // <- e, ee, s, es
        let msg = session.write_handshake_message(&[])?;
        write_record(&mut stream, &msg).await?;
        // -> s, se
        let msg = read_record(&mut stream).await?;
        session.read_handshake_message(&msg)?;
        session.into_transport()?;

        Self::exchange_identity(stream, session, announce, false).await
    }

    /// Sends our identity packet and reads the peer's, in role order:
    /// the initiator speaks first so the exchange cannot deadlock on
    /// unbuffered transports.
    async fn exchange_identity(
        mut stream: TcpStream,
        mut session: NoiseSession,
        announce: &IdentityBody,
        initiator: bool,
    ) -> Result<Self> {
        let codec = PacketCodec::new();

        let send = |session: &mut NoiseSession| -> Result<Vec<u8>> {
            let packet = announce.to_packet()?;
            let plaintext = codec.encode(&packet)?;
            session.encrypt(&plaintext)
        };

        let remote_identity;
        if initiator {
            let record = send(&mut session)?;
            write_record(&mut stream, &record).await?;
            let record = read_record(&mut stream).await?;
            let plaintext = session.decrypt(&record)?;
            remote_identity = parse_identity(&codec, &plaintext)?;
        } else {
            let record = read_record(&mut stream).await?;
            let plaintext = session.decrypt(&record)?;
            remote_identity = parse_identity(&codec, &plaintext)?;
            let record = send(&mut session)?;
            write_record(&mut stream, &record).await?;
        }

        let remote_device_id = DeviceId::parse(&remote_identity.device_id)?;
        let remote_fingerprint = session.remote_fingerprint().ok_or_else(|| {
            ProtocolError::HandshakeFailed("peer presented no static key".to_string())
        })?;

        tracing::debug!(
            "Control link established with {} ({}), fingerprint {}",
            remote_device_id,
            remote_identity.device_name,
            remote_fingerprint.to_display_string()
        );

        Ok(Self {
            stream,
            session,
            remote_device_id,
            remote_fingerprint,
            remote_identity,
        })
    }

    /// The peer's device id as announced in its identity packet.
    pub fn remote_device_id(&self) -> DeviceId {
        self.remote_device_id
    }

    /// Fingerprint of the static key the peer proved possession of during
    /// the handshake.
    pub fn remote_fingerprint(&self) -> Fingerprint {
        self.remote_fingerprint
    }

    /// The peer's announced identity.
    pub fn remote_identity(&self) -> &IdentityBody {
        &self.remote_identity
    }

    /// The remote socket address.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Starts the reader and writer tasks and returns the peer link
    /// handle.
    pub fn start(self) -> PeerLink {
        let (read_half, write_half) = self.stream.into_split();
        let session = Arc::new(Mutex::new(self.session));
        let cancel = CancellationToken::new();

        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_DEPTH);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);

        let device_id = self.remote_device_id;
        tokio::spawn(writer_task(
            device_id,
            write_half,
            session.clone(),
            outgoing_rx,
            cancel.clone(),
        ));
        tokio::spawn(reader_task(
            device_id,
            read_half,
            session,
            incoming_tx,
            cancel.clone(),
        ));

        PeerLink {
            device_id,
            fingerprint: self.remote_fingerprint,
            identity: self.remote_identity,
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            cancel,
        }
    }
}

fn parse_identity(codec: &PacketCodec, plaintext: &[u8]) -> Result<IdentityBody> {
    let packet = codec.decode(plaintext)?;
    IdentityBody::from_packet(&packet)
}

/// Cloneable sending side of a running link.
///
/// Lets the engine queue packets for a peer while the dispatch task owns
/// the receiving side.
#[derive(Clone)]
pub struct LinkSender {
    device_id: DeviceId,
    outgoing: mpsc::Sender<Packet>,
    cancel: CancellationToken,
}

impl LinkSender {
    /// The peer this sender writes to.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Queues a packet for sending.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.outgoing
            .send(packet)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed("link writer stopped".to_string()))
    }

    /// Closes the link this sender belongs to.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// A running control link to one peer.
///
/// Incoming packets are delivered through [`PeerLink::recv`] strictly in
/// arrival order; the consumer is the peer's single dispatch task.
pub struct PeerLink {
    device_id: DeviceId,
    fingerprint: Fingerprint,
    identity: IdentityBody,
    outgoing: mpsc::Sender<Packet>,
    incoming: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
}

impl PeerLink {
    /// The peer's device id.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// The fingerprint the peer presented on this connection.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The peer's announced identity.
    pub fn identity(&self) -> &IdentityBody {
        &self.identity
    }

    /// Queues a packet for sending.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.outgoing
            .send(packet)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed("link writer stopped".to_string()))
    }

    /// Returns a cloneable sender for this link.
    pub fn sender(&self) -> LinkSender {
        LinkSender {
            device_id: self.device_id,
            outgoing: self.outgoing.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Receives the next packet, in arrival order. Returns `None` once
    /// the connection has closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.incoming.recv().await
    }

    /// Closes the link, stopping both tasks.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(
    device_id: DeviceId,
    mut writer: W,
    session: Arc<Mutex<NoiseSession>>,
    mut outgoing: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
) {
    let codec = PacketCodec::new();
    loop {
        let packet = tokio::select! {
            packet = outgoing.recv() => match packet {
                Some(p) => p,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let record = {
            // Sync lock held only across the in-memory encrypt; nonce
            // order matches write order because this task is the only
            // encryptor.
            let encrypted = codec.encode(&packet).and_then(|plaintext| {
                let mut guard = match session.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.encrypt(&plaintext)
            });
            match encrypted {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Failed to encrypt packet for {}: {}", device_id, e);
                    continue;
                }
            }
        };

        if let Err(e) = write_record(&mut writer, &record).await {
            tracing::debug!("Link writer for {} stopped: {}", device_id, e);
            break;
        }
    }
    cancel.cancel();
}

async fn reader_task<R: AsyncRead + Unpin>(
    device_id: DeviceId,
    mut reader: R,
    session: Arc<Mutex<NoiseSession>>,
    incoming: mpsc::Sender<Packet>,
    cancel: CancellationToken,
) {
    let codec = PacketCodec::new();
    loop {
        let record = tokio::select! {
            record = read_record(&mut reader) => match record {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("Link reader for {} stopped: {}", device_id, e);
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        };

        let plaintext = {
            let mut guard = match session.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match guard.decrypt(&record) {
                Ok(p) => p,
                Err(e) => {
                    // An undecryptable record means the transport states
                    // have diverged; nothing after it can be trusted.
                    tracing::warn!("Dropping link to {}: {}", device_id, e);
                    break;
                }
            }
        };

        let packet = match codec.decode(&plaintext) {
            Ok(p) => p,
            Err(e) => {
                // A malformed packet is dropped; the connection and all
                // subsequent packets survive.
                tracing::warn!("Dropping malformed packet from {}: {}", device_id, e);
                continue;
            }
        };

        if incoming.send(packet).await.is_err() {
            break;
        }
    }
    cancel.cancel();
}
