//! Noise protocol handshake and transport encryption for the control
//! channel.
//!
//! The control channel performs a Noise XX handshake before any
//! non-identity packet is accepted. XX gives mutual authentication with
//! identity hiding: each side proves possession of its static key, and the
//! static key is what trust pinning hashes into a [`Fingerprint`].
//!
//! ## Noise XX pattern
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! After the handshake the caller must compare
//! [`NoiseSession::remote_fingerprint`] against the fingerprint pinned for
//! the peer's device id before processing anything beyond identity and
//! pairing packets.

use snow::{Builder, HandshakeState, TransportState};

use crate::error::{ProtocolError, Result};
use crate::identity::{DeviceIdentity, Fingerprint};

/// The Noise pattern used for control-channel handshakes.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Maximum size of a single Noise message, per the Noise specification.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Overhead added by Noise encryption (Poly1305 tag).
pub const NOISE_OVERHEAD: usize = 16;

/// State of the handshake exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Initiator: ready to send the first message (-> e).
    InitiatorStart,
    /// Initiator: waiting for the response (<- e, ee, s, es).
    InitiatorWaitingForResponse,
    /// Initiator: ready to send the final message (-> s, se).
    InitiatorSendFinal,
    /// Responder: waiting for the first message (-> e).
    ResponderStart,
    /// Responder: ready to send the response (<- e, ee, s, es).
    ResponderSendResponse,
    /// Responder: waiting for the final message (-> s, se).
    ResponderWaitingForFinal,
    /// Handshake complete, ready for transport.
    Complete,
}

/// Role in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens the connection (usually the device that discovered the peer).
    Initiator,
    /// Accepts the connection.
    Responder,
}

/// A Noise session: handshake state machine, then encrypted transport.
pub struct NoiseSession {
    /// Handshake state, present only during the handshake phase.
    handshake: Option<HandshakeState>,
    /// Transport state, present only after handshake completion.
    transport: Option<TransportState>,
    phase: HandshakePhase,
    role: Role,
    /// Remote static key, captured before the handshake state is consumed.
    remote_static_cache: Option<[u8; 32]>,
    /// Scratch buffer for snow operations.
    buffer: Vec<u8>,
}

impl NoiseSession {
    /// Creates a new session as the initiator.
    pub fn new_initiator(identity: &DeviceIdentity) -> Result<Self> {
        Self::build(identity, Role::Initiator)
    }

    /// Creates a new session as the responder.
    pub fn new_responder(identity: &DeviceIdentity) -> Result<Self> {
        Self::build(identity, Role::Responder)
    }

    fn build(identity: &DeviceIdentity, role: Role) -> Result<Self> {
        let builder = Builder::new(NOISE_PATTERN.parse().map_err(|e| {
            ProtocolError::HandshakeFailed(format!("invalid noise pattern: {e}"))
        })?);
        let builder = builder.local_private_key(identity.noise_static_secret());

        let (handshake, phase) = match role {
            Role::Initiator => (
                builder.build_initiator().map_err(|e| {
                    ProtocolError::HandshakeFailed(format!("failed to build initiator: {e}"))
                })?,
                HandshakePhase::InitiatorStart,
            ),
            Role::Responder => (
                builder.build_responder().map_err(|e| {
                    ProtocolError::HandshakeFailed(format!("failed to build responder: {e}"))
                })?,
                HandshakePhase::ResponderStart,
            ),
        };

        Ok(Self {
            handshake: Some(handshake),
            transport: None,
            phase,
            role,
            remote_static_cache: None,
            buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        })
    }

    /// Returns the current handshake phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Returns the role in the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns whether the handshake is complete.
    pub fn is_handshake_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Writes the next handshake message, optionally carrying a payload.
    pub fn write_handshake_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorStart)
            | (Role::Initiator, HandshakePhase::InitiatorSendFinal)
            | (Role::Responder, HandshakePhase::ResponderSendResponse) => {}
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot write in current phase: {:?}",
                    self.phase
                )));
            }
        }

        let len = handshake.write_message(payload, &mut self.buffer)?;
        let message = self.buffer[..len].to_vec();

        self.phase = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorStart) => {
                HandshakePhase::InitiatorWaitingForResponse
            }
            (Role::Initiator, HandshakePhase::InitiatorSendFinal) => HandshakePhase::Complete,
            (Role::Responder, HandshakePhase::ResponderSendResponse) => {
                HandshakePhase::ResponderWaitingForFinal
            }
            _ => self.phase,
        };

        Ok(message)
    }

    /// Reads a handshake message from the peer, returning any payload it
    /// carried.
    pub fn read_handshake_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorWaitingForResponse)
            | (Role::Responder, HandshakePhase::ResponderStart)
            | (Role::Responder, HandshakePhase::ResponderWaitingForFinal) => {}
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot read in current phase: {:?}",
                    self.phase
                )));
            }
        }

        let len = handshake.read_message(message, &mut self.buffer)?;
        let payload = self.buffer[..len].to_vec();

        self.phase = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorWaitingForResponse) => {
                HandshakePhase::InitiatorSendFinal
            }
            (Role::Responder, HandshakePhase::ResponderStart) => {
                HandshakePhase::ResponderSendResponse
            }
            (Role::Responder, HandshakePhase::ResponderWaitingForFinal) => {
                HandshakePhase::Complete
            }
            _ => self.phase,
        };

        Ok(payload)
    }

    /// Returns the remote peer's static public key, once the handshake has
    /// progressed far enough to have received it.
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        let remote = match (&self.handshake, &self.transport) {
            (Some(hs), _) => hs.get_remote_static(),
            (None, Some(_)) => self.remote_static_cache.as_ref().map(|k| &k[..]),
            _ => None,
        }?;
        let mut key = [0u8; 32];
        key.copy_from_slice(remote);
        Some(key)
    }

    /// Returns the fingerprint of the certificate the peer presented, for
    /// comparison against the pinned fingerprint.
    pub fn remote_fingerprint(&self) -> Option<Fingerprint> {
        self.remote_static().map(|k| Fingerprint::of_static_key(&k))
    }

    /// Transitions from handshake to transport mode. The handshake must be
    /// complete.
    pub fn into_transport(&mut self) -> Result<()> {
        if self.phase != HandshakePhase::Complete {
            return Err(ProtocolError::HandshakeIncomplete);
        }

        let handshake = self
            .handshake
            .take()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        // Keep the remote static key around; snow drops it with the
        // handshake state.
        self.remote_static_cache = handshake.get_remote_static().map(|r| {
            let mut key = [0u8; 32];
            key.copy_from_slice(r);
            key
        });

        let transport = handshake.into_transport_mode()?;
        self.transport = Some(transport);
        Ok(())
    }

    /// Encrypts a plaintext for transport. Handshake must be complete.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        if plaintext.len() > MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD {
            return Err(ProtocolError::Encryption(format!(
                "plaintext too large: {} bytes exceeds maximum of {} bytes",
                plaintext.len(),
                MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD
            )));
        }

        let len = transport.write_message(plaintext, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }

    /// Decrypts a ciphertext from transport. Handshake must be complete.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        if ciphertext.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too large: {} bytes exceeds maximum of {} bytes",
                ciphertext.len(),
                MAX_NOISE_MESSAGE_SIZE
            )));
        }

        let len = transport.read_message(ciphertext, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }
}

impl std::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("is_transport", &self.transport.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;

    fn complete_handshake(
        initiator: &mut NoiseSession,
        responder: &mut NoiseSession,
    ) {
        let msg1 = initiator.write_handshake_message(&[]).unwrap();
        responder.read_handshake_message(&msg1).unwrap();
        let msg2 = responder.write_handshake_message(&[]).unwrap();
        initiator.read_handshake_message(&msg2).unwrap();
        let msg3 = initiator.write_handshake_message(&[]).unwrap();
        responder.read_handshake_message(&msg3).unwrap();
    }

    #[test]
    fn test_initiator_creation() {
        let identity = DeviceIdentity::generate();
        let session = NoiseSession::new_initiator(&identity).unwrap();
        assert_eq!(session.role(), Role::Initiator);
        assert_eq!(session.phase(), HandshakePhase::InitiatorStart);
        assert!(!session.is_handshake_complete());
    }

    #[test]
    fn test_responder_creation() {
        let identity = DeviceIdentity::generate();
        let session = NoiseSession::new_responder(&identity).unwrap();
        assert_eq!(session.role(), Role::Responder);
        assert_eq!(session.phase(), HandshakePhase::ResponderStart);
    }

    #[test]
    fn test_full_handshake_phases() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        let mut initiator = NoiseSession::new_initiator(&a).unwrap();
        let mut responder = NoiseSession::new_responder(&b).unwrap();

        let msg1 = initiator.write_handshake_message(&[]).unwrap();
        assert_eq!(
            initiator.phase(),
            HandshakePhase::InitiatorWaitingForResponse
        );
        responder.read_handshake_message(&msg1).unwrap();
        assert_eq!(responder.phase(), HandshakePhase::ResponderSendResponse);

        let msg2 = responder.write_handshake_message(&[]).unwrap();
        assert_eq!(responder.phase(), HandshakePhase::ResponderWaitingForFinal);
        initiator.read_handshake_message(&msg2).unwrap();
        assert_eq!(initiator.phase(), HandshakePhase::InitiatorSendFinal);

        let msg3 = initiator.write_handshake_message(&[]).unwrap();
        assert!(initiator.is_handshake_complete());
        responder.read_handshake_message(&msg3).unwrap();
        assert!(responder.is_handshake_complete());
    }

    #[test]
    fn test_remote_fingerprint_matches_identity() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        let mut initiator = NoiseSession::new_initiator(&a).unwrap();
        let mut responder = NoiseSession::new_responder(&b).unwrap();
        complete_handshake(&mut initiator, &mut responder);

        // Each side sees exactly the fingerprint the other computes for
        // itself. This is the property pinning relies on.
        assert_eq!(initiator.remote_fingerprint().unwrap(), b.fingerprint());
        assert_eq!(responder.remote_fingerprint().unwrap(), a.fingerprint());
    }

    #[test]
    fn test_remote_fingerprint_survives_transport_transition() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        let mut initiator = NoiseSession::new_initiator(&a).unwrap();
        let mut responder = NoiseSession::new_responder(&b).unwrap();
        complete_handshake(&mut initiator, &mut responder);

        initiator.into_transport().unwrap();
        assert_eq!(initiator.remote_fingerprint().unwrap(), b.fingerprint());
    }

    #[test]
    fn test_transport_roundtrip() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        let mut initiator = NoiseSession::new_initiator(&a).unwrap();
        let mut responder = NoiseSession::new_responder(&b).unwrap();
        complete_handshake(&mut initiator, &mut responder);
        initiator.into_transport().unwrap();
        responder.into_transport().unwrap();

        for i in 0..5 {
            let msg = format!("packet number {i}\n");
            let ct = initiator.encrypt(msg.as_bytes()).unwrap();
            let pt = responder.decrypt(&ct).unwrap();
            assert_eq!(pt, msg.as_bytes());

            let ct = responder.encrypt(msg.as_bytes()).unwrap();
            let pt = initiator.decrypt(&ct).unwrap();
            assert_eq!(pt, msg.as_bytes());
        }
    }

    #[test]
    fn test_handshake_payload_delivery() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        let mut initiator = NoiseSession::new_initiator(&a).unwrap();
        let mut responder = NoiseSession::new_responder(&b).unwrap();

        let msg1 = initiator.write_handshake_message(b"hello").unwrap();
        let received = responder.read_handshake_message(&msg1).unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn test_cannot_encrypt_before_transport() {
        let identity = DeviceIdentity::generate();
        let mut session = NoiseSession::new_initiator(&identity).unwrap();
        assert!(session.encrypt(b"test").is_err());
        assert!(session.decrypt(b"test").is_err());
    }

    #[test]
    fn test_cannot_transition_before_complete() {
        let identity = DeviceIdentity::generate();
        let mut session = NoiseSession::new_initiator(&identity).unwrap();
        assert!(matches!(
            session.into_transport(),
            Err(ProtocolError::HandshakeIncomplete)
        ));
    }

    #[test]
    fn test_cannot_write_out_of_turn() {
        let identity = DeviceIdentity::generate();
        let mut responder = NoiseSession::new_responder(&identity).unwrap();
        assert!(responder.write_handshake_message(&[]).is_err());
    }

    #[test]
    fn test_cannot_read_out_of_turn() {
        let identity = DeviceIdentity::generate();
        let mut initiator = NoiseSession::new_initiator(&identity).unwrap();
        assert!(initiator.read_handshake_message(&[0; 48]).is_err());
    }

    #[test]
    fn test_modified_ciphertext_fails_decryption() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        let mut initiator = NoiseSession::new_initiator(&a).unwrap();
        let mut responder = NoiseSession::new_responder(&b).unwrap();
        complete_handshake(&mut initiator, &mut responder);
        initiator.into_transport().unwrap();
        responder.into_transport().unwrap();

        let mut ct = initiator.encrypt(b"secret").unwrap();
        ct[0] ^= 0xFF;
        assert!(responder.decrypt(&ct).is_err());
    }
}
