//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all failure modes of the engine.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Codec errors
    /// A packet failed to parse or violated the wire format. The offending
    /// packet is dropped; the connection survives.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Failed to serialize a packet for the wire.
    #[error("packet serialization failed: {0}")]
    Serialization(String),

    // Trust errors
    /// The certificate presented during the handshake does not hash to the
    /// fingerprint pinned for this peer. Always fatal to the connection
    /// attempt, never downgraded.
    #[error("untrusted peer {peer_id}: presented fingerprint {presented} does not match pin")]
    UntrustedPeer {
        /// The peer id whose pin was violated.
        peer_id: String,
        /// The fingerprint the peer actually presented.
        presented: String,
    },

    /// Invalid or malformed public key material.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    // Handshake errors
    /// Noise protocol handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Attempted to use transport before handshake completion.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,

    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // Transfer errors
    /// A payload transfer ended with fewer bytes than promised.
    #[error("transfer incomplete: transferred {transferred} of {total} bytes")]
    TransferIncomplete {
        /// Bytes actually moved before the channel closed.
        transferred: u64,
        /// Bytes the originating packet promised.
        total: u64,
    },

    /// A payload transfer was cancelled by the caller.
    #[error("transfer cancelled after {transferred} bytes")]
    TransferCancelled {
        /// Bytes moved before cancellation was observed.
        transferred: u64,
    },

    // Connectivity errors
    /// A peer could not be reached. Retried by the discovery sweep, not by
    /// the caller.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::MalformedPacket(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("decrypt") {
            ProtocolError::Decryption(msg)
        } else if msg.contains("encrypt") {
            ProtocolError::Encryption(msg)
        } else {
            ProtocolError::HandshakeFailed(msg)
        }
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionRefused | ErrorKind::HostUnreachable => {
                ProtocolError::PeerUnreachable(err.to_string())
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::ConnectionClosed(err.to_string()),
        }
    }
}
