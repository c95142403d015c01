//! # Tether Protocol Library
//!
//! This crate provides the wire protocol and cryptographic primitives for
//! the Tether companion-device system.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of Tether's communication layer,
//! providing:
//!
//! - **Packet Codec**: Newline-delimited JSON packets with ordered bodies
//!   and payload transfer references
//! - **Device Identity**: Ed25519 keys, stable device ids, and static-key
//!   fingerprints for trust pinning
//! - **Noise Protocol**: Mutually authenticated handshake and transport
//!   encryption using Noise XX
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Packets (JSON lines)          │  serde_json, order preserved
//! ├─────────────────────────────────────────┤
//! │           Noise Encryption              │  ChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │        Records ([u16 len] frames)       │
//! ├─────────────────────────────────────────┤
//! │            Transport (TCP)              │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{DeviceIdentity, Packet, PacketCodec};
//!
//! // Generate a device identity
//! let identity = DeviceIdentity::generate();
//! println!("Device ID: {}", identity.device_id());
//! println!("Fingerprint: {}", identity.fingerprint().to_display_string());
//!
//! // Build and encode a packet
//! let packet = Packet::new("tether.ping", serde_json::Map::new());
//! let codec = PacketCodec::new();
//! let bytes = codec.encode(&packet).unwrap();
//! let decoded = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded.packet_type, "tether.ping");
//! ```

pub mod error;
pub mod identity;
pub mod noise;
pub mod packet;

pub use error::{ProtocolError, Result};
pub use identity::{DeviceId, DeviceIdentity, Fingerprint};
pub use noise::{HandshakePhase, NoiseSession, Role};
pub use packet::{
    DeviceClass, IdentityBody, Packet, PacketCodec, PairBody, PayloadTransferInfo,
    PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR, PACKET_TYPE_PING, PROTOCOL_VERSION,
};
