//! # Tether Engine Library
//!
//! This crate provides the connection engine for Tether, pairing nearby
//! devices and exchanging capability packets over encrypted links.
//!
//! ## Overview
//!
//! The engine is the long-running component an application embeds. It
//! provides:
//!
//! - **Discovery**: UDP identity broadcasts and a registry of nearby devices
//! - **Trust**: fingerprint pinning on first pairing, verified on every link
//! - **Pairing**: the mutual consent state machine between two devices
//! - **Dispatch**: capability-based packet routing to registered handlers
//! - **Transfers**: chunked payload channels alongside the control link
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Engine                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  Discovery   │  │   Pairing    │  │     Trust Store      │   │
//! │  │   Service    │  │   Manager    │  │  (pinned peers)      │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                  Capability Registry                      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                                                                 │
//! │  ┌───────────────────┐  ┌──────────────────────────────────┐    │
//! │  │   Peer Links      │  │     Payload Transfers            │    │
//! │  │ (Noise over TCP)  │  │  (chunked side channels)         │    │
//! │  └───────────────────┘  └──────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use engine::{Config, Engine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut engine = Engine::new(config)?;
//!     engine.start().await?;
//!
//!     // The engine is now discovering peers and accepting links.
//!     // Wait for shutdown signal...
//!
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`trust`]: Identity key storage and fingerprint pinning
//! - [`discovery`]: UDP broadcast discovery and the device registry
//! - [`pairing`]: The pairing state machine
//! - [`registry`]: Capability negotiation and packet dispatch
//! - [`link`]: Encrypted per-peer control channels
//! - [`transfer`]: Chunked payload transfer sessions
//! - [`engine`]: Main coordinator

pub mod config;
pub mod discovery;
pub mod engine;
pub mod link;
pub mod pairing;
pub mod registry;
pub mod transfer;
pub mod trust;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export trust types for convenience
pub use trust::{load_or_create_identity, PairingState, TrustStore, TrustedPeer};

// Re-export discovery types for convenience
pub use discovery::{DeviceInfo, DiscoveryEvent, DiscoveryService};

// Re-export pairing types for convenience
pub use pairing::{PairDisposition, PairingError, PairingEvent, PairingManager};

// Re-export registry types for convenience
pub use registry::{
    CapabilityRegistry, CapabilitySet, DispatchOutcome, IdentityAnnouncer, PacketHandler,
    PingHandler,
};

// Re-export link types for convenience
pub use link::{LinkConnection, LinkSender, PeerLink};

// Re-export transfer types for convenience
pub use transfer::{
    PayloadTransferManager, TransferDirection, TransferEvent, TransferHandle, TransferProgress,
    TransferState,
};

// Re-export engine types for convenience
pub use engine::{Engine, EngineEvent, EngineState, SecurityEvent};
