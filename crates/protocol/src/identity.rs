//! Cryptographic device identity and fingerprints.
//!
//! Each device owns a long-lived Ed25519 keypair generated once and
//! persisted. The device id is derived from the Ed25519 public key; the
//! certificate fingerprint is derived from the X25519 static key the
//! device presents during the Noise handshake. Both derivations are
//! deterministic, so a restored keypair always yields the same id and
//! fingerprint.
//!
//! Ed25519/X25519 keys at this size meet or exceed the identity strength
//! of the 2048-bit RSA certificates used by comparable protocols.

use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::{ProtocolError, Result};

/// Length of a device id in bytes (SHA-256 of the public key, truncated).
pub const DEVICE_ID_LENGTH: usize = 16;

/// Length of a fingerprint in bytes (full SHA-256).
pub const FINGERPRINT_LENGTH: usize = 32;

/// A stable device identifier derived from the Ed25519 public key.
///
/// Serialized as a lowercase hex string so it can live directly in packet
/// bodies and JSON state files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub [u8; DEVICE_ID_LENGTH]);

impl DeviceId {
    /// Creates a DeviceId from raw bytes.
    pub fn from_bytes(bytes: [u8; DEVICE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this device id.
    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LENGTH] {
        &self.0
    }

    /// Parses a device id from its hex string form.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ProtocolError::MalformedPacket(format!("invalid device id: {e}")))?;
        let arr: [u8; DEVICE_ID_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::MalformedPacket(format!("invalid device id length in {s:?}"))
        })?;
        Ok(Self(arr))
    }

    fn from_public_key(public_key: &VerifyingKey) -> Self {
        let hash = Sha256::digest(public_key.as_bytes());
        let mut id = [0u8; DEVICE_ID_LENGTH];
        id.copy_from_slice(&hash[..DEVICE_ID_LENGTH]);
        Self(id)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DeviceId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A certificate fingerprint: SHA-256 of the X25519 static public key a
/// device presents during the transport handshake.
///
/// Trust pinning compares fingerprints for exact equality and nothing
/// else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LENGTH]);

impl Fingerprint {
    /// Computes the fingerprint of a static public key.
    pub fn of_static_key(public_key: &[u8; 32]) -> Self {
        let hash = Sha256::digest(public_key);
        let mut out = [0u8; FINGERPRINT_LENGTH];
        out.copy_from_slice(&hash);
        Self(out)
    }

    /// Returns the raw bytes of this fingerprint.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LENGTH] {
        &self.0
    }

    /// Parses a fingerprint from its colon-grouped hex form.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_str: String = s.chars().filter(|c| *c != ':').collect();
        let bytes = hex::decode(&hex_str)
            .map_err(|e| ProtocolError::InvalidPublicKey(format!("invalid fingerprint: {e}")))?;
        let arr: [u8; FINGERPRINT_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!("invalid fingerprint length in {s:?}"))
        })?;
        Ok(Self(arr))
    }

    /// Renders the fingerprint as groups of 4 hex characters separated by
    /// colons, the form shown to users during pairing.
    pub fn to_display_string(&self) -> String {
        self.0
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_display_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The local device's long-lived identity: keypair, device id, and the
/// derived Noise static key.
///
/// Contains secret key material; keep it out of logs and serialized state
/// except through [`DeviceIdentity::seed_bytes`].
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    device_id: DeviceId,
    noise_secret: [u8; 32],
    noise_public: [u8; 32],
}

impl DeviceIdentity {
    /// Generates a new random device identity using the operating
    /// system's CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Restores a device identity from its persisted 32-byte seed.
    ///
    /// Deterministic: the same seed always yields the same device id and
    /// fingerprint.
    pub fn from_seed_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let device_id = DeviceId::from_public_key(&signing_key.verifying_key());
        let noise_secret = derive_noise_secret(&signing_key.to_bytes());
        let noise_public =
            X25519Public::from(&StaticSecret::from(noise_secret)).to_bytes();
        Self {
            signing_key,
            device_id,
            noise_secret,
            noise_public,
        }
    }

    /// Returns the 32-byte seed for secure storage.
    pub fn seed_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the device id.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Returns the X25519 static secret used for the Noise handshake.
    pub(crate) fn noise_static_secret(&self) -> &[u8; 32] {
        &self.noise_secret
    }

    /// Returns the X25519 static public key presented to peers.
    pub fn noise_static_public(&self) -> &[u8; 32] {
        &self.noise_public
    }

    /// Returns the fingerprint of this device's certificate, i.e. of the
    /// static key it presents during the handshake.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_static_key(&self.noise_public)
    }
}

/// Derives the X25519 static secret from the Ed25519 seed by hashing and
/// clamping. The derivation is fixed for the life of the identity.
fn derive_noise_secret(seed: &[u8; 32]) -> [u8; 32] {
    let hash = Sha256::digest(seed);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hash);
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.fingerprint().to_display_string())
            .field("seed", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_produces_unique_identities() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        assert_ne!(a.seed_bytes(), b.seed_bytes());
        assert_ne!(a.device_id(), b.device_id());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_seed_roundtrip_is_deterministic() {
        let original = DeviceIdentity::generate();
        let restored = DeviceIdentity::from_seed_bytes(&original.seed_bytes());
        assert_eq!(original.device_id(), restored.device_id());
        assert_eq!(original.fingerprint(), restored.fingerprint());
        assert_eq!(
            original.noise_static_public(),
            restored.noise_static_public()
        );
    }

    #[test]
    fn test_two_restores_agree() {
        let identity = DeviceIdentity::generate();
        let seed = identity.seed_bytes();
        let r1 = DeviceIdentity::from_seed_bytes(&seed);
        let r2 = DeviceIdentity::from_seed_bytes(&seed);
        assert_eq!(r1.fingerprint(), r2.fingerprint());
        assert_eq!(r1.device_id(), r2.device_id());
    }

    #[test]
    fn test_device_id_hex_roundtrip() {
        let identity = DeviceIdentity::generate();
        let id = identity.device_id();
        let parsed = DeviceId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_device_id_parse_rejects_bad_input() {
        assert!(DeviceId::parse("zz").is_err());
        assert!(DeviceId::parse("abcd").is_err()); // wrong length
    }

    #[test]
    fn test_device_id_serde_as_hex_string() {
        let id = DeviceId::from_bytes([0xab; DEVICE_ID_LENGTH]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(DEVICE_ID_LENGTH)));
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_fingerprint_display_format() {
        let identity = DeviceIdentity::generate();
        let display = identity.fingerprint().to_display_string();

        // 16 groups of 4 hex chars joined by 15 colons.
        assert_eq!(display.len(), 16 * 4 + 15);
        assert_eq!(display.matches(':').count(), 15);
        for group in display.split(':') {
            assert_eq!(group.len(), 4);
            assert!(group.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_fingerprint_parse_roundtrip() {
        let fp = DeviceIdentity::generate().fingerprint();
        let parsed = Fingerprint::parse(&fp.to_display_string()).unwrap();
        assert_eq!(parsed, fp);
    }

    #[test]
    fn test_fingerprint_exact_match_only() {
        let fp = Fingerprint::of_static_key(&[1u8; 32]);
        let mut other_key = [1u8; 32];
        other_key[31] ^= 1;
        let other = Fingerprint::of_static_key(&other_key);
        assert_ne!(fp, other);
    }

    #[test]
    fn test_fingerprint_matches_static_public() {
        let identity = DeviceIdentity::generate();
        assert_eq!(
            identity.fingerprint(),
            Fingerprint::of_static_key(identity.noise_static_public())
        );
    }

    #[test]
    fn test_fingerprint_serde() {
        let fp = DeviceIdentity::generate().fingerprint();
        let json = serde_json::to_string(&fp).unwrap();
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn test_debug_redacts_seed() {
        let identity = DeviceIdentity::generate();
        let debug = format!("{:?}", identity);
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("device_id"));
        let seed_hex = hex::encode(identity.seed_bytes());
        assert!(!debug.contains(&seed_hex));
    }
}
