//! Persistent trust storage: the local identity key and pinned peers.
//!
//! This module provides a thread-safe store for peers the user has paired
//! with. A peer entry is created only on explicit pairing acceptance and
//! pins the fingerprint of the Noise static key the peer presented at that
//! moment. The store persists to JSON at `<data_dir>/trust.json`; the
//! local identity seed lives next to it in `<data_dir>/identity.key`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use anyhow::{Context, Result};
use protocol::{DeviceId, DeviceIdentity, Fingerprint, ProtocolError};
use serde::{Deserialize, Serialize};

/// Pairing state of a peer as seen by the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    /// No pairing relationship.
    #[default]
    Unpaired,
    /// We sent a pairing request and are waiting for the peer's answer.
    RequestSentLocal,
    /// The peer sent a pairing request and is waiting for our answer.
    RequestReceivedRemote,
    /// Pairing accepted on both sides; fingerprint pinned.
    Paired,
    /// The last pairing attempt was rejected.
    Rejected,
}

impl PairingState {
    /// Returns whether this state survives a restart. Transient request
    /// states collapse back to `Unpaired` on load.
    fn is_durable(self) -> bool {
        matches!(self, PairingState::Paired)
    }
}

/// A pinned peer entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// The peer's stable device id.
    pub device_id: DeviceId,
    /// Display name the peer announced when it was pinned.
    pub name: String,
    /// Fingerprint of the Noise static key pinned at pairing time.
    pub fingerprint: Fingerprint,
    /// Pairing state. Only `Paired` entries are persisted.
    pub state: PairingState,
    /// When the peer was first pinned.
    pub paired_at: SystemTime,
    /// When the peer was last seen on the network.
    pub last_seen: SystemTime,
}

impl TrustedPeer {
    /// Creates a pinned entry in the `Paired` state.
    pub fn new(device_id: DeviceId, name: String, fingerprint: Fingerprint) -> Self {
        let now = SystemTime::now();
        Self {
            device_id,
            name,
            fingerprint,
            state: PairingState::Paired,
            paired_at: now,
            last_seen: now,
        }
    }
}

/// Wrapper for serializing the trust store.
#[derive(Debug, Serialize, Deserialize)]
struct TrustStoreData {
    /// Version of the store format (for future migrations).
    version: u32,
    /// The pinned peers.
    peers: Vec<TrustedPeer>,
}

impl Default for TrustStoreData {
    fn default() -> Self {
        Self {
            version: 1,
            peers: Vec::new(),
        }
    }
}

/// Thread-safe store of pinned peers.
///
/// Uses a `RwLock<HashMap>` for concurrent access and persists to JSON
/// with an atomic write on every mutation.
pub struct TrustStore {
    /// The path to the JSON file.
    path: PathBuf,
    /// Pinned peers, keyed by device id.
    peers: RwLock<HashMap<DeviceId, TrustedPeer>>,
}

impl TrustStore {
    /// Creates a trust store that will persist to the given path.
    ///
    /// This does not load the file; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a trust store at the conventional location inside a data
    /// directory.
    pub fn in_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self::new(data_dir.as_ref().join("trust.json"))
    }

    /// Returns the path to the trust store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the trust store from the JSON file.
    ///
    /// If the file does not exist, the store will be empty. Entries in a
    /// transient state are normalized back to absent.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!("Trust store not found at {:?}, starting empty", self.path);
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read trust store: {}", self.path.display()))?;

        let data: TrustStoreData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse trust store: {}", self.path.display()))?;

        let mut peers = self
            .peers
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on trust store"))?;

        peers.clear();
        for peer in data.peers {
            if peer.state.is_durable() {
                peers.insert(peer.device_id, peer);
            }
        }

        tracing::info!("Loaded {} pinned peers from {:?}", peers.len(), self.path);
        Ok(())
    }

    /// Saves the trust store to the JSON file.
    ///
    /// Uses atomic write (write to temp file, then rename) to prevent
    /// corruption. Creates parent directories if they don't exist.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create trust store directory: {}",
                    parent.display()
                )
            })?;
        }

        let peers = self
            .peers
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on trust store"))?;

        let data = TrustStoreData {
            version: 1,
            peers: peers
                .values()
                .filter(|p| p.state.is_durable())
                .cloned()
                .collect(),
        };

        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize trust store")?;

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp trust store: {}", temp_path.display())
        })?;

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp trust store {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("Saved {} pinned peers to {:?}", data.peers.len(), self.path);
        Ok(())
    }

    /// Pins a peer's fingerprint, marking it `Paired`, and persists.
    ///
    /// Called only from pairing acceptance paths. If the peer was already
    /// pinned, the entry is replaced with the new fingerprint.
    pub fn pin(&self, device_id: DeviceId, name: String, fingerprint: Fingerprint) -> Result<()> {
        {
            let mut peers = self
                .peers
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on trust store"))?;

            tracing::info!(
                "Pinning peer {} ({}) with fingerprint {}",
                device_id,
                name,
                fingerprint.to_display_string()
            );

            peers.insert(device_id, TrustedPeer::new(device_id, name, fingerprint));
        }
        self.save()
    }

    /// Removes a peer's pin and pairing state, and persists.
    ///
    /// Returns the removed entry if it existed.
    pub fn unpin(&self, device_id: &DeviceId) -> Result<Option<TrustedPeer>> {
        let removed = {
            let mut peers = self
                .peers
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on trust store"))?;
            peers.remove(device_id)
        };

        if let Some(ref peer) = removed {
            tracing::info!("Unpinned peer {} ({})", peer.device_id, peer.name);
            self.save()?;
        }
        Ok(removed)
    }

    /// Returns whether the peer is paired.
    pub fn is_paired(&self, device_id: &DeviceId) -> Result<bool> {
        let peers = self
            .peers
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on trust store"))?;

        Ok(peers
            .get(device_id)
            .map(|p| p.state == PairingState::Paired)
            .unwrap_or(false))
    }

    /// Returns the pinned fingerprint for a peer, if any.
    pub fn pinned_fingerprint(&self, device_id: &DeviceId) -> Result<Option<Fingerprint>> {
        let peers = self
            .peers
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on trust store"))?;

        Ok(peers.get(device_id).map(|p| p.fingerprint))
    }

    /// Verifies a presented fingerprint against the pin for a peer.
    ///
    /// Returns `UntrustedPeer` if the peer is not pinned or the
    /// fingerprint differs from the pin. The pin is never updated here.
    pub fn verify(
        &self,
        device_id: &DeviceId,
        presented: &Fingerprint,
    ) -> Result<(), ProtocolError> {
        let pinned = self.pinned_fingerprint(device_id).map_err(|_| {
            ProtocolError::UntrustedPeer {
                peer_id: device_id.to_string(),
                presented: presented.to_display_string(),
            }
        })?;

        match pinned {
            Some(pin) if pin == *presented => Ok(()),
            _ => Err(ProtocolError::UntrustedPeer {
                peer_id: device_id.to_string(),
                presented: presented.to_display_string(),
            }),
        }
    }

    /// Gets a pinned peer entry by device id.
    pub fn get(&self, device_id: &DeviceId) -> Result<Option<TrustedPeer>> {
        let peers = self
            .peers
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on trust store"))?;

        Ok(peers.get(device_id).cloned())
    }

    /// Updates the last seen timestamp for a pinned peer.
    ///
    /// A no-op if the peer is not pinned. Does not persist; last-seen is
    /// bookkeeping, flushed on the next durable mutation.
    pub fn touch(&self, device_id: &DeviceId) -> Result<()> {
        let mut peers = self
            .peers
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on trust store"))?;

        if let Some(peer) = peers.get_mut(device_id) {
            peer.last_seen = SystemTime::now();
        }
        Ok(())
    }

    /// Lists all pinned peers.
    pub fn list(&self) -> Result<Vec<TrustedPeer>> {
        let peers = self
            .peers
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on trust store"))?;

        Ok(peers.values().cloned().collect())
    }

    /// Returns the number of pinned peers.
    pub fn len(&self) -> Result<usize> {
        let peers = self
            .peers
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on trust store"))?;
        Ok(peers.len())
    }

    /// Returns true if no peers are pinned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// =============================================================================
// Local identity key file
// =============================================================================

/// File name of the identity seed inside the data directory.
const IDENTITY_FILE: &str = "identity.key";

/// Loads the local identity from `<data_dir>/identity.key`, generating
/// and persisting a fresh one if the file does not exist.
///
/// Idempotent: repeated calls return the same identity.
pub fn load_or_create_identity<P: AsRef<Path>>(data_dir: P) -> Result<DeviceIdentity> {
    let path = data_dir.as_ref().join(IDENTITY_FILE);

    if path.exists() {
        let bytes = fs::read(&path)
            .with_context(|| format!("Failed to read identity key: {}", path.display()))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Identity key {} has invalid length: expected 32, got {}",
                path.display(),
                bytes.len()
            )
        })?;
        let identity = DeviceIdentity::from_seed_bytes(&seed);
        tracing::debug!("Loaded identity {} from {:?}", identity.device_id(), path);
        return Ok(identity);
    }

    let identity = DeviceIdentity::generate();
    write_identity(&path, &identity)?;
    tracing::info!(
        "Generated new identity {} at {:?}",
        identity.device_id(),
        path
    );
    Ok(identity)
}

/// Generates a fresh identity, overwriting any existing key file.
///
/// Existing pins held by peers for the old identity become stale; callers
/// should expect re-pairing.
pub fn regenerate_identity<P: AsRef<Path>>(data_dir: P) -> Result<DeviceIdentity> {
    let path = data_dir.as_ref().join(IDENTITY_FILE);
    let identity = DeviceIdentity::generate();
    write_identity(&path, &identity)?;
    tracing::warn!(
        "Regenerated identity at {:?}; peers must re-pair",
        path
    );
    Ok(identity)
}

fn write_identity(path: &Path, identity: &DeviceIdentity) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create identity directory: {}", parent.display())
        })?;
    }

    // Same atomic pattern as the trust store; the seed must never be
    // observable half-written.
    let temp_path = path.with_extension("key.tmp");
    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create identity key: {}", temp_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .with_context(|| {
                    format!("Failed to set identity key permissions: {}", temp_path.display())
                })?;
        }
        file.write_all(&identity.seed_bytes())
            .with_context(|| format!("Failed to write identity key: {}", temp_path.display()))?;
    }
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename temp identity key {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_peer(name: &str) -> TrustedPeer {
        let identity = DeviceIdentity::generate();
        TrustedPeer::new(identity.device_id(), name.to_string(), identity.fingerprint())
    }

    fn test_store(temp_dir: &TempDir) -> TrustStore {
        TrustStore::new(temp_dir.path().join("trust.json"))
    }

    #[test]
    fn test_pairing_state_default() {
        assert_eq!(PairingState::default(), PairingState::Unpaired);
    }

    #[test]
    fn test_pairing_state_serialization() {
        let json = serde_json::to_string(&PairingState::Paired).unwrap();
        assert_eq!(json, "\"paired\"");
        let json = serde_json::to_string(&PairingState::RequestSentLocal).unwrap();
        assert_eq!(json, "\"request_sent_local\"");
    }

    #[test]
    fn test_new_store_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_pin_marks_paired() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let peer = test_peer("Phone");

        store
            .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
            .unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert!(store.is_paired(&peer.device_id).unwrap());
        assert_eq!(
            store.pinned_fingerprint(&peer.device_id).unwrap(),
            Some(peer.fingerprint)
        );
    }

    #[test]
    fn test_unknown_peer_not_paired() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let identity = DeviceIdentity::generate();

        assert!(!store.is_paired(&identity.device_id()).unwrap());
        assert!(store
            .pinned_fingerprint(&identity.device_id())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unpin_removes_pin_and_state() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let peer = test_peer("Phone");

        store
            .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
            .unwrap();
        let removed = store.unpin(&peer.device_id).unwrap();

        assert!(removed.is_some());
        assert!(!store.is_paired(&peer.device_id).unwrap());
        assert!(store
            .pinned_fingerprint(&peer.device_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unpin_nonexistent_peer() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let identity = DeviceIdentity::generate();

        assert!(store.unpin(&identity.device_id()).unwrap().is_none());
    }

    #[test]
    fn test_verify_matching_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let peer = test_peer("Phone");

        store
            .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
            .unwrap();

        assert!(store.verify(&peer.device_id, &peer.fingerprint).is_ok());
    }

    #[test]
    fn test_verify_mismatched_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let peer = test_peer("Phone");
        let imposter = DeviceIdentity::generate();

        store
            .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
            .unwrap();

        let result = store.verify(&peer.device_id, &imposter.fingerprint());
        assert!(matches!(result, Err(ProtocolError::UntrustedPeer { .. })));

        // A mismatch never updates the pin.
        assert_eq!(
            store.pinned_fingerprint(&peer.device_id).unwrap(),
            Some(peer.fingerprint)
        );
    }

    #[test]
    fn test_verify_unpinned_peer() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let identity = DeviceIdentity::generate();

        let result = store.verify(&identity.device_id(), &identity.fingerprint());
        assert!(matches!(result, Err(ProtocolError::UntrustedPeer { .. })));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trust.json");

        let store1 = TrustStore::new(&path);
        let peer1 = test_peer("Phone");
        let peer2 = test_peer("Laptop");
        store1
            .pin(peer1.device_id, peer1.name.clone(), peer1.fingerprint)
            .unwrap();
        store1
            .pin(peer2.device_id, peer2.name.clone(), peer2.fingerprint)
            .unwrap();

        let store2 = TrustStore::new(&path);
        store2.load().unwrap();

        assert_eq!(store2.len().unwrap(), 2);
        assert!(store2.is_paired(&peer1.device_id).unwrap());
        assert_eq!(
            store2.pinned_fingerprint(&peer2.device_id).unwrap(),
            Some(peer2.fingerprint)
        );
    }

    #[test]
    fn test_load_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);

        store.load().unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trust.json");
        let temp_path = path.with_extension("json.tmp");

        let store = TrustStore::new(&path);
        let peer = test_peer("Phone");
        store
            .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
            .unwrap();

        assert!(!temp_path.exists());
        assert!(path.exists());
    }

    #[test]
    fn test_unpin_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trust.json");

        let store = TrustStore::new(&path);
        let peer = test_peer("Phone");
        store
            .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
            .unwrap();
        store.unpin(&peer.device_id).unwrap();

        let store2 = TrustStore::new(&path);
        store2.load().unwrap();
        assert!(store2.is_empty().unwrap());
    }

    #[test]
    fn test_repin_replaces_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let peer = test_peer("Phone");
        let new_identity = DeviceIdentity::generate();

        store
            .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
            .unwrap();
        store
            .pin(
                peer.device_id,
                peer.name.clone(),
                new_identity.fingerprint(),
            )
            .unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(
            store.pinned_fingerprint(&peer.device_id).unwrap(),
            Some(new_identity.fingerprint())
        );
    }

    #[test]
    fn test_touch_updates_last_seen() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let peer = test_peer("Phone");

        store
            .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
            .unwrap();
        let before = store.get(&peer.device_id).unwrap().unwrap().last_seen;

        std::thread::sleep(std::time::Duration::from_millis(10));
        store.touch(&peer.device_id).unwrap();

        let after = store.get(&peer.device_id).unwrap().unwrap().last_seen;
        assert!(after > before);
    }

    #[test]
    fn test_store_data_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trust.json");

        let store = TrustStore::new(&path);
        let peer = test_peer("Phone");
        store
            .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let data: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(data["version"], 1);
    }

    #[test]
    fn test_concurrent_read_access() {
        use std::sync::Arc;
        use std::thread;

        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(test_store(&temp_dir));

        for i in 0..10 {
            let peer = test_peer(&format!("Device {}", i));
            store
                .pin(peer.device_id, peer.name.clone(), peer.fingerprint)
                .unwrap();
        }

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(store.len().unwrap(), 10);
                        let _ = store.list().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_load_or_create_identity_idempotent() {
        let temp_dir = TempDir::new().unwrap();

        let first = load_or_create_identity(temp_dir.path()).unwrap();
        let second = load_or_create_identity(temp_dir.path()).unwrap();

        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_load_or_create_identity_writes_seed_file() {
        let temp_dir = TempDir::new().unwrap();

        load_or_create_identity(temp_dir.path()).unwrap();

        let path = temp_dir.path().join("identity.key");
        assert!(path.exists());
        assert_eq!(fs::read(&path).unwrap().len(), 32);
    }

    #[test]
    fn test_regenerate_identity_changes_keys() {
        let temp_dir = TempDir::new().unwrap();

        let first = load_or_create_identity(temp_dir.path()).unwrap();
        let second = regenerate_identity(temp_dir.path()).unwrap();

        assert_ne!(first.device_id(), second.device_id());
        assert_ne!(first.fingerprint(), second.fingerprint());

        // The new identity is what subsequent loads return.
        let third = load_or_create_identity(temp_dir.path()).unwrap();
        assert_eq!(second.device_id(), third.device_id());
    }

    #[test]
    fn test_identity_file_invalid_length() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.key");
        fs::write(&path, [0u8; 16]).unwrap();

        let result = load_or_create_identity(temp_dir.path());
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        load_or_create_identity(temp_dir.path()).unwrap();

        let path = temp_dir.path().join("identity.key");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
