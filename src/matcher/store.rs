//! Durable store backing the matcher. The engine records a marker *after*
//! every side effect it performs and consults the marker before re-acting, so
//! replayed events and restarts degrade into no-ops. [`Store`] is the raw
//! byte-level interface, [`MarkerStore`] the typed keyspace on top of it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::OfferIdHash;
use crate::ledger::{Address, ContractId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("Store codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Store value is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    /// A writer panicked while holding the store lock.
    #[error("Store lock poisoned")]
    Poisoned,
}

/// A flat key-value store. `put` must not return before the write is durable;
/// the engine's crash-safety argument rests on that ordering.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// In-memory store for tests and throwaway matchers. Durability here means
/// surviving until the process exits.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// File-backed store. The whole map is rewritten on every `put` through a
/// temporary file and an atomic rename, so a crash leaves either the old or
/// the new snapshot, never a torn one. Values are hex-encoded in the
/// snapshot to keep it a valid JSON document.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileStore {
    /// Open the store at `path`, loading the previous snapshot if one exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => {
                let encoded: BTreeMap<String, String> = serde_json::from_slice(&bytes)?;
                let mut decoded = BTreeMap::new();
                for (key, value) in encoded {
                    decoded.insert(key, hex::decode(value)?);
                }
                decoded
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(FileStore {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let encoded: BTreeMap<&String, String> =
            entries.iter().map(|(k, v)| (k, hex::encode(v))).collect();
        let bytes = serde_json::to_vec(&encoded)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_vec());
        self.persist(&entries)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// A secret handed over by a buyer, persisted before the matcher acts on it.
/// On restart every pending password is replayed, so a crash between "secret
/// accepted" and "offer finalized" never loses the buyer's swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPassword {
    pub password: String,
    /// The buyer the secret belongs to.
    pub from: Address,
}

const OFFER_KEY: &str = "OFFER_NEW_";
const ACCEPTED_KEY: &str = "ACCEPTED_OFFER_";
const FINALIZED_ESCROW_KEY: &str = "FINALIZED_ESCROW_";
const FINALIZED_OFFER_KEY: &str = "FINALIZED_OFFER_";
const PASSWORD_KEY: &str = "PASSWORD_";
const CHECKPOINT_KEY: &str = "LAST_ESCROW_BLOCK";

/// Typed view of the matcher's keyspace. Tracked offers are indexed twice:
/// by plaintext id and by their id hash, the latter to correlate
/// escrow-creation events that only carry the commitment.
///
/// One matcher process owns the store at a time; writes are durable but not
/// transactional across processes.
pub struct MarkerStore<S> {
    inner: S,
}

impl<S: Store> MarkerStore<S> {
    pub fn new(inner: S) -> Self {
        MarkerStore { inner }
    }

    /// Start tracking an offer, keyed under its id hash.
    pub fn track_offer(&self, offer_id: &ContractId) -> Result<(), StoreError> {
        let key = format!("{}{:#x}", OFFER_KEY, OfferIdHash::commit(offer_id));
        self.inner.put(&key, offer_id.as_str().as_bytes())
    }

    /// Resolve an escrow event's id hash back to the plaintext offer id, if
    /// the offer is tracked.
    pub fn offer_by_hash(&self, hash: &OfferIdHash) -> Result<Option<ContractId>, StoreError> {
        let key = format!("{}{:#x}", OFFER_KEY, hash);
        match self.inner.get(&key)? {
            Some(bytes) => Ok(String::from_utf8_lossy(&bytes).parse().ok()),
            None => Ok(None),
        }
    }

    /// Whether this offer is already tracked.
    pub fn offer_tracked(&self, offer_id: &ContractId) -> Result<bool, StoreError> {
        Ok(self
            .offer_by_hash(&OfferIdHash::commit(offer_id))?
            .is_some())
    }

    /// All tracked offers, in key order.
    pub fn tracked_offers(&self) -> Result<Vec<ContractId>, StoreError> {
        let mut offers = Vec::new();
        for (_, bytes) in self.inner.scan_prefix(OFFER_KEY)? {
            let s = String::from_utf8_lossy(&bytes).into_owned();
            if let Ok(id) = s.parse() {
                offers.push(id);
            }
        }
        Ok(offers)
    }

    /// Record that `offer_id` was accepted against `escrow`. The escrow
    /// address is the value so the claim step survives a restart.
    pub fn mark_accepted(&self, offer_id: &ContractId, escrow: &Address) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(escrow)?;
        self.inner
            .put(&format!("{}{}", ACCEPTED_KEY, offer_id), &bytes)
    }

    /// The escrow this offer was accepted against, if any.
    pub fn accepted_escrow(&self, offer_id: &ContractId) -> Result<Option<Address>, StoreError> {
        match self.inner.get(&format!("{}{}", ACCEPTED_KEY, offer_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn is_accepted(&self, offer_id: &ContractId) -> Result<bool, StoreError> {
        Ok(self.accepted_escrow(offer_id)?.is_some())
    }

    pub fn mark_escrow_finalized(&self, escrow: &Address) -> Result<(), StoreError> {
        self.inner
            .put(&format!("{}{:#x}", FINALIZED_ESCROW_KEY, escrow), b"1")
    }

    pub fn is_escrow_finalized(&self, escrow: &Address) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .get(&format!("{}{:#x}", FINALIZED_ESCROW_KEY, escrow))?
            .is_some())
    }

    pub fn mark_offer_finalized(&self, offer_id: &ContractId) -> Result<(), StoreError> {
        self.inner
            .put(&format!("{}{}", FINALIZED_OFFER_KEY, offer_id), b"1")
    }

    pub fn is_offer_finalized(&self, offer_id: &ContractId) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .get(&format!("{}{}", FINALIZED_OFFER_KEY, offer_id))?
            .is_some())
    }

    /// Persist a buyer's secret. Written before any use of the secret.
    pub fn save_password(
        &self,
        offer_id: &ContractId,
        pending: &PendingPassword,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(pending)?;
        self.inner
            .put(&format!("{}{}", PASSWORD_KEY, offer_id), &bytes)
    }

    pub fn password(&self, offer_id: &ContractId) -> Result<Option<PendingPassword>, StoreError> {
        match self.inner.get(&format!("{}{}", PASSWORD_KEY, offer_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All persisted secrets, replayed on startup.
    pub fn pending_passwords(&self) -> Result<Vec<(ContractId, PendingPassword)>, StoreError> {
        let mut pending = Vec::new();
        for (key, bytes) in self.inner.scan_prefix(PASSWORD_KEY)? {
            let id = match key[PASSWORD_KEY.len()..].parse() {
                Ok(id) => id,
                Err(_) => continue,
            };
            pending.push((id, serde_json::from_slice(&bytes)?));
        }
        Ok(pending)
    }

    /// First payment-ledger block height not yet scanned for escrow events.
    pub fn scan_checkpoint(&self) -> Result<Option<u64>, StoreError> {
        match self.inner.get(CHECKPOINT_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Advance the checkpoint. Only called after every event of the scanned
    /// range `[old, next)` was processed.
    pub fn set_scan_checkpoint(&self, next: u64) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&next)?;
        self.inner.put(CHECKPOINT_KEY, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_id(c: char) -> ContractId {
        c.to_string().repeat(43).parse().unwrap()
    }

    #[test]
    fn markers_round_trip() {
        let store = MarkerStore::new(MemoryStore::new());
        let id = offer_id('a');

        assert!(!store.offer_tracked(&id).unwrap());
        store.track_offer(&id).unwrap();
        assert!(store.offer_tracked(&id).unwrap());
        assert_eq!(
            store.offer_by_hash(&OfferIdHash::commit(&id)).unwrap(),
            Some(id.clone())
        );

        assert!(!store.is_accepted(&id).unwrap());
        let escrow = Address::from_low_u64_be(42);
        store.mark_accepted(&id, &escrow).unwrap();
        assert!(store.is_accepted(&id).unwrap());
        assert_eq!(store.accepted_escrow(&id).unwrap(), Some(escrow));
    }

    #[test]
    fn pending_passwords_enumerate() {
        let store = MarkerStore::new(MemoryStore::new());
        let a = offer_id('a');
        let b = offer_id('b');
        let pending = PendingPassword {
            password: "s3cret".into(),
            from: Address::from_low_u64_be(7),
        };
        store.save_password(&a, &pending).unwrap();
        store
            .save_password(
                &b,
                &PendingPassword {
                    password: "other".into(),
                    from: Address::from_low_u64_be(8),
                },
            )
            .unwrap();

        let all = store.pending_passwords().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.password(&a).unwrap(), Some(pending));
    }

    #[test]
    fn checkpoint_round_trip() {
        let store = MarkerStore::new(MemoryStore::new());
        assert_eq!(store.scan_checkpoint().unwrap(), None);
        store.set_scan_checkpoint(17_000_500).unwrap();
        assert_eq!(store.scan_checkpoint().unwrap(), Some(17_000_500));
    }

    #[test]
    fn file_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "teleport-store-{}.json",
            uuid::Uuid::new_v4()
        ));
        {
            let store = FileStore::open(&path).unwrap();
            store.put("LAST_ESCROW_BLOCK", b"42").unwrap();
            store.put("PASSWORD_x", b"{\"k\":1}").unwrap();
            store.delete("PASSWORD_x").unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("LAST_ESCROW_BLOCK").unwrap(), Some(b"42".to_vec()));
        assert_eq!(store.get("PASSWORD_x").unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn scan_prefix_is_bounded() {
        let store = MemoryStore::new();
        store.put("A_1", b"x").unwrap();
        store.put("B_1", b"y").unwrap();
        store.put("B_2", b"z").unwrap();
        store.put("C_1", b"w").unwrap();
        let hits = store.scan_prefix("B_").unwrap();
        assert_eq!(
            hits.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["B_1", "B_2"]
        );
    }
}
