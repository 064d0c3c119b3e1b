//! Local record store.
//!
//! Mapping records and escrow wallets live in separate keyspaces, both keyed
//! by UPI id. The cache is advisory: controllers consult it before remote
//! calls and reconciliation overwrites it with registry state.

use parking_lot::RwLock;
use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::Path;
use upi_types::{Address, MappingRecord, UpiId};

use crate::keys::EscrowWallet;

/// Cache errors
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Abstract cache trait
pub trait LocalCache: Send + Sync {
    fn get_mapping(&self, upi_id: &UpiId) -> CacheResult<Option<MappingRecord>>;
    fn put_mapping(&self, record: &MappingRecord) -> CacheResult<()>;
    fn remove_mapping(&self, upi_id: &UpiId) -> CacheResult<Option<MappingRecord>>;
    fn mappings_of(&self, owner: &Address) -> CacheResult<Vec<MappingRecord>>;
    fn all_mappings(&self) -> CacheResult<Vec<MappingRecord>>;

    /// Drop every record owned by `owner` and write `records` in one step.
    fn replace_mappings_of(&self, owner: &Address, records: &[MappingRecord]) -> CacheResult<()>;

    fn get_wallet(&self, upi_id: &UpiId) -> CacheResult<Option<EscrowWallet>>;
    fn put_wallet(&self, upi_id: &UpiId, wallet: &EscrowWallet) -> CacheResult<()>;
    fn remove_wallet(&self, upi_id: &UpiId) -> CacheResult<Option<EscrowWallet>>;
    /// Every stored wallet with the id it is filed under.
    fn wallets(&self) -> CacheResult<Vec<(UpiId, EscrowWallet)>>;
}

/// Sled-backed implementation
pub struct SledCache {
    db: Db,
    mappings: Tree,
    escrow_wallets: Tree,
}

impl SledCache {
    pub fn open<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let db = sled::open(path)?;
        let mappings = db.open_tree("mappings")?;
        let escrow_wallets = db.open_tree("escrow_wallets")?;
        tracing::debug!(
            mappings = mappings.len(),
            escrow_wallets = escrow_wallets.len(),
            "opened local cache"
        );
        Ok(Self {
            db,
            mappings,
            escrow_wallets,
        })
    }

    pub fn flush(&self) -> CacheResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn decode_all(&self) -> CacheResult<Vec<MappingRecord>> {
        self.mappings
            .iter()
            .values()
            .map(|v| -> CacheResult<MappingRecord> { Ok(serde_json::from_slice(&v?)?) })
            .collect()
    }
}

impl LocalCache for SledCache {
    fn get_mapping(&self, upi_id: &UpiId) -> CacheResult<Option<MappingRecord>> {
        match self.mappings.get(upi_id.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn put_mapping(&self, record: &MappingRecord) -> CacheResult<()> {
        let data = serde_json::to_vec(record)?;
        self.mappings.insert(record.upi_id.as_str(), data)?;
        self.mappings.flush()?;
        Ok(())
    }

    fn remove_mapping(&self, upi_id: &UpiId) -> CacheResult<Option<MappingRecord>> {
        let removed = self.mappings.remove(upi_id.as_str())?;
        self.mappings.flush()?;
        match removed {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn mappings_of(&self, owner: &Address) -> CacheResult<Vec<MappingRecord>> {
        Ok(self
            .decode_all()?
            .into_iter()
            .filter(|r| &r.owner == owner)
            .collect())
    }

    fn all_mappings(&self) -> CacheResult<Vec<MappingRecord>> {
        self.decode_all()
    }

    fn replace_mappings_of(&self, owner: &Address, records: &[MappingRecord]) -> CacheResult<()> {
        let mut batch = sled::Batch::default();
        for stale in self.mappings_of(owner)? {
            batch.remove(stale.upi_id.as_str());
        }
        for record in records {
            batch.insert(record.upi_id.as_str(), serde_json::to_vec(record)?);
        }
        self.mappings.apply_batch(batch)?;
        self.mappings.flush()?;
        Ok(())
    }

    fn get_wallet(&self, upi_id: &UpiId) -> CacheResult<Option<EscrowWallet>> {
        match self.escrow_wallets.get(upi_id.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn put_wallet(&self, upi_id: &UpiId, wallet: &EscrowWallet) -> CacheResult<()> {
        let data = serde_json::to_vec(wallet)?;
        self.escrow_wallets.insert(upi_id.as_str(), data)?;
        self.escrow_wallets.flush()?;
        Ok(())
    }

    fn remove_wallet(&self, upi_id: &UpiId) -> CacheResult<Option<EscrowWallet>> {
        let removed = self.escrow_wallets.remove(upi_id.as_str())?;
        self.escrow_wallets.flush()?;
        match removed {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn wallets(&self) -> CacheResult<Vec<(UpiId, EscrowWallet)>> {
        self.escrow_wallets
            .iter()
            .map(|entry| -> CacheResult<(UpiId, EscrowWallet)> {
                let (key, value) = entry?;
                let raw = String::from_utf8_lossy(&key).into_owned();
                let upi_id = UpiId::parse(raw).map_err(|e| CacheError::InvalidKey(e.to_string()))?;
                Ok((upi_id, serde_json::from_slice(&value)?))
            })
            .collect()
    }
}

/// In-memory implementation
#[derive(Default)]
pub struct MemoryCache {
    mappings: RwLock<BTreeMap<UpiId, MappingRecord>>,
    escrow_wallets: RwLock<BTreeMap<UpiId, EscrowWallet>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for MemoryCache {
    fn get_mapping(&self, upi_id: &UpiId) -> CacheResult<Option<MappingRecord>> {
        Ok(self.mappings.read().get(upi_id).cloned())
    }

    fn put_mapping(&self, record: &MappingRecord) -> CacheResult<()> {
        self.mappings
            .write()
            .insert(record.upi_id.clone(), record.clone());
        Ok(())
    }

    fn remove_mapping(&self, upi_id: &UpiId) -> CacheResult<Option<MappingRecord>> {
        Ok(self.mappings.write().remove(upi_id))
    }

    fn mappings_of(&self, owner: &Address) -> CacheResult<Vec<MappingRecord>> {
        Ok(self
            .mappings
            .read()
            .values()
            .filter(|r| &r.owner == owner)
            .cloned()
            .collect())
    }

    fn all_mappings(&self) -> CacheResult<Vec<MappingRecord>> {
        Ok(self.mappings.read().values().cloned().collect())
    }

    fn replace_mappings_of(&self, owner: &Address, records: &[MappingRecord]) -> CacheResult<()> {
        let mut mappings = self.mappings.write();
        mappings.retain(|_, r| &r.owner != owner);
        for record in records {
            mappings.insert(record.upi_id.clone(), record.clone());
        }
        Ok(())
    }

    fn get_wallet(&self, upi_id: &UpiId) -> CacheResult<Option<EscrowWallet>> {
        Ok(self.escrow_wallets.read().get(upi_id).cloned())
    }

    fn put_wallet(&self, upi_id: &UpiId, wallet: &EscrowWallet) -> CacheResult<()> {
        self.escrow_wallets
            .write()
            .insert(upi_id.clone(), wallet.clone());
        Ok(())
    }

    fn remove_wallet(&self, upi_id: &UpiId) -> CacheResult<Option<EscrowWallet>> {
        Ok(self.escrow_wallets.write().remove(upi_id))
    }

    fn wallets(&self) -> CacheResult<Vec<(UpiId, EscrowWallet)>> {
        Ok(self
            .escrow_wallets
            .read()
            .iter()
            .map(|(id, wallet)| (id.clone(), wallet.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use upi_types::MappingStatus;

    fn record(raw: &str, owner: u8) -> MappingRecord {
        MappingRecord::active(UpiId::parse(raw).unwrap(), Address([owner; 32]))
    }

    fn exercise(cache: &dyn LocalCache) {
        let alice = record("alice@bank", 1);
        let shop = record("shop@bank", 1);
        let bob = record("bob@bank", 2);
        for r in [&alice, &shop, &bob] {
            cache.put_mapping(r).unwrap();
        }
        assert_eq!(cache.get_mapping(&alice.upi_id).unwrap(), Some(alice.clone()));
        assert_eq!(cache.mappings_of(&Address([1; 32])).unwrap().len(), 2);

        let replacement = record("carol@bank", 1).with_status(MappingStatus::Active);
        cache
            .replace_mappings_of(&Address([1; 32]), std::slice::from_ref(&replacement))
            .unwrap();
        let owned = cache.mappings_of(&Address([1; 32])).unwrap();
        assert_eq!(owned, vec![replacement]);
        assert_eq!(cache.get_mapping(&bob.upi_id).unwrap(), Some(bob.clone()));
        assert_eq!(cache.all_mappings().unwrap().len(), 2);

        assert_eq!(cache.remove_mapping(&bob.upi_id).unwrap(), Some(bob));
        assert!(cache.remove_mapping(&alice.upi_id).unwrap().is_none());

        let wallet = EscrowWallet::generate(None).unwrap();
        cache.put_wallet(&alice.upi_id, &wallet).unwrap();
        assert_eq!(cache.get_wallet(&alice.upi_id).unwrap(), Some(wallet.clone()));
        assert_eq!(
            cache.wallets().unwrap(),
            vec![(alice.upi_id.clone(), wallet.clone())]
        );
        assert_eq!(cache.remove_wallet(&alice.upi_id).unwrap(), Some(wallet));
        assert!(cache.wallets().unwrap().is_empty());
        assert!(cache.get_wallet(&alice.upi_id).unwrap().is_none());
    }

    #[test]
    fn memory_cache_behaviour() {
        exercise(&MemoryCache::new());
    }

    #[test]
    fn sled_cache_behaviour() {
        let dir = tempdir().unwrap();
        exercise(&SledCache::open(dir.path()).unwrap());
    }

    #[test]
    fn sled_cache_survives_reopen() {
        let dir = tempdir().unwrap();
        let alice = record("alice@bank", 1);
        let wallet = EscrowWallet::generate(None).unwrap();
        {
            let cache = SledCache::open(dir.path()).unwrap();
            cache.put_mapping(&alice).unwrap();
            cache.put_wallet(&alice.upi_id, &wallet).unwrap();
            cache.flush().unwrap();
        }
        let cache = SledCache::open(dir.path()).unwrap();
        assert_eq!(cache.get_mapping(&alice.upi_id).unwrap(), Some(alice.clone()));
        assert_eq!(cache.get_wallet(&alice.upi_id).unwrap(), Some(wallet));
    }
}
