//! Register, update and delete of UPI mappings.
//!
//! Each operation holds the per-id lock of every id it touches for its whole
//! duration and drives at most one remote write per step. The only automatic
//! retry is the single rollback register in [`MappingLifecycleController::update`].
//!
//! # Cancellation
//!
//! Dropping an operation future before its first remote write leaves local
//! and remote state untouched. After a write has been submitted it may still
//! commit; the cache can then be left holding an `Updating`, `RollingBack` or
//! `Deleting` marker. Run reconciliation to resolve it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use upi_types::{Address, MappingRecord, MappingStatus, TxRef, UpiId};

use crate::cache::LocalCache;
use crate::client::RegistryClient;
use crate::errors::{RegistryError, Result, WriteKind};
use crate::locks::KeyLocks;
use crate::observe;
use crate::ownership::{Ownership, OwnershipVerifier};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    /// Delete even though an escrow wallet is still linked to the id.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub record: MappingRecord,
    /// `None` when the id was already registered to the caller and adopted.
    pub reference: Option<TxRef>,
    pub adopted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub record: MappingRecord,
    pub removed: TxRef,
    pub registered: TxRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub upi_id: UpiId,
    /// `None` when the id was already gone remotely and only the local record was dropped.
    pub reference: Option<TxRef>,
    pub unlinked_escrow: Option<Address>,
}

impl DeleteOutcome {
    pub fn local_only(&self) -> bool {
        self.reference.is_none()
    }
}

pub struct MappingLifecycleController {
    client: Arc<dyn RegistryClient>,
    cache: Arc<dyn LocalCache>,
    locks: KeyLocks,
    verifier: OwnershipVerifier,
}

impl MappingLifecycleController {
    pub fn new(client: Arc<dyn RegistryClient>, cache: Arc<dyn LocalCache>, locks: KeyLocks) -> Self {
        let verifier = OwnershipVerifier::new(client.clone());
        Self {
            client,
            cache,
            locks,
            verifier,
        }
    }

    /// Register `upi_id` for `owner`, who must be the identity of the client.
    ///
    /// Registering an id the caller already owns succeeds without a write and
    /// adopts the mapping locally.
    pub async fn register(&self, upi_id: &UpiId, owner: Address) -> Result<RegisterOutcome> {
        let result = self.register_locked(upi_id, owner).await;
        observe("register", &result);
        result
    }

    async fn register_locked(&self, upi_id: &UpiId, owner: Address) -> Result<RegisterOutcome> {
        let caller = self.verifier.caller();
        if owner != caller {
            return Err(RegistryError::NotOwner {
                upi_id: upi_id.clone(),
                caller: owner,
            });
        }
        let _guard = self.locks.acquire(upi_id).await;

        match self.verifier.check(upi_id).await? {
            Ownership::OwnedByOther(holder) => {
                warn!(%upi_id, %holder, "register refused: id owned by another identity");
                Err(RegistryError::AlreadyOwnedByOther {
                    upi_id: upi_id.clone(),
                    owner: holder,
                })
            }
            Ownership::OwnedByCaller => {
                let record = match self.cache.get_mapping(upi_id)? {
                    Some(existing) if existing.owner == caller => {
                        existing.with_status(MappingStatus::Active)
                    }
                    _ => MappingRecord::active(upi_id.clone(), caller),
                };
                self.cache.put_mapping(&record)?;
                info!(%upi_id, "id already registered to caller, adopted locally");
                Ok(RegisterOutcome {
                    record,
                    reference: None,
                    adopted: true,
                })
            }
            Ownership::Unregistered => {
                let reference = self
                    .client
                    .submit_register(upi_id)
                    .await
                    .into_result()
                    .map_err(|reason| {
                        warn!(%upi_id, %reason, "register not committed");
                        RegistryError::from_write(WriteKind::Register, upi_id, reason)
                    })?;
                let record = MappingRecord::active(upi_id.clone(), caller);
                self.cache.put_mapping(&record)?;
                info!(%upi_id, %reference, "registered mapping");
                Ok(RegisterOutcome {
                    record,
                    reference: Some(reference),
                    adopted: false,
                })
            }
        }
    }

    /// Move a mapping from `old` to `new`.
    ///
    /// The registry has no rename, so this removes `old` and registers `new`.
    /// If the register fails, `old` is registered again exactly once: success
    /// restores the previous record unchanged, failure leaves it `Orphaned`.
    pub async fn update(&self, old: &UpiId, new: &UpiId) -> Result<UpdateOutcome> {
        let result = self.update_locked(old, new).await;
        observe("update", &result);
        result
    }

    async fn update_locked(&self, old: &UpiId, new: &UpiId) -> Result<UpdateOutcome> {
        if old == new {
            return Err(RegistryError::IdenticalIdentifiers {
                upi_id: old.clone(),
            });
        }
        let caller = self.verifier.caller();
        let _guards = self.locks.acquire_many([old, new]).await;

        self.verifier.require_owner(old).await?;
        match self.verifier.check(new).await? {
            Ownership::OwnedByOther(holder) => {
                return Err(RegistryError::AlreadyOwnedByOther {
                    upi_id: new.clone(),
                    owner: holder,
                })
            }
            Ownership::OwnedByCaller => {
                return Err(RegistryError::AlreadyRegistered {
                    upi_id: new.clone(),
                })
            }
            Ownership::Unregistered => {}
        }

        // A locally missing `old` is adopted, but only kept once the update commits.
        let (before, adopted) = match self.cache.get_mapping(old)? {
            Some(record) if !record.is_active() => {
                return Err(RegistryError::MappingNotActive {
                    upi_id: old.clone(),
                    status: Some(record.status),
                })
            }
            Some(record) => (
                MappingRecord {
                    owner: caller,
                    ..record
                },
                false,
            ),
            None => (MappingRecord::active(old.clone(), caller), true),
        };
        if self.cache.get_wallet(old)?.is_some() {
            if let Some(stale) = self.cache.get_wallet(new)? {
                return Err(RegistryError::EscrowWalletConflict {
                    upi_id: new.clone(),
                    address: stale.address,
                });
            }
        }

        self.cache
            .put_mapping(&before.with_status(MappingStatus::Updating))?;
        let removed = match self.client.submit_remove(old).await.into_result() {
            Ok(reference) => reference,
            Err(reason) => {
                self.restore(&before, adopted)?;
                warn!(%old, %new, %reason, "update aborted: remove of old id not committed");
                return Err(RegistryError::from_write(WriteKind::Remove, old, reason));
            }
        };

        let reason = match self.client.submit_register(new).await.into_result() {
            Ok(registered) => {
                let record = before.renamed(new.clone());
                self.cache.remove_mapping(old)?;
                self.cache.put_mapping(&record)?;
                self.move_wallet(old, new)?;
                info!(%old, %new, %removed, %registered, adopted, "updated mapping");
                return Ok(UpdateOutcome {
                    record,
                    removed,
                    registered,
                });
            }
            Err(reason) => reason,
        };

        warn!(%old, %new, %reason, "register of new id not committed, rolling back");
        self.cache
            .put_mapping(&before.with_status(MappingStatus::RollingBack))?;
        match self.client.submit_register(old).await.into_result() {
            Ok(rollback) => {
                self.restore(&before, adopted)?;
                warn!(%old, %rollback, "rollback committed, previous mapping restored");
                Err(RegistryError::UpdateFailedRestored {
                    old: old.clone(),
                    new: new.clone(),
                    reason,
                    rollback,
                })
            }
            Err(rollback_reason) => {
                self.cache
                    .put_mapping(&before.with_status(MappingStatus::Orphaned))?;
                error!(
                    %old,
                    %new,
                    %reason,
                    %rollback_reason,
                    "rollback failed, mapping orphaned and needs manual correction"
                );
                Err(RegistryError::UpdateFailedOrphaned {
                    old: old.clone(),
                    new: new.clone(),
                    reason,
                    rollback_reason,
                })
            }
        }
    }

    /// Remove a mapping the caller owns.
    ///
    /// The local record survives any failed remote remove. A mapping that is
    /// already gone remotely is dropped locally without a write.
    pub async fn delete(&self, upi_id: &UpiId, options: DeleteOptions) -> Result<DeleteOutcome> {
        let result = self.delete_locked(upi_id, options).await;
        observe("delete", &result);
        result
    }

    async fn delete_locked(&self, upi_id: &UpiId, options: DeleteOptions) -> Result<DeleteOutcome> {
        let caller = self.verifier.caller();
        let _guard = self.locks.acquire(upi_id).await;
        let local = self.cache.get_mapping(upi_id)?;

        match self.verifier.check(upi_id).await? {
            Ownership::OwnedByOther(_) => {
                return Err(RegistryError::NotOwner {
                    upi_id: upi_id.clone(),
                    caller,
                })
            }
            Ownership::Unregistered => {
                return match local {
                    Some(record) if record.owner == caller => {
                        let unlinked_escrow = self.linked_escrow(upi_id, Some(&record))?;
                        self.cache.remove_mapping(upi_id)?;
                        self.unlink_wallet(upi_id)?;
                        info!(%upi_id, "mapping already gone remotely, dropped local record");
                        Ok(DeleteOutcome {
                            upi_id: upi_id.clone(),
                            reference: None,
                            unlinked_escrow,
                        })
                    }
                    _ => Err(RegistryError::NotFound {
                        upi_id: upi_id.clone(),
                    }),
                };
            }
            Ownership::OwnedByCaller => {}
        }

        let unlinked_escrow = self.linked_escrow(upi_id, local.as_ref())?;
        if let Some(address) = unlinked_escrow {
            if !options.force {
                return Err(RegistryError::EscrowStillLinked {
                    upi_id: upi_id.clone(),
                    address,
                });
            }
        }

        if let Some(record) = &local {
            self.cache
                .put_mapping(&record.with_status(MappingStatus::Deleting))?;
        }
        match self.client.submit_remove(upi_id).await.into_result() {
            Ok(reference) => {
                self.cache.remove_mapping(upi_id)?;
                self.unlink_wallet(upi_id)?;
                info!(%upi_id, %reference, "deleted mapping");
                Ok(DeleteOutcome {
                    upi_id: upi_id.clone(),
                    reference: Some(reference),
                    unlinked_escrow,
                })
            }
            Err(reason) => {
                if let Some(record) = &local {
                    self.cache.put_mapping(record)?;
                }
                warn!(%upi_id, %reason, "delete not committed, local record kept");
                Err(RegistryError::DeleteFailed {
                    upi_id: upi_id.clone(),
                    reason,
                })
            }
        }
    }

    fn linked_escrow(&self, upi_id: &UpiId, record: Option<&MappingRecord>) -> Result<Option<Address>> {
        let wallet = self.cache.get_wallet(upi_id)?.filter(|w| w.is_linked());
        Ok(wallet
            .map(|w| w.address)
            .or_else(|| record.and_then(|r| r.escrow_address)))
    }

    /// Clear the link flag; key material stays in the cache.
    fn unlink_wallet(&self, upi_id: &UpiId) -> Result<()> {
        if let Some(mut wallet) = self.cache.get_wallet(upi_id)? {
            if wallet.linked_upi_id.take().is_some() {
                self.cache.put_wallet(upi_id, &wallet)?;
            }
        }
        Ok(())
    }

    /// Put `old` back exactly as it was before the update touched the cache.
    fn restore(&self, before: &MappingRecord, adopted: bool) -> Result<()> {
        if adopted {
            self.cache.remove_mapping(&before.upi_id)?;
        } else {
            self.cache.put_mapping(before)?;
        }
        Ok(())
    }

    /// Re-key the escrow wallet after an update. Local only; a wallet under
    /// `new` has already been ruled out.
    fn move_wallet(&self, old: &UpiId, new: &UpiId) -> Result<()> {
        if let Some(mut wallet) = self.cache.get_wallet(old)? {
            if wallet.is_linked() {
                wallet.linked_upi_id = Some(new.clone());
            }
            self.cache.put_wallet(new, &wallet)?;
            self.cache.remove_wallet(old)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::client::InMemoryRegistry;
    use crate::keys::EscrowWallet;
    use upi_types::FailureReason;

    const CALLER: Address = Address([1; 32]);
    const OTHER: Address = Address([2; 32]);

    fn upi(raw: &str) -> UpiId {
        UpiId::parse(raw).unwrap()
    }

    fn setup() -> (InMemoryRegistry, Arc<MemoryCache>, MappingLifecycleController) {
        let registry = InMemoryRegistry::new();
        let cache = Arc::new(MemoryCache::new());
        let controller = MappingLifecycleController::new(
            Arc::new(registry.client(CALLER)),
            cache.clone(),
            KeyLocks::new(),
        );
        (registry, cache, controller)
    }

    #[tokio::test]
    async fn register_requires_caller_identity() {
        let (registry, cache, controller) = setup();
        let err = controller.register(&upi("alice@bank"), OTHER).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotOwner { .. }));
        assert!(registry.attempts().is_empty());
        assert!(cache.all_mappings().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_register_leaves_no_record() {
        let (registry, cache, controller) = setup();
        let id = upi("alice@bank");
        registry.fail_next(WriteKind::Register, &id, FailureReason::Timeout);
        let err = controller.register(&id, CALLER).await.unwrap_err();
        assert!(matches!(err, RegistryError::RemoteUnavailable { .. }));
        assert!(!err.local_state_changed());
        assert!(cache.get_mapping(&id).unwrap().is_none());

        registry.fail_next(WriteKind::Register, &id, FailureReason::Rejected("fee".into()));
        let err = controller.register(&id, CALLER).await.unwrap_err();
        assert!(matches!(err, RegistryError::Rejected { operation: WriteKind::Register, .. }));
        assert!(cache.get_mapping(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn update_moves_record_and_wallet() {
        let (registry, cache, controller) = setup();
        let (old, new) = (upi("alice@bank"), upi("bob@bank"));
        let registered = controller.register(&old, CALLER).await.unwrap().record;

        let mut wallet = EscrowWallet::generate(None).unwrap();
        wallet.linked_upi_id = Some(old.clone());
        cache.put_wallet(&old, &wallet).unwrap();
        cache
            .put_mapping(&MappingRecord {
                escrow_address: Some(wallet.address),
                ..registered.clone()
            })
            .unwrap();

        let outcome = controller.update(&old, &new).await.unwrap();
        assert_eq!(outcome.record.upi_id, new);
        assert_eq!(outcome.record.escrow_address, Some(wallet.address));
        assert_eq!(outcome.record.created_at, registered.created_at);
        assert!(cache.get_mapping(&old).unwrap().is_none());
        assert_eq!(registry.owner(&new), Some(CALLER));
        assert_eq!(registry.owner(&old), None);

        assert!(cache.get_wallet(&old).unwrap().is_none());
        let moved = cache.get_wallet(&new).unwrap().unwrap();
        assert_eq!(moved.address, wallet.address);
        assert_eq!(moved.linked_upi_id, Some(new));
    }

    #[tokio::test]
    async fn update_preconditions() {
        let (registry, cache, controller) = setup();
        let (old, new) = (upi("alice@bank"), upi("bob@bank"));

        assert!(matches!(
            controller.update(&old, &old).await,
            Err(RegistryError::IdenticalIdentifiers { .. })
        ));
        assert!(matches!(
            controller.update(&old, &new).await,
            Err(RegistryError::NotFound { .. })
        ));

        controller.register(&old, CALLER).await.unwrap();
        registry.seed_mapping(&new, OTHER);
        assert!(matches!(
            controller.update(&old, &new).await,
            Err(RegistryError::AlreadyOwnedByOther { owner, .. }) if owner == OTHER
        ));

        registry.seed_mapping(&new, CALLER);
        assert!(matches!(
            controller.update(&old, &new).await,
            Err(RegistryError::AlreadyRegistered { .. })
        ));

        registry.drop_mapping(&new);
        let record = cache.get_mapping(&old).unwrap().unwrap();
        cache
            .put_mapping(&record.with_status(MappingStatus::Orphaned))
            .unwrap();
        assert!(matches!(
            controller.update(&old, &new).await,
            Err(RegistryError::MappingNotActive { status: Some(MappingStatus::Orphaned), .. })
        ));
        assert_eq!(registry.attempt_count(WriteKind::Remove, &old), 0);
    }

    #[tokio::test]
    async fn update_adopts_missing_local_record() {
        let (registry, cache, controller) = setup();
        let (old, new) = (upi("alice@bank"), upi("bob@bank"));
        registry.seed_mapping(&old, CALLER);

        let outcome = controller.update(&old, &new).await.unwrap();
        assert_eq!(outcome.record.owner, CALLER);
        assert!(cache.get_mapping(&new).unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn failed_update_does_not_keep_adopted_record() {
        let (registry, cache, controller) = setup();
        let (old, new) = (upi("alice@bank"), upi("bob@bank"));
        registry.seed_mapping(&old, CALLER);

        registry.fail_next(WriteKind::Remove, &old, FailureReason::Timeout);
        let err = controller.update(&old, &new).await.unwrap_err();
        assert!(!err.local_state_changed());
        assert!(cache.get_mapping(&old).unwrap().is_none());

        registry.fail_next(WriteKind::Register, &new, FailureReason::Rejected("quota".into()));
        let err = controller.update(&old, &new).await.unwrap_err();
        assert!(matches!(err, RegistryError::UpdateFailedRestored { .. }));
        assert!(!err.local_state_changed());
        assert!(cache.get_mapping(&old).unwrap().is_none());
        assert_eq!(registry.owner(&old), Some(CALLER));
    }

    #[tokio::test]
    async fn failed_remove_aborts_update_unchanged() {
        let (registry, cache, controller) = setup();
        let (old, new) = (upi("alice@bank"), upi("bob@bank"));
        let before = controller.register(&old, CALLER).await.unwrap().record;

        registry.fail_next(WriteKind::Remove, &old, FailureReason::Unavailable("down".into()));
        let err = controller.update(&old, &new).await.unwrap_err();
        assert!(matches!(err, RegistryError::RemoteUnavailable { .. }));
        assert_eq!(cache.get_mapping(&old).unwrap(), Some(before));
        assert_eq!(registry.attempt_count(WriteKind::Register, &new), 0);
    }

    #[tokio::test]
    async fn delete_refuses_linked_escrow_without_force() {
        let (registry, cache, controller) = setup();
        let id = upi("alice@bank");
        controller.register(&id, CALLER).await.unwrap();
        let mut wallet = EscrowWallet::generate(None).unwrap();
        wallet.linked_upi_id = Some(id.clone());
        cache.put_wallet(&id, &wallet).unwrap();

        let err = controller
            .delete(&id, DeleteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::EscrowStillLinked { address, .. } if address == wallet.address));
        assert_eq!(registry.attempt_count(WriteKind::Remove, &id), 0);

        let outcome = controller
            .delete(&id, DeleteOptions { force: true })
            .await
            .unwrap();
        assert_eq!(outcome.unlinked_escrow, Some(wallet.address));
        assert!(!outcome.local_only());
        assert!(cache.get_mapping(&id).unwrap().is_none());
        let kept = cache.get_wallet(&id).unwrap().unwrap();
        assert!(!kept.is_linked());
        assert_eq!(kept.key, wallet.key);
    }

    #[tokio::test]
    async fn delete_handles_drift_and_foreign_ids() {
        let (registry, cache, controller) = setup();
        let id = upi("alice@bank");
        controller.register(&id, CALLER).await.unwrap();
        registry.drop_mapping(&id);

        let outcome = controller.delete(&id, DeleteOptions::default()).await.unwrap();
        assert!(outcome.local_only());
        assert!(cache.get_mapping(&id).unwrap().is_none());
        assert_eq!(registry.attempt_count(WriteKind::Remove, &id), 0);

        assert!(matches!(
            controller.delete(&id, DeleteOptions::default()).await,
            Err(RegistryError::NotFound { .. })
        ));

        registry.seed_mapping(&id, OTHER);
        assert!(matches!(
            controller.delete(&id, DeleteOptions::default()).await,
            Err(RegistryError::NotOwner { .. })
        ));
        assert_eq!(registry.owner(&id), Some(OTHER));
    }
}
