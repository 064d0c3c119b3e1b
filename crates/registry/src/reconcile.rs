//! Local/remote reconciliation.
//!
//! The registry always wins: the cached records of an owner are replaced
//! wholesale by what the registry reports, and escrow wallet link flags are
//! aligned with the result. Wallets still flagged as linked to an id that has
//! no record at all are unlinked on the way.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use upi_types::{Address, MappingRecord, MappingStatus, RemoteEscrow, UpiId};

use crate::cache::LocalCache;
use crate::client::RegistryClient;
use crate::errors::{RegistryError, Result};
use crate::locks::{KeyGuard, KeyLocks};
use crate::observe;

/// Rounds of lock-then-fetch before giving up on a mapping set that keeps moving.
const MAX_LOCK_ROUNDS: usize = 4;

/// One field that differed between the cache and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDrift {
    pub upi_id: UpiId,
    pub field: &'static str,
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub owner: Address,
    pub added: Vec<UpiId>,
    pub dropped: Vec<UpiId>,
    pub updated: Vec<UpiId>,
    pub unchanged: Vec<UpiId>,
    pub diffs: Vec<FieldDrift>,
    /// Escrow addresses re-linked locally by an update that the registry
    /// still records under the previous id.
    pub kept_local_escrow: Vec<UpiId>,
    pub wallets_linked: Vec<UpiId>,
    pub wallets_unlinked: Vec<UpiId>,
}

impl ReconcileReport {
    fn new(owner: Address) -> Self {
        Self {
            owner,
            added: Vec::new(),
            dropped: Vec::new(),
            updated: Vec::new(),
            unchanged: Vec::new(),
            diffs: Vec::new(),
            kept_local_escrow: Vec::new(),
            wallets_linked: Vec::new(),
            wallets_unlinked: Vec::new(),
        }
    }

    /// Whether the cache already matched the registry.
    pub fn is_clean(&self) -> bool {
        self.added.is_empty()
            && self.dropped.is_empty()
            && self.updated.is_empty()
            && self.wallets_linked.is_empty()
            && self.wallets_unlinked.is_empty()
    }
}

pub struct ReconciliationEngine {
    client: Arc<dyn RegistryClient>,
    cache: Arc<dyn LocalCache>,
    locks: KeyLocks,
}

struct Snapshot {
    remote_ids: BTreeSet<UpiId>,
    escrows: Vec<RemoteEscrow>,
    local: BTreeMap<UpiId, MappingRecord>,
    /// Linked wallets filed under an id with no cached record.
    stray_wallets: BTreeSet<UpiId>,
    _guards: Vec<KeyGuard>,
}

impl ReconciliationEngine {
    pub fn new(client: Arc<dyn RegistryClient>, cache: Arc<dyn LocalCache>, locks: KeyLocks) -> Self {
        Self {
            client,
            cache,
            locks,
        }
    }

    /// Overwrite the cached mappings of `owner` with the registry's view.
    pub async fn reconcile(&self, owner: &Address) -> Result<ReconcileReport> {
        let result = self.reconcile_locked(owner).await;
        observe("reconcile", &result);
        result
    }

    async fn reconcile_locked(&self, owner: &Address) -> Result<ReconcileReport> {
        let snapshot = self.snapshot(owner).await?;
        let mut report = ReconcileReport::new(*owner);

        for record in snapshot.local.values().filter(|r| r.status.is_in_flight()) {
            info!(
                upi_id = %record.upi_id,
                status = %record.status,
                registered = snapshot.remote_ids.contains(&record.upi_id),
                "resolving marker left by an interrupted operation"
            );
        }

        let known_escrows: HashSet<Address> = snapshot.escrows.iter().map(|e| e.address).collect();
        let mut latest_escrow: HashMap<&UpiId, Address> = HashMap::new();
        for escrow in &snapshot.escrows {
            latest_escrow.insert(&escrow.upi_id, escrow.address);
        }

        let mut records = Vec::with_capacity(snapshot.remote_ids.len());
        for upi_id in &snapshot.remote_ids {
            let remote_escrow = latest_escrow.get(upi_id).copied();
            let Some(local) = snapshot.local.get(upi_id) else {
                records.push(MappingRecord {
                    escrow_address: remote_escrow,
                    ..MappingRecord::active(upi_id.clone(), *owner)
                });
                report.added.push(upi_id.clone());
                continue;
            };

            let escrow_address = match (remote_escrow, local.escrow_address) {
                (Some(remote), _) => Some(remote),
                (None, Some(relinked)) if known_escrows.contains(&relinked) => {
                    report.kept_local_escrow.push(upi_id.clone());
                    Some(relinked)
                }
                (None, _) => None,
            };
            let record = MappingRecord {
                upi_id: upi_id.clone(),
                owner: *owner,
                escrow_address,
                created_at: local.created_at,
                status: MappingStatus::Active,
            };

            let before = report.diffs.len();
            compare_records(local, &record, &mut report.diffs);
            if report.diffs.len() > before {
                report.updated.push(upi_id.clone());
            } else {
                report.unchanged.push(upi_id.clone());
            }
            records.push(record);
        }

        for upi_id in snapshot.local.keys() {
            if !snapshot.remote_ids.contains(upi_id) {
                report.dropped.push(upi_id.clone());
            }
        }

        self.cache.replace_mappings_of(owner, &records)?;
        let dropped = report.dropped.clone();
        self.align_wallets(&records, &dropped, &snapshot.stray_wallets, &mut report)?;

        info!(
            %owner,
            added = report.added.len(),
            dropped = report.dropped.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            "reconciled local cache"
        );
        Ok(report)
    }

    /// Lock every id the owner has locally or remotely, then read both sides.
    ///
    /// The remote lists are fetched again under the locks so that no lifecycle
    /// operation on those ids can commit between the read and the overwrite.
    async fn snapshot(&self, owner: &Address) -> Result<Snapshot> {
        let mut wanted: BTreeSet<UpiId> = self.client.list_mappings_of(owner).await?.into_iter().collect();
        wanted.extend(self.cache.mappings_of(owner)?.into_iter().map(|r| r.upi_id));
        wanted.extend(self.stray_wallets()?);

        for round in 1..=MAX_LOCK_ROUNDS {
            let guards = self.locks.acquire_many(&wanted).await;
            let (remote_ids, escrows) = futures::try_join!(
                self.client.list_mappings_of(owner),
                self.client.list_escrows_of(owner)
            )?;
            let remote_ids: BTreeSet<UpiId> = remote_ids.into_iter().collect();
            let local: BTreeMap<UpiId, MappingRecord> = self
                .cache
                .mappings_of(owner)?
                .into_iter()
                .map(|r| (r.upi_id.clone(), r))
                .collect();
            let stray_wallets = self.stray_wallets()?;

            let unlocked: Vec<&UpiId> = remote_ids
                .iter()
                .chain(local.keys())
                .chain(stray_wallets.iter())
                .filter(|id| !wanted.contains(*id))
                .collect();
            if unlocked.is_empty() {
                return Ok(Snapshot {
                    remote_ids,
                    escrows,
                    local,
                    stray_wallets,
                    _guards: guards,
                });
            }
            debug!(%owner, round, new_ids = unlocked.len(), "mapping set moved while locking, retrying");
            let unlocked: Vec<UpiId> = unlocked.into_iter().cloned().collect();
            drop(guards);
            wanted.extend(unlocked);
        }
        Err(RegistryError::RemoteUnavailable {
            reason: format!("mapping set of {owner} kept changing during reconciliation"),
        })
    }

    fn stray_wallets(&self) -> Result<BTreeSet<UpiId>> {
        let mut stray = BTreeSet::new();
        for (upi_id, wallet) in self.cache.wallets()? {
            if wallet.is_linked() && self.cache.get_mapping(&upi_id)?.is_none() {
                stray.insert(upi_id);
            }
        }
        Ok(stray)
    }

    /// A wallet is linked exactly when its address is the record's escrow.
    fn align_wallets(
        &self,
        records: &[MappingRecord],
        dropped: &[UpiId],
        stray: &BTreeSet<UpiId>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let mut seen: HashSet<&UpiId> = HashSet::new();
        let targets = records
            .iter()
            .map(|r| (&r.upi_id, r.escrow_address))
            .chain(dropped.iter().map(|id| (id, None)))
            .chain(stray.iter().map(|id| (id, None)));
        for (upi_id, escrow_address) in targets {
            if !seen.insert(upi_id) {
                continue;
            }
            if stray.contains(upi_id) && self.cache.get_mapping(upi_id)?.is_none() {
                warn!(%upi_id, "wallet linked to an id with no mapping, unlinking");
            }
            let Some(mut wallet) = self.cache.get_wallet(upi_id)? else {
                continue;
            };
            let linked = escrow_address == Some(wallet.address);
            if linked == wallet.is_linked() && (!linked || wallet.linked_upi_id.as_ref() == Some(upi_id)) {
                continue;
            }
            if linked {
                wallet.linked_upi_id = Some(upi_id.clone());
                report.wallets_linked.push(upi_id.clone());
            } else {
                wallet.linked_upi_id = None;
                report.wallets_unlinked.push(upi_id.clone());
            }
            self.cache.put_wallet(upi_id, &wallet)?;
        }
        Ok(())
    }
}

fn compare_records(local: &MappingRecord, remote: &MappingRecord, diffs: &mut Vec<FieldDrift>) {
    if local.owner != remote.owner {
        diffs.push(FieldDrift {
            upi_id: remote.upi_id.clone(),
            field: "owner",
            local: local.owner.to_string(),
            remote: remote.owner.to_string(),
        });
    }

    if local.escrow_address != remote.escrow_address {
        diffs.push(FieldDrift {
            upi_id: remote.upi_id.clone(),
            field: "escrow_address",
            local: display_escrow(local.escrow_address),
            remote: display_escrow(remote.escrow_address),
        });
    }

    if local.status != remote.status {
        diffs.push(FieldDrift {
            upi_id: remote.upi_id.clone(),
            field: "status",
            local: local.status.to_string(),
            remote: remote.status.to_string(),
        });
    }
}

fn display_escrow(address: Option<Address>) -> String {
    address.map(|a| a.to_string()).unwrap_or_else(|| "none".into())
}
