//! In-process registry.
//!
//! Models the ledger contract closely enough to drive the controllers
//! without a network: one slot per UPI id, owner-only removal and linking,
//! an append-only escrow list per owner. Faults can be scripted per write
//! so compensation paths are reachable deterministically.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use upi_types::{Address, FailureReason, OperationResult, RemoteEscrow, TxRef, UpiId};

use super::{ClientError, RegistryClient};
use crate::errors::WriteKind;

/// One write the registry has seen, committed or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAttempt {
    pub kind: WriteKind,
    pub upi_id: UpiId,
    pub signer: Address,
    pub committed: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Owner of each registered id.
    mappings: HashMap<UpiId, Address>,
    owner_to_ids: HashMap<Address, Vec<UpiId>>,
    escrows: Vec<(Address, RemoteEscrow)>,
    write_faults: HashMap<(WriteKind, UpiId), VecDeque<FailureReason>>,
    read_outage: Option<String>,
    attempts: Vec<WriteAttempt>,
    tx_counter: u64,
}

impl RegistryState {
    fn next_tx(&mut self, kind: WriteKind, upi_id: &UpiId) -> TxRef {
        self.tx_counter += 1;
        let mut h = blake3::Hasher::new();
        h.update(&self.tx_counter.to_le_bytes());
        h.update(kind.as_str().as_bytes());
        h.update(upi_id.as_str().as_bytes());
        TxRef::new(format!("0x{}", h.finalize().to_hex()))
    }

    fn take_fault(&mut self, kind: WriteKind, upi_id: &UpiId) -> Option<FailureReason> {
        let key = (kind, upi_id.clone());
        let queue = self.write_faults.get_mut(&key)?;
        let fault = queue.pop_front();
        if queue.is_empty() {
            self.write_faults.remove(&key);
        }
        fault
    }

    fn check_reads(&self) -> Result<(), ClientError> {
        match &self.read_outage {
            Some(reason) => Err(ClientError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn insert_mapping(&mut self, upi_id: UpiId, owner: Address) {
        self.mappings.insert(upi_id.clone(), owner);
        self.owner_to_ids.entry(owner).or_default().push(upi_id);
    }

    fn remove_mapping(&mut self, upi_id: &UpiId) -> Option<Address> {
        let owner = self.mappings.remove(upi_id)?;
        if let Some(list) = self.owner_to_ids.get_mut(&owner) {
            list.retain(|id| id != upi_id);
        }
        Some(owner)
    }

    /// Apply one write, consuming a scripted fault first if one is queued.
    fn apply_write(
        &mut self,
        kind: WriteKind,
        upi_id: &UpiId,
        signer: Address,
        apply: impl FnOnce(&mut Self) -> Result<(), String>,
    ) -> OperationResult {
        let result = if let Some(fault) = self.take_fault(kind, upi_id) {
            match fault {
                FailureReason::Timeout => {
                    let tx = self.next_tx(kind, upi_id);
                    OperationResult::failed_with_reference(FailureReason::Timeout, tx)
                }
                other => OperationResult::failed(other),
            }
        } else {
            match apply(self) {
                Ok(()) => OperationResult::committed(self.next_tx(kind, upi_id)),
                Err(reason) => OperationResult::failed(FailureReason::Rejected(reason)),
            }
        };

        self.attempts.push(WriteAttempt {
            kind,
            upi_id: upi_id.clone(),
            signer,
            committed: result.committed,
        });
        result
    }
}

/// Shared registry state. Hand out one [`InMemoryRegistryClient`] per identity.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client that signs writes as `signer`.
    pub fn client(&self, signer: Address) -> InMemoryRegistryClient {
        InMemoryRegistryClient {
            registry: self.clone(),
            signer,
        }
    }

    /// Make the next `kind` write for `upi_id` fail with `reason` without applying it.
    /// Calls queue up, so two faults fail the next two matching writes.
    pub fn fail_next(&self, kind: WriteKind, upi_id: &UpiId, reason: FailureReason) {
        self.state
            .write()
            .write_faults
            .entry((kind, upi_id.clone()))
            .or_default()
            .push_back(reason);
    }

    /// Fail every read with `Unavailable` until cleared with `None`.
    pub fn set_read_outage(&self, reason: Option<&str>) {
        self.state.write().read_outage = reason.map(str::to_string);
    }

    /// Register out of band, e.g. from another device of the same merchant.
    pub fn seed_mapping(&self, upi_id: &UpiId, owner: Address) {
        let mut state = self.state.write();
        state.remove_mapping(upi_id);
        state.insert_mapping(upi_id.clone(), owner);
    }

    /// Remove out of band. Returns the previous owner.
    pub fn drop_mapping(&self, upi_id: &UpiId) -> Option<Address> {
        self.state.write().remove_mapping(upi_id)
    }

    pub fn owner(&self, upi_id: &UpiId) -> Option<Address> {
        self.state.read().mappings.get(upi_id).copied()
    }

    pub fn escrows(&self) -> Vec<RemoteEscrow> {
        self.state
            .read()
            .escrows
            .iter()
            .map(|(_, escrow)| escrow.clone())
            .collect()
    }

    pub fn attempts(&self) -> Vec<WriteAttempt> {
        self.state.read().attempts.clone()
    }

    /// Number of write attempts of `kind` against `upi_id`.
    pub fn attempt_count(&self, kind: WriteKind, upi_id: &UpiId) -> usize {
        self.state
            .read()
            .attempts
            .iter()
            .filter(|a| a.kind == kind && &a.upi_id == upi_id)
            .count()
    }
}

/// View of an [`InMemoryRegistry`] bound to one signing identity.
#[derive(Debug, Clone)]
pub struct InMemoryRegistryClient {
    registry: InMemoryRegistry,
    signer: Address,
}

#[async_trait]
impl RegistryClient for InMemoryRegistryClient {
    fn signer(&self) -> Address {
        self.signer
    }

    async fn exists(&self, upi_id: &UpiId) -> Result<bool, ClientError> {
        let state = self.registry.state.read();
        state.check_reads()?;
        Ok(state.mappings.contains_key(upi_id))
    }

    async fn owner_of(&self, upi_id: &UpiId) -> Result<Address, ClientError> {
        let state = self.registry.state.read();
        state.check_reads()?;
        state
            .mappings
            .get(upi_id)
            .copied()
            .ok_or_else(|| ClientError::NotFound {
                upi_id: upi_id.clone(),
            })
    }

    async fn submit_register(&self, upi_id: &UpiId) -> OperationResult {
        let signer = self.signer;
        self.registry
            .state
            .write()
            .apply_write(WriteKind::Register, upi_id, signer, |state| {
                if let Some(existing) = state.mappings.get(upi_id) {
                    return Err(format!("{upi_id} already registered to {existing}"));
                }
                state.insert_mapping(upi_id.clone(), signer);
                Ok(())
            })
    }

    async fn submit_remove(&self, upi_id: &UpiId) -> OperationResult {
        let signer = self.signer;
        self.registry
            .state
            .write()
            .apply_write(WriteKind::Remove, upi_id, signer, |state| {
                match state.mappings.get(upi_id) {
                    None => return Err(format!("{upi_id} is not registered")),
                    Some(owner) if *owner != signer => {
                        return Err(format!("{signer} does not own {upi_id}"))
                    }
                    Some(_) => {}
                }
                state.remove_mapping(upi_id);
                Ok(())
            })
    }

    async fn submit_link_escrow(&self, upi_id: &UpiId, escrow: &Address) -> OperationResult {
        let signer = self.signer;
        let escrow = *escrow;
        self.registry
            .state
            .write()
            .apply_write(WriteKind::LinkEscrow, upi_id, signer, |state| {
                match state.mappings.get(upi_id) {
                    None => return Err(format!("{upi_id} is not registered")),
                    Some(owner) if *owner != signer => {
                        return Err(format!("{signer} does not own {upi_id}"))
                    }
                    Some(_) => {}
                }
                state.escrows.push((
                    signer,
                    RemoteEscrow {
                        address: escrow,
                        upi_id: upi_id.clone(),
                        created_at: Utc::now(),
                    },
                ));
                Ok(())
            })
    }

    async fn list_mappings_of(&self, owner: &Address) -> Result<Vec<UpiId>, ClientError> {
        let state = self.registry.state.read();
        state.check_reads()?;
        Ok(state.owner_to_ids.get(owner).cloned().unwrap_or_default())
    }

    async fn list_escrows_of(&self, owner: &Address) -> Result<Vec<RemoteEscrow>, ClientError> {
        let state = self.registry.state.read();
        state.check_reads()?;
        Ok(state
            .escrows
            .iter()
            .filter(|(escrow_owner, _)| escrow_owner == owner)
            .map(|(_, escrow)| escrow.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upi(raw: &str) -> UpiId {
        UpiId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn register_is_single_slot_per_id() {
        let registry = InMemoryRegistry::new();
        let alice = registry.client(Address([1; 32]));
        let bob = registry.client(Address([2; 32]));
        let id = upi("shop@bank");

        assert!(alice.submit_register(&id).await.committed);
        let second = bob.submit_register(&id).await;
        assert!(!second.committed);
        assert!(matches!(second.failure_reason, Some(FailureReason::Rejected(_))));
        assert_eq!(alice.owner_of(&id).await.unwrap(), Address([1; 32]));
        assert_eq!(bob.list_mappings_of(&Address([1; 32])).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn only_owner_can_remove_or_link() {
        let registry = InMemoryRegistry::new();
        let alice = registry.client(Address([1; 32]));
        let bob = registry.client(Address([2; 32]));
        let id = upi("shop@bank");
        alice.submit_register(&id).await;

        assert!(!bob.submit_remove(&id).await.committed);
        assert!(!bob.submit_link_escrow(&id, &Address([9; 32])).await.committed);
        assert!(alice.submit_link_escrow(&id, &Address([9; 32])).await.committed);
        assert!(alice.submit_remove(&id).await.committed);
        assert!(!alice.exists(&id).await.unwrap());
        assert_eq!(alice.list_escrows_of(&Address([1; 32])).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scripted_faults_fire_once_in_order() {
        let registry = InMemoryRegistry::new();
        let client = registry.client(Address([1; 32]));
        let id = upi("shop@bank");
        registry.fail_next(WriteKind::Register, &id, FailureReason::Timeout);
        registry.fail_next(WriteKind::Register, &id, FailureReason::Unavailable("503".into()));

        let first = client.submit_register(&id).await;
        assert_eq!(first.failure_reason, Some(FailureReason::Timeout));
        assert!(first.reference.is_some());
        let second = client.submit_register(&id).await;
        assert!(matches!(second.failure_reason, Some(FailureReason::Unavailable(_))));
        assert!(!client.exists(&id).await.unwrap());

        assert!(client.submit_register(&id).await.committed);
        assert_eq!(registry.attempt_count(WriteKind::Register, &id), 3);
    }

    #[tokio::test]
    async fn read_outage_fails_queries() {
        let registry = InMemoryRegistry::new();
        let client = registry.client(Address([1; 32]));
        registry.set_read_outage(Some("maintenance"));
        assert!(matches!(
            client.exists(&upi("shop@bank")).await,
            Err(ClientError::Unavailable(_))
        ));
        registry.set_read_outage(None);
        assert!(!client.exists(&upi("shop@bank")).await.unwrap());
    }
}
