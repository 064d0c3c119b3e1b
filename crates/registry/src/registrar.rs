//! Caller-facing entry point wiring the controllers to shared collaborators.

use std::sync::Arc;
use upi_types::{Address, MappingRecord, UpiId};

use crate::cache::LocalCache;
use crate::client::RegistryClient;
use crate::errors::Result;
use crate::escrow::{EscrowLinkController, EscrowOutcome, GenerateEscrowOptions};
use crate::keys::EscrowWallet;
use crate::lifecycle::{
    DeleteOptions, DeleteOutcome, MappingLifecycleController, RegisterOutcome, UpdateOutcome,
};
use crate::locks::KeyLocks;
use crate::reconcile::{ReconcileReport, ReconciliationEngine};

/// All controllers share one lock arena, so a reconcile never overlaps a
/// lifecycle operation or an escrow link on the same id.
pub struct Registrar {
    identity: Address,
    cache: Arc<dyn LocalCache>,
    lifecycle: MappingLifecycleController,
    escrow: EscrowLinkController,
    reconciler: ReconciliationEngine,
}

impl Registrar {
    pub fn new(client: Arc<dyn RegistryClient>, cache: Arc<dyn LocalCache>) -> Self {
        let locks = KeyLocks::new();
        Self {
            identity: client.signer(),
            lifecycle: MappingLifecycleController::new(client.clone(), cache.clone(), locks.clone()),
            escrow: EscrowLinkController::new(client.clone(), cache.clone(), locks.clone()),
            reconciler: ReconciliationEngine::new(client, cache.clone(), locks),
            cache,
        }
    }

    /// Seal generated escrow keys with `password`.
    pub fn with_escrow_password(mut self, password: impl Into<String>) -> Self {
        self.escrow = self.escrow.with_key_password(password);
        self
    }

    /// Identity that signs every registry write.
    pub fn identity(&self) -> Address {
        self.identity
    }

    pub async fn register(&self, upi_id: &UpiId, owner: Address) -> Result<RegisterOutcome> {
        self.lifecycle.register(upi_id, owner).await
    }

    pub async fn update(&self, old: &UpiId, new: &UpiId) -> Result<UpdateOutcome> {
        self.lifecycle.update(old, new).await
    }

    pub async fn delete(&self, upi_id: &UpiId, options: DeleteOptions) -> Result<DeleteOutcome> {
        self.lifecycle.delete(upi_id, options).await
    }

    pub async fn generate_escrow(
        &self,
        upi_id: &UpiId,
        options: GenerateEscrowOptions,
    ) -> Result<EscrowOutcome> {
        self.escrow.generate(upi_id, options).await
    }

    pub async fn retry_escrow_link(&self, upi_id: &UpiId) -> Result<EscrowOutcome> {
        self.escrow.retry_link(upi_id).await
    }

    pub async fn reconcile(&self, owner: &Address) -> Result<ReconcileReport> {
        self.reconciler.reconcile(owner).await
    }

    /// Cached mappings of `owner`, sorted by id.
    pub fn mappings(&self, owner: &Address) -> Result<Vec<MappingRecord>> {
        let mut records = self.cache.mappings_of(owner)?;
        records.sort_by(|a, b| a.upi_id.cmp(&b.upi_id));
        Ok(records)
    }

    pub fn mapping(&self, upi_id: &UpiId) -> Result<Option<MappingRecord>> {
        Ok(self.cache.get_mapping(upi_id)?)
    }

    pub fn escrow_wallet(&self, upi_id: &UpiId) -> Result<Option<EscrowWallet>> {
        self.escrow.wallet(upi_id)
    }

    /// Decrypt the escrow key of `upi_id`, falling back to the configured escrow password.
    pub fn unlock_escrow(&self, upi_id: &UpiId, password: Option<&str>) -> Result<ed25519_dalek::SigningKey> {
        self.escrow.unlock(upi_id, password)
    }
}
