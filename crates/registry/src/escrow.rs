//! Escrow wallet generation and linking.
//!
//! Key material is generated and persisted locally before the link is
//! submitted; only the address is ever sent to the registry. A link that does
//! not commit leaves an unlinked wallet behind which [`EscrowLinkController::retry_link`]
//! can link later without generating new keys.

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use upi_types::{Address, MappingRecord, TxRef, UpiId};
use zeroize::Zeroizing;

use crate::cache::LocalCache;
use crate::client::RegistryClient;
use crate::errors::{RegistryError, Result};
use crate::keys::EscrowWallet;
use crate::locks::KeyLocks;
use crate::observe;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateEscrowOptions {
    /// Discard any existing wallet for the id and generate a new keypair.
    /// The discarded key cannot be recovered.
    pub regenerate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowOutcome {
    pub upi_id: UpiId,
    pub address: Address,
    pub reference: TxRef,
    /// An unlinked wallet from an earlier attempt was linked instead of a new one.
    pub reused_key: bool,
    /// Address whose key material was discarded by a regenerate.
    pub replaced: Option<Address>,
}

pub struct EscrowLinkController {
    client: Arc<dyn RegistryClient>,
    cache: Arc<dyn LocalCache>,
    locks: KeyLocks,
    key_password: Option<Zeroizing<String>>,
}

impl EscrowLinkController {
    pub fn new(client: Arc<dyn RegistryClient>, cache: Arc<dyn LocalCache>, locks: KeyLocks) -> Self {
        Self {
            client,
            cache,
            locks,
            key_password: None,
        }
    }

    /// Seal newly generated escrow keys with `password`.
    pub fn with_key_password(mut self, password: impl Into<String>) -> Self {
        self.key_password = Some(Zeroizing::new(password.into()));
        self
    }

    fn password(&self) -> Option<&str> {
        self.key_password.as_deref().map(String::as_str)
    }

    pub async fn generate(
        &self,
        upi_id: &UpiId,
        options: GenerateEscrowOptions,
    ) -> Result<EscrowOutcome> {
        let result = self.generate_locked(upi_id, options).await;
        observe("generate_escrow", &result);
        result
    }

    async fn generate_locked(
        &self,
        upi_id: &UpiId,
        options: GenerateEscrowOptions,
    ) -> Result<EscrowOutcome> {
        let _guard = self.locks.acquire(upi_id).await;
        let record = self.active_mapping(upi_id)?;

        let (wallet, reused_key, replaced) = match self.cache.get_wallet(upi_id)? {
            Some(existing) if !options.regenerate => {
                if existing.is_linked() {
                    return Err(RegistryError::EscrowAlreadyLinked {
                        upi_id: upi_id.clone(),
                        address: existing.address,
                    });
                }
                info!(%upi_id, address = %existing.address, "reusing unlinked escrow wallet");
                (existing, true, None)
            }
            Some(existing) => {
                warn!(
                    %upi_id,
                    discarded = %existing.address,
                    was_linked = existing.is_linked(),
                    "discarding escrow key material"
                );
                (EscrowWallet::generate(self.password())?, false, Some(existing.address))
            }
            None => (EscrowWallet::generate(self.password())?, false, None),
        };
        self.cache.put_wallet(upi_id, &wallet)?;

        self.link(record, wallet, reused_key, replaced).await
    }

    /// Submit the link again for a wallet whose earlier link did not commit.
    pub async fn retry_link(&self, upi_id: &UpiId) -> Result<EscrowOutcome> {
        let result = self.retry_link_locked(upi_id).await;
        observe("retry_escrow_link", &result);
        result
    }

    async fn retry_link_locked(&self, upi_id: &UpiId) -> Result<EscrowOutcome> {
        let _guard = self.locks.acquire(upi_id).await;
        let record = self.active_mapping(upi_id)?;
        let wallet = self
            .cache
            .get_wallet(upi_id)?
            .ok_or_else(|| RegistryError::NotFound {
                upi_id: upi_id.clone(),
            })?;
        if wallet.is_linked() {
            return Err(RegistryError::EscrowAlreadyLinked {
                upi_id: upi_id.clone(),
                address: wallet.address,
            });
        }
        self.link(record, wallet, true, None).await
    }

    /// Decrypt the escrow signing key for `upi_id`. Falls back to the
    /// configured key password when `password` is `None`.
    pub fn unlock(&self, upi_id: &UpiId, password: Option<&str>) -> Result<SigningKey> {
        let wallet = self
            .cache
            .get_wallet(upi_id)?
            .ok_or_else(|| RegistryError::NotFound {
                upi_id: upi_id.clone(),
            })?;
        wallet.unlock(password.or_else(|| self.password()))
    }

    pub fn wallet(&self, upi_id: &UpiId) -> Result<Option<EscrowWallet>> {
        Ok(self.cache.get_wallet(upi_id)?)
    }

    fn active_mapping(&self, upi_id: &UpiId) -> Result<MappingRecord> {
        match self.cache.get_mapping(upi_id)? {
            Some(record) if record.is_active() => Ok(record),
            other => Err(RegistryError::MappingNotActive {
                upi_id: upi_id.clone(),
                status: other.map(|r| r.status),
            }),
        }
    }

    async fn link(
        &self,
        record: MappingRecord,
        mut wallet: EscrowWallet,
        reused_key: bool,
        replaced: Option<Address>,
    ) -> Result<EscrowOutcome> {
        let upi_id = record.upi_id.clone();
        let address = wallet.address;
        let reference = self
            .client
            .submit_link_escrow(&upi_id, &address)
            .await
            .into_result()
            .map_err(|reason| {
                warn!(%upi_id, %address, %reason, "escrow link not committed, wallet kept locally");
                RegistryError::LinkedLocalOnly {
                    upi_id: upi_id.clone(),
                    address,
                    reason,
                }
            })?;

        wallet.linked_upi_id = Some(upi_id.clone());
        self.cache.put_wallet(&upi_id, &wallet)?;
        self.cache.put_mapping(&MappingRecord {
            escrow_address: Some(address),
            ..record
        })?;
        info!(%upi_id, %address, %reference, "linked escrow wallet");
        Ok(EscrowOutcome {
            upi_id,
            address,
            reference,
            reused_key,
            replaced,
        })
    }
}
