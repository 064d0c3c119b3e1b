//! Remote ownership checks.
//!
//! Ownership decides whether a write may be attempted at all, so it is always
//! answered by the registry and never by the local cache.

use std::sync::Arc;
use upi_types::{Address, UpiId};

use crate::client::{ClientError, RegistryClient};
use crate::errors::{RegistryError, Result};

/// Who holds a UPI id on the registry, relative to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    OwnedByCaller,
    OwnedByOther(Address),
    Unregistered,
}

#[derive(Clone)]
pub struct OwnershipVerifier {
    client: Arc<dyn RegistryClient>,
}

impl OwnershipVerifier {
    pub fn new(client: Arc<dyn RegistryClient>) -> Self {
        Self { client }
    }

    /// The identity writes are signed with.
    pub fn caller(&self) -> Address {
        self.client.signer()
    }

    /// Existence query followed by an owner query.
    pub async fn check(&self, upi_id: &UpiId) -> Result<Ownership> {
        if !self.client.exists(upi_id).await? {
            return Ok(Ownership::Unregistered);
        }
        let owner = match self.client.owner_of(upi_id).await {
            Ok(owner) => owner,
            // Removed between the two queries.
            Err(ClientError::NotFound { .. }) => return Ok(Ownership::Unregistered),
            Err(e) => return Err(e.into()),
        };
        if owner == self.caller() {
            Ok(Ownership::OwnedByCaller)
        } else {
            Ok(Ownership::OwnedByOther(owner))
        }
    }

    /// Fail unless the caller is the recorded owner.
    pub async fn require_owner(&self, upi_id: &UpiId) -> Result<()> {
        match self.check(upi_id).await? {
            Ownership::OwnedByCaller => Ok(()),
            Ownership::OwnedByOther(_) => Err(RegistryError::NotOwner {
                upi_id: upi_id.clone(),
                caller: self.caller(),
            }),
            Ownership::Unregistered => Err(RegistryError::NotFound {
                upi_id: upi_id.clone(),
            }),
        }
    }
}
