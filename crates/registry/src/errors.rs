//! Error types for the registrar controllers

use thiserror::Error;
use upi_types::{Address, FailureReason, MappingStatus, TxRef, UpiId, UpiIdError};

use crate::cache::CacheError;
use crate::client::ClientError;

/// Remote write kinds, used to label rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Register,
    Remove,
    LinkEscrow,
}

impl WriteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteKind::Register => "register",
            WriteKind::Remove => "remove",
            WriteKind::LinkEscrow => "link_escrow",
        }
    }
}

impl std::fmt::Display for WriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid UPI identifier format: {0}")]
    InvalidIdentifierFormat(#[from] UpiIdError),

    #[error("UPI id {upi_id} is already owned by {owner}")]
    AlreadyOwnedByOther { upi_id: UpiId, owner: Address },

    #[error("Caller {caller} is not the owner of {upi_id}")]
    NotOwner { upi_id: UpiId, caller: Address },

    #[error("UPI id not found on registry: {upi_id}")]
    NotFound { upi_id: UpiId },

    #[error("Registry unavailable: {reason}")]
    RemoteUnavailable { reason: String },

    #[error("Registry rejected {operation} of {upi_id}: {reason}")]
    Rejected {
        operation: WriteKind,
        upi_id: UpiId,
        reason: String,
    },

    #[error("Update {old} -> {new} failed ({reason}); {old} restored by {rollback}")]
    UpdateFailedRestored {
        old: UpiId,
        new: UpiId,
        reason: FailureReason,
        rollback: TxRef,
    },

    #[error(
        "Update {old} -> {new} failed ({reason}) and rollback failed ({rollback_reason}); \
         {old} is orphaned and needs manual correction"
    )]
    UpdateFailedOrphaned {
        old: UpiId,
        new: UpiId,
        reason: FailureReason,
        rollback_reason: FailureReason,
    },

    #[error("Delete of {upi_id} failed ({reason}); local state unchanged")]
    DeleteFailed { upi_id: UpiId, reason: FailureReason },

    #[error("Escrow {address} stored for {upi_id} but link not committed ({reason})")]
    LinkedLocalOnly {
        upi_id: UpiId,
        address: Address,
        reason: FailureReason,
    },

    #[error("Old and new UPI id are identical: {upi_id}")]
    IdenticalIdentifiers { upi_id: UpiId },

    #[error("UPI id {upi_id} is already registered to the caller")]
    AlreadyRegistered { upi_id: UpiId },

    #[error("No active mapping for {upi_id} (status: {status:?})")]
    MappingNotActive {
        upi_id: UpiId,
        status: Option<MappingStatus>,
    },

    #[error("UPI id {upi_id} already has linked escrow {address}; regenerate to replace it")]
    EscrowAlreadyLinked { upi_id: UpiId, address: Address },

    #[error(
        "UPI id {upi_id} already holds escrow wallet {address}; moving another wallet onto it \
         would discard that key"
    )]
    EscrowWalletConflict { upi_id: UpiId, address: Address },
    #[error("UPI id {upi_id} still has linked escrow {address}; force the delete to proceed")]
    EscrowStillLinked { upi_id: UpiId, address: Address },

    #[error("Local cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Key material error: {0}")]
    KeyMaterial(String),
}

impl RegistryError {
    /// Map a failed write that leaves local state untouched.
    pub(crate) fn from_write(operation: WriteKind, upi_id: &UpiId, reason: FailureReason) -> Self {
        match reason {
            FailureReason::Rejected(reason) => RegistryError::Rejected {
                operation,
                upi_id: upi_id.clone(),
                reason,
            },
            transient => RegistryError::RemoteUnavailable {
                reason: transient.to_string(),
            },
        }
    }

    /// Whether the failed operation left a local change behind.
    pub fn local_state_changed(&self) -> bool {
        matches!(
            self,
            RegistryError::UpdateFailedOrphaned { .. } | RegistryError::LinkedLocalOnly { .. }
        )
    }

    /// Whether re-invoking the same operation can succeed without manual action.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::RemoteUnavailable { .. }
            | RegistryError::DeleteFailed { .. }
            | RegistryError::LinkedLocalOnly { .. } => true,
            RegistryError::UpdateFailedRestored { reason, .. } => reason.is_transient(),
            _ => false,
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::InvalidIdentifierFormat(_) => "invalid_identifier_format",
            RegistryError::AlreadyOwnedByOther { .. } => "already_owned_by_other",
            RegistryError::NotOwner { .. } => "not_owner",
            RegistryError::NotFound { .. } => "not_found",
            RegistryError::RemoteUnavailable { .. } => "remote_unavailable",
            RegistryError::Rejected { .. } => "rejected",
            RegistryError::UpdateFailedRestored { .. } => "update_failed_restored",
            RegistryError::UpdateFailedOrphaned { .. } => "update_failed_orphaned",
            RegistryError::DeleteFailed { .. } => "delete_failed",
            RegistryError::LinkedLocalOnly { .. } => "linked_local_only",
            RegistryError::IdenticalIdentifiers { .. } => "identical_identifiers",
            RegistryError::AlreadyRegistered { .. } => "already_registered",
            RegistryError::MappingNotActive { .. } => "mapping_not_active",
            RegistryError::EscrowAlreadyLinked { .. } => "escrow_already_linked",
            RegistryError::EscrowWalletConflict { .. } => "escrow_wallet_conflict",
            RegistryError::EscrowStillLinked { .. } => "escrow_still_linked",
            RegistryError::Cache(_) => "cache",
            RegistryError::KeyMaterial(_) => "key_material",
        }
    }
}

impl From<ClientError> for RegistryError {
    fn from(value: ClientError) -> Self {
        match value {
            ClientError::NotFound { upi_id } => RegistryError::NotFound { upi_id },
            other => RegistryError::RemoteUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn upi(raw: &str) -> UpiId {
        UpiId::parse(raw).unwrap()
    }

    #[test]
    fn transient_write_failures_become_remote_unavailable() {
        let err = RegistryError::from_write(WriteKind::Register, &upi("alice@bank"), FailureReason::Timeout);
        assert!(matches!(err, RegistryError::RemoteUnavailable { .. }));
        assert!(err.is_retryable());
        assert!(!err.local_state_changed());

        let err = RegistryError::from_write(
            WriteKind::Remove,
            &upi("alice@bank"),
            FailureReason::Rejected("not owner".into()),
        );
        assert!(matches!(err, RegistryError::Rejected { operation: WriteKind::Remove, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn orphaned_update_is_terminal() {
        let err = RegistryError::UpdateFailedOrphaned {
            old: upi("alice@bank"),
            new: upi("bob@bank"),
            reason: FailureReason::Timeout,
            rollback_reason: FailureReason::Unavailable("down".into()),
        };
        assert!(err.local_state_changed());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "update_failed_orphaned");
    }

    #[test]
    fn client_not_found_keeps_its_kind() {
        let err: RegistryError = ClientError::NotFound { upi_id: upi("alice@bank") }.into();
        assert!(matches!(err, RegistryError::NotFound { .. }));
        let err: RegistryError = ClientError::Timeout.into();
        assert!(matches!(err, RegistryError::RemoteUnavailable { .. }));
    }
}
