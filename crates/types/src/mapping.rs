use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Address, UpiId};

/// Lifecycle status of a locally cached mapping.
///
/// `Unregistered` and `Registering` have no record at all; a record only
/// exists once a register has committed. The in-flight states are written
/// before the corresponding remote write so that an interrupted operation
/// leaves a marker behind for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Active,
    Updating,
    RollingBack,
    Deleting,
    /// Terminal. Neither the old nor the new identifier could be confirmed.
    Orphaned,
}

impl MappingStatus {
    pub fn is_active(self) -> bool {
        matches!(self, MappingStatus::Active)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            MappingStatus::Updating | MappingStatus::RollingBack | MappingStatus::Deleting
        )
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MappingStatus::Active => "active",
            MappingStatus::Updating => "updating",
            MappingStatus::RollingBack => "rolling_back",
            MappingStatus::Deleting => "deleting",
            MappingStatus::Orphaned => "orphaned",
        };
        f.write_str(label)
    }
}

/// Local view of one `upi_id ↔ owner ↔ escrow` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub upi_id: UpiId,
    pub owner: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow_address: Option<Address>,
    pub created_at: DateTime<Utc>,
    pub status: MappingStatus,
}

impl MappingRecord {
    /// A freshly committed mapping.
    pub fn active(upi_id: UpiId, owner: Address) -> Self {
        Self {
            upi_id,
            owner,
            escrow_address: None,
            created_at: Utc::now(),
            status: MappingStatus::Active,
        }
    }

    pub fn with_status(&self, status: MappingStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Same mapping under a new identifier; escrow and creation time carry over.
    pub fn renamed(&self, upi_id: UpiId) -> Self {
        Self {
            upi_id,
            status: MappingStatus::Active,
            ..self.clone()
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Escrow link as reported by the registry for an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEscrow {
    pub address: Address,
    pub upi_id: UpiId,
    pub created_at: DateTime<Utc>,
}
