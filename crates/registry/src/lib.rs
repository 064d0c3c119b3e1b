//! UPI mapping registrar
//!
//! Keeps a merchant's UPI id ↔ escrow wallet mappings in step with a remote,
//! ledger-backed registry. The registry is the source of truth; the local
//! cache is advisory and is overwritten by reconciliation.
//!
//! Mutating operations are multi-step and any remote step may fail on its
//! own, so each controller reports whether local state changed along with
//! the error (see [`RegistryError::local_state_changed`]).

pub mod cache;
pub mod client;
pub mod errors;
pub mod escrow;
pub mod keys;
pub mod lifecycle;
pub mod locks;
pub mod ownership;
pub mod reconcile;
pub mod registrar;

pub use cache::{CacheError, LocalCache, MemoryCache, SledCache};
pub use client::{
    ClientError, HttpRegistryClient, InMemoryRegistry, InMemoryRegistryClient, RegistryClient,
};
pub use errors::{RegistryError, Result, WriteKind};
pub use escrow::{EscrowLinkController, EscrowOutcome, GenerateEscrowOptions};
pub use keys::{EscrowWallet, IdentityKeyFile, KeySecret};
pub use lifecycle::{
    DeleteOptions, DeleteOutcome, MappingLifecycleController, RegisterOutcome, UpdateOutcome,
};
pub use locks::{KeyGuard, KeyLocks};
pub use ownership::{Ownership, OwnershipVerifier};
pub use reconcile::{FieldDrift, ReconcileReport, ReconciliationEngine};
pub use registrar::Registrar;

/// Name of the operation counter.
pub const OPERATIONS_METRIC: &str = "upi_registry_operations_total";

/// Count one finished operation, labelled by its outcome.
pub(crate) fn observe<T>(operation: &'static str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(OPERATIONS_METRIC, "operation" => operation, "outcome" => outcome)
        .increment(1);
}
