//! Remote registry collaborator.
//!
//! The registry is the single source of truth for which identity owns a UPI
//! id and which escrow addresses have been linked. Reads report failures as
//! [`ClientError`]; writes never error and always return an
//! [`OperationResult`] so the controllers can decide on compensation.

use async_trait::async_trait;
use thiserror::Error;
use upi_types::{Address, OperationResult, RemoteEscrow, UpiId};

pub mod http;
pub mod memory;

pub use http::HttpRegistryClient;
pub use memory::{InMemoryRegistry, InMemoryRegistryClient};

/// Errors that can occur while querying the registry.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid registry URL: {0}")]
    InvalidBaseUrl(String),
    #[error("UPI id not registered: {upi_id}")]
    NotFound { upi_id: UpiId },
    #[error("registry request timed out")]
    Timeout,
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected registry response: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Identity that signs every write submitted through this client.
    fn signer(&self) -> Address;

    async fn exists(&self, upi_id: &UpiId) -> Result<bool, ClientError>;

    /// Fails with [`ClientError::NotFound`] when the id is not registered.
    async fn owner_of(&self, upi_id: &UpiId) -> Result<Address, ClientError>;

    async fn submit_register(&self, upi_id: &UpiId) -> OperationResult;

    async fn submit_remove(&self, upi_id: &UpiId) -> OperationResult;

    /// Only the escrow address is sent; key material never leaves the process.
    async fn submit_link_escrow(&self, upi_id: &UpiId, escrow: &Address) -> OperationResult;

    async fn list_mappings_of(&self, owner: &Address) -> Result<Vec<UpiId>, ClientError>;

    /// Escrow links recorded for `owner`, oldest first.
    async fn list_escrows_of(&self, owner: &Address) -> Result<Vec<RemoteEscrow>, ClientError>;
}
