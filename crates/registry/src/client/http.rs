//! JSON-over-HTTP registry client.
//!
//! Every write is signed by the caller identity: Ed25519 over
//! `SHA-256(domain_tag || upi_id || extra)`, where `extra` is the escrow
//! address bytes for link requests and empty otherwise.

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use upi_types::{Address, FailureReason, OperationResult, RemoteEscrow, TxRef, UpiId};
use url::Url;

use super::{ClientError, RegistryClient};
use crate::errors::WriteKind;

const REGISTER_DOMAIN: &[u8] = b"UPI_REGISTER";
const REMOVE_DOMAIN: &[u8] = b"UPI_REMOVE";
const LINK_ESCROW_DOMAIN: &[u8] = b"UPI_LINK_ESCROW";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry client speaking to a gateway at `base_url`.
#[derive(Clone)]
pub struct HttpRegistryClient {
    base_url: Url,
    http: Client,
    signing_key: SigningKey,
}

impl HttpRegistryClient {
    pub fn new(
        base_url: impl AsRef<str>,
        signing_key: SigningKey,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;
        Self::with_http_client(base_url, signing_key, http)
    }

    /// Use an existing reqwest client (custom TLS, proxies).
    pub fn with_http_client(
        base_url: impl AsRef<str>,
        signing_key: SigningKey,
        http: Client,
    ) -> Result<Self, ClientError> {
        let mut url = Url::parse(base_url.as_ref())
            .map_err(|_| ClientError::InvalidBaseUrl(base_url.as_ref().to_string()))?;
        if !url.path().ends_with('/') {
            let mut path = url.path().trim_end_matches('/').to_owned();
            path.push('/');
            url.set_path(&path);
        }
        Ok(Self {
            base_url: url,
            http,
            signing_key,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::InvalidBaseUrl(format!("{path}: {e}")))
    }

    fn sign_write(&self, kind: WriteKind, upi_id: &UpiId, escrow: Option<&Address>) -> SignedWrite {
        let signature = self
            .signing_key
            .sign(&write_digest(kind, upi_id, escrow));
        SignedWrite {
            upi_id: upi_id.clone(),
            signer: self.signer(),
            escrow_address: escrow.copied(),
            signature: hex::encode(signature.to_bytes()),
        }
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let response = self.http.get(url).send().await.map_err(read_error)?;
        decode_response(response).await
    }

    async fn post_write(&self, path: &str, body: &SignedWrite) -> OperationResult {
        let url = match self.endpoint(path) {
            Ok(url) => url,
            Err(e) => return OperationResult::failed(FailureReason::Rejected(e.to_string())),
        };
        let response = match self.http.post(url).json(body).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return OperationResult::failed(FailureReason::Timeout),
            Err(e) => return OperationResult::failed(FailureReason::Unavailable(e.to_string())),
        };
        let status = response.status();
        if status.is_success() {
            // A 2xx means the write landed, even if the receipt is unreadable.
            let reference = response
                .json::<WriteReceipt>()
                .await
                .ok()
                .and_then(|receipt| receipt.reference);
            return OperationResult {
                committed: true,
                reference,
                failure_reason: None,
            };
        }
        let message = error_message(response).await;
        let reason = match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FailureReason::Timeout,
            s if s.is_client_error() => FailureReason::Rejected(message),
            _ => FailureReason::Unavailable(format!("status {}: {message}", status.as_u16())),
        };
        OperationResult::failed(reason)
    }
}

/// Digest signed for a write of `kind`.
pub fn write_digest(kind: WriteKind, upi_id: &UpiId, escrow: Option<&Address>) -> [u8; 32] {
    let domain = match kind {
        WriteKind::Register => REGISTER_DOMAIN,
        WriteKind::Remove => REMOVE_DOMAIN,
        WriteKind::LinkEscrow => LINK_ESCROW_DOMAIN,
    };
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(upi_id.as_str().as_bytes());
    if let Some(escrow) = escrow {
        hasher.update(escrow.as_bytes());
    }
    hasher.finalize().into()
}

async fn decode_response<T>(response: Response) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let message = format!("status {}: {}", status.as_u16(), error_message(response).await);
        return Err(if status.is_server_error() {
            ClientError::Unavailable(message)
        } else {
            ClientError::Protocol(message)
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ClientError::Protocol(e.to_string()))
}

fn read_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Unavailable(e.to_string())
    }
}

async fn error_message(response: Response) -> String {
    let bytes = response.bytes().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_slice::<ApiErrorResponse>(&bytes) {
        if let Some(message) = api_error.message {
            return match api_error.code {
                Some(code) => format!("{code}: {message}"),
                None => message,
            };
        }
    }
    String::from_utf8_lossy(&bytes).to_string()
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    fn signer(&self) -> Address {
        Address(self.signing_key.verifying_key().to_bytes())
    }

    async fn exists(&self, upi_id: &UpiId) -> Result<bool, ClientError> {
        match self.owner_of(upi_id).await {
            Ok(_) => Ok(true),
            Err(ClientError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn owner_of(&self, upi_id: &UpiId) -> Result<Address, ClientError> {
        let url = self.endpoint(&format!("mappings/{upi_id}"))?;
        let response = self.http.get(url).send().await.map_err(read_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound {
                upi_id: upi_id.clone(),
            });
        }
        let mapping: MappingResponse = decode_response(response).await?;
        if &mapping.upi_id != upi_id {
            return Err(ClientError::Protocol(format!(
                "asked for {upi_id}, registry answered for {}",
                mapping.upi_id
            )));
        }
        Ok(mapping.owner)
    }

    async fn submit_register(&self, upi_id: &UpiId) -> OperationResult {
        let body = self.sign_write(WriteKind::Register, upi_id, None);
        self.post_write("mappings/register", &body).await
    }

    async fn submit_remove(&self, upi_id: &UpiId) -> OperationResult {
        let body = self.sign_write(WriteKind::Remove, upi_id, None);
        self.post_write("mappings/remove", &body).await
    }

    async fn submit_link_escrow(&self, upi_id: &UpiId, escrow: &Address) -> OperationResult {
        let body = self.sign_write(WriteKind::LinkEscrow, upi_id, Some(escrow));
        self.post_write("escrows/link", &body).await
    }

    async fn list_mappings_of(&self, owner: &Address) -> Result<Vec<UpiId>, ClientError> {
        let response: OwnerMappingsResponse =
            self.get_json(&format!("owners/{owner}/mappings")).await?;
        Ok(response.upi_ids)
    }

    async fn list_escrows_of(&self, owner: &Address) -> Result<Vec<RemoteEscrow>, ClientError> {
        let response: OwnerEscrowsResponse =
            self.get_json(&format!("owners/{owner}/escrows")).await?;
        Ok(response.escrows)
    }
}

/// Body of every write request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedWrite {
    pub upi_id: UpiId,
    pub signer: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow_address: Option<Address>,
    /// Hex-encoded Ed25519 signature over [`write_digest`].
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct WriteReceipt {
    #[serde(default)]
    reference: Option<TxRef>,
}

#[derive(Debug, Deserialize)]
struct MappingResponse {
    upi_id: UpiId,
    owner: Address,
}

#[derive(Debug, Deserialize)]
struct OwnerMappingsResponse {
    #[serde(default)]
    upi_ids: Vec<UpiId>,
}

#[derive(Debug, Deserialize)]
struct OwnerEscrowsResponse {
    #[serde(default)]
    escrows: Vec<RemoteEscrow>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    code: Option<String>,
    message: Option<String>,
}
