//! Key material for escrow wallets and the signing identity.
//!
//! Secrets are stored either as plain hex or encrypted with AES-256-GCM
//! under an argon2id-derived key. Nothing in this module talks to the
//! registry; only the derived [`Address`] ever leaves the process.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use upi_types::{Address, UpiId};
use zeroize::Zeroizing;

use crate::errors::{RegistryError, Result};

const KDF_LABEL: &str = "argon2id-v1";
const IDENTITY_FILE_VERSION: u8 = 1;

/// Generate a fresh Ed25519 keypair from the OS RNG.
pub fn generate_keypair() -> (Zeroizing<[u8; 32]>, Address) {
    let mut secret = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *secret);

    let signing_key = SigningKey::from_bytes(&secret);
    let address = Address::new(signing_key.verifying_key().to_bytes());
    (secret, address)
}

/// Secret key as persisted locally.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "protection", rename_all = "snake_case")]
pub enum KeySecret {
    Plain {
        private_key_hex: String,
    },
    PasswordProtected {
        ciphertext: String,
        nonce: String,
        salt: String,
        kdf: String,
    },
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySecret::Plain { .. } => f.write_str("KeySecret::Plain(<redacted>)"),
            KeySecret::PasswordProtected { kdf, .. } => {
                write!(f, "KeySecret::PasswordProtected({kdf}, <redacted>)")
            }
        }
    }
}

impl KeySecret {
    /// Seal `private_key`, encrypting it when a password is supplied.
    pub fn seal(private_key: &[u8; 32], password: Option<&str>) -> Result<Self> {
        match password {
            Some(pwd) => encrypt_private_key(private_key, pwd),
            None => Ok(KeySecret::Plain {
                private_key_hex: hex::encode(private_key),
            }),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, KeySecret::PasswordProtected { .. })
    }

    /// Recover the signing key. Password-protected secrets require `password`.
    pub fn unlock(&self, password: Option<&str>) -> Result<SigningKey> {
        let private_key = match self {
            KeySecret::Plain { private_key_hex } => {
                let bytes = Zeroizing::new(
                    hex::decode(private_key_hex)
                        .map_err(|err| RegistryError::KeyMaterial(err.to_string()))?,
                );
                let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    RegistryError::KeyMaterial(format!("expected 32 bytes, got {}", bytes.len()))
                })?;
                Zeroizing::new(key)
            }
            KeySecret::PasswordProtected {
                ciphertext,
                nonce,
                salt,
                ..
            } => {
                let pwd = password.ok_or_else(|| {
                    RegistryError::KeyMaterial("password required to unlock key".into())
                })?;
                decrypt_private_key(ciphertext, nonce, salt, pwd)?
            }
        };
        Ok(SigningKey::from_bytes(&private_key))
    }
}

/// Escrow wallet held locally for one mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowWallet {
    pub address: Address,
    pub key: KeySecret,
    /// Set once a remote link for this address committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_upi_id: Option<UpiId>,
    pub created_at: DateTime<Utc>,
}

impl EscrowWallet {
    /// Generate a new, unlinked escrow wallet.
    pub fn generate(password: Option<&str>) -> Result<Self> {
        let (secret, address) = generate_keypair();
        Ok(Self {
            address,
            key: KeySecret::seal(&secret, password)?,
            linked_upi_id: None,
            created_at: Utc::now(),
        })
    }

    pub fn is_linked(&self) -> bool {
        self.linked_upi_id.is_some()
    }

    /// Decrypt the escrow signing key and check it still matches the address.
    pub fn unlock(&self, password: Option<&str>) -> Result<SigningKey> {
        let signing_key = self.key.unlock(password)?;
        if signing_key.verifying_key().to_bytes() != *self.address.as_bytes() {
            return Err(RegistryError::KeyMaterial(
                "escrow key does not match its recorded address".into(),
            ));
        }
        Ok(signing_key)
    }
}

/// On-disk key file for the merchant identity that signs registry writes.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityKeyFile {
    pub version: u8,
    pub address: Address,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub secret: KeySecret,
}

impl IdentityKeyFile {
    pub fn generate(password: Option<&str>) -> Result<(Self, SigningKey)> {
        let (secret, address) = generate_keypair();
        let keyfile = Self {
            version: IDENTITY_FILE_VERSION,
            address,
            created_at: Utc::now(),
            secret: KeySecret::seal(&secret, password)?,
        };
        Ok((keyfile, SigningKey::from_bytes(&secret)))
    }

    /// Persist atomically; refuses to overwrite unless `force`.
    pub fn save(&self, path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            return Err(RegistryError::KeyMaterial(format!(
                "key file {} already exists (use --force to overwrite)",
                path.display()
            )));
        }
        let io_err = |err: std::io::Error| RegistryError::KeyMaterial(err.to_string());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp_path = tmp_path(path);
        let data = serde_json::to_vec_pretty(self)
            .map_err(|err| RegistryError::KeyMaterial(err.to_string()))?;
        fs::write(&tmp_path, data).map_err(io_err)?;
        fs::rename(tmp_path, path).map_err(io_err)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|err| {
            RegistryError::KeyMaterial(format!("failed to read {}: {err}", path.display()))
        })?;
        let keyfile: IdentityKeyFile = serde_json::from_slice(&data)
            .map_err(|err| RegistryError::KeyMaterial(err.to_string()))?;
        if keyfile.version != IDENTITY_FILE_VERSION {
            return Err(RegistryError::KeyMaterial(format!(
                "unsupported key file version {} (expected {})",
                keyfile.version, IDENTITY_FILE_VERSION
            )));
        }
        Ok(keyfile)
    }

    pub fn unlock(&self, password: Option<&str>) -> Result<SigningKey> {
        let signing_key = self.secret.unlock(password)?;
        if signing_key.verifying_key().to_bytes() != *self.address.as_bytes() {
            return Err(RegistryError::KeyMaterial(
                "address in key file does not match decrypted key".into(),
            ));
        }
        Ok(signing_key)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn encrypt_private_key(private_key: &[u8; 32], password: &str) -> Result<KeySecret> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_encryption_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|err| RegistryError::KeyMaterial(format!("cipher init failed: {err}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), private_key.as_slice())
        .map_err(|err| RegistryError::KeyMaterial(format!("encryption failed: {err}")))?;

    Ok(KeySecret::PasswordProtected {
        ciphertext: BASE64.encode(ciphertext),
        nonce: BASE64.encode(nonce_bytes),
        salt: BASE64.encode(salt),
        kdf: KDF_LABEL.to_string(),
    })
}

fn decrypt_private_key(
    ciphertext: &str,
    nonce: &str,
    salt: &str,
    password: &str,
) -> Result<Zeroizing<[u8; 32]>> {
    let decode = |field: &str, value: &str| {
        BASE64
            .decode(value)
            .map_err(|err| RegistryError::KeyMaterial(format!("invalid {field}: {err}")))
    };
    let ciphertext_bytes = decode("ciphertext", ciphertext)?;
    let nonce_bytes = decode("nonce", nonce)?;
    let salt_bytes = decode("salt", salt)?;

    let key = derive_encryption_key(password, &salt_bytes)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|err| RegistryError::KeyMaterial(format!("cipher init failed: {err}")))?;
    let nonce_array: [u8; 12] = nonce_bytes
        .as_slice()
        .try_into()
        .map_err(|_| RegistryError::KeyMaterial("nonce must be 12 bytes".into()))?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce_array), ciphertext_bytes.as_ref())
            .map_err(|_| RegistryError::KeyMaterial("decryption failed (wrong password?)".into()))?,
    );
    let key_bytes: [u8; 32] = plaintext.as_slice().try_into().map_err(|_| {
        RegistryError::KeyMaterial(format!("expected 32 byte key, got {} bytes", plaintext.len()))
    })?;
    Ok(Zeroizing::new(key_bytes))
}

fn derive_encryption_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut *key)
        .map_err(|err| RegistryError::KeyMaterial(format!("key derivation failed: {err}")))?;
    Ok(key)
}
