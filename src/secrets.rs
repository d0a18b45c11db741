//! Credential vault — platform passwords and resumable session state,
//! sealed with AES-256-GCM before they touch disk.
//!
//! Every seal generates a fresh random 96-bit nonce via the system CSPRNG.
//! Nonce reuse would be catastrophic for GCM security.

use std::sync::Arc;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::CredentialError;
use crate::store::Database;

/// Decrypted login material for one account.
pub struct AccountCredentials {
    pub password: SecretString,
    /// Opaque serialized session state from a previous login, if any.
    /// Resuming a session avoids a fresh password login on every cycle.
    pub session: Option<String>,
}

/// Storage for per-account credentials.
pub trait CredentialVault: Send + Sync {
    fn store(
        &self,
        account_id: &str,
        credentials: &AccountCredentials,
    ) -> Result<(), CredentialError>;

    fn load(&self, account_id: &str) -> Result<AccountCredentials, CredentialError>;

    /// Persist refreshed session state without touching the password.
    fn update_session(&self, account_id: &str, session: &str) -> Result<(), CredentialError>;
}

#[derive(Deserialize)]
struct CredentialPayload {
    password: String,
    session: Option<String>,
}

/// AES-256-GCM vault over the `credentials` table.
pub struct SealedVault {
    db: Arc<Database>,
    key: [u8; 32],
}

impl SealedVault {
    pub fn new(db: Arc<Database>, key: [u8; 32]) -> Self {
        Self { db, key }
    }

    /// Build the vault key from the environment: `DRIPLINE_VAULT_KEY` as
    /// 64 hex characters, or the SHA-256 of `DRIPLINE_SECRET` as a fallback.
    pub fn from_env(db: Arc<Database>) -> Result<Self, CredentialError> {
        if let Ok(hex_key) = std::env::var("DRIPLINE_VAULT_KEY") {
            let bytes = hex::decode(hex_key.trim())
                .map_err(|e| CredentialError::Key(format!("DRIPLINE_VAULT_KEY is not hex: {e}")))?;
            let key: [u8; 32] = bytes.try_into().map_err(|_| {
                CredentialError::Key("DRIPLINE_VAULT_KEY must be 64 hex characters".into())
            })?;
            return Ok(Self::new(db, key));
        }
        if let Ok(secret) = std::env::var("DRIPLINE_SECRET") {
            let digest = digest::digest(&digest::SHA256, secret.as_bytes());
            let mut key = [0u8; 32];
            key.copy_from_slice(digest.as_ref());
            return Ok(Self::new(db, key));
        }
        Err(CredentialError::Key(
            "set DRIPLINE_VAULT_KEY or DRIPLINE_SECRET".into(),
        ))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; 12]), CredentialError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| CredentialError::Key("failed to create AES-256-GCM key".into()))?;
        let sealing_key = LessSafeKey::new(unbound);

        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; 12];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| CredentialError::Key("failed to generate random nonce".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CredentialError::Key("AES-256-GCM encryption failed".into()))?;
        Ok((in_out, nonce_bytes))
    }

    fn open(&self, nonce_bytes: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| CredentialError::Key("failed to create AES-256-GCM key".into()))?;
        let opening_key = LessSafeKey::new(unbound);

        let nonce_bytes: [u8; 12] = nonce_bytes
            .try_into()
            .map_err(|_| CredentialError::DecryptFailed("stored nonce has wrong length".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = ciphertext.to_vec();
        let plaintext = opening_key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| {
                CredentialError::DecryptFailed("wrong key or corrupted ciphertext".into())
            })?;
        Ok(plaintext.to_vec())
    }

    fn write_payload(&self, account_id: &str, payload: &str) -> Result<(), CredentialError> {
        let (ciphertext, nonce) = self.seal(payload.as_bytes())?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO credentials (account_id, nonce, ciphertext) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id) DO UPDATE SET
                nonce = excluded.nonce, ciphertext = excluded.ciphertext",
            rusqlite::params![account_id, nonce.as_slice(), ciphertext],
        )
        .map_err(crate::error::StoreError::from)?;
        Ok(())
    }

    fn read_payload(&self, account_id: &str) -> Result<CredentialPayload, CredentialError> {
        let (nonce, ciphertext): (Vec<u8>, Vec<u8>) = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT nonce, ciphertext FROM credentials WHERE account_id = ?1",
                rusqlite::params![account_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    CredentialError::NotFound(account_id.to_string())
                }
                other => CredentialError::Store(other.into()),
            })?
        };
        let plaintext = self.open(&nonce, &ciphertext)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| CredentialError::DecryptFailed(format!("payload is not valid JSON: {e}")))
    }
}

impl CredentialVault for SealedVault {
    fn store(
        &self,
        account_id: &str,
        credentials: &AccountCredentials,
    ) -> Result<(), CredentialError> {
        let payload = serde_json::json!({
            "password": credentials.password.expose_secret(),
            "session": credentials.session,
        })
        .to_string();
        self.write_payload(account_id, &payload)
    }

    fn load(&self, account_id: &str) -> Result<AccountCredentials, CredentialError> {
        let payload = self.read_payload(account_id)?;
        Ok(AccountCredentials {
            password: payload.password.into(),
            session: payload.session,
        })
    }

    fn update_session(&self, account_id: &str, session: &str) -> Result<(), CredentialError> {
        let mut payload = self.read_payload(account_id)?;
        payload.session = Some(session.to_string());
        let updated = serde_json::json!({
            "password": payload.password,
            "session": payload.session,
        })
        .to_string();
        self.write_payload(account_id, &updated)
    }
}
