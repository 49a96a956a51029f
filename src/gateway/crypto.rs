// =============================================================================
// Credential encryption — AES-256-GCM with versioned master keys
// =============================================================================
//
// Wire format: `ENC[v{version}]:base64(nonce || ciphertext || tag)`.
// Master keys load from the process environment: `MASTER_ENCRYPTION_KEY` is
// version 1, `MASTER_ENCRYPTION_KEY_V2` is version 2, and so on. New
// encryptions always use the highest loaded version; decryption parses the
// version embedded in the ciphertext.
//
// A key value of exactly 64 hex characters is decoded as raw key bytes; any
// other string is digested with SHA-256 into a 32-byte key.
// =============================================================================

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::CoreError;

const ENV_BASE: &str = "MASTER_ENCRYPTION_KEY";
/// Highest suffix probed when scanning the environment for key versions.
const MAX_KEY_VERSION: u32 = 16;
const NONCE_LEN: usize = 12;

/// Version-aware multi-key manager for credential encryption.
pub struct KeyManager {
    keys: BTreeMap<u32, [u8; 32]>,
}

impl KeyManager {
    /// Load all `MASTER_ENCRYPTION_KEY[_Vn]` variables from the environment.
    pub fn from_env() -> Result<Self, CoreError> {
        let mut keys = BTreeMap::new();
        if let Ok(raw) = std::env::var(ENV_BASE) {
            keys.insert(1, Self::parse_master_key(&raw)?);
        }
        for version in 2..=MAX_KEY_VERSION {
            if let Ok(raw) = std::env::var(format!("{ENV_BASE}_V{version}")) {
                keys.insert(version, Self::parse_master_key(&raw)?);
            }
        }
        if keys.is_empty() {
            return Err(CoreError::Config(format!(
                "no master encryption key loaded (set {ENV_BASE})"
            )));
        }
        info!(
            versions = ?keys.keys().collect::<Vec<_>>(),
            "encryption key manager initialised"
        );
        Ok(Self { keys })
    }

    /// Build a manager from explicit key material (tests, embedded setups).
    pub fn from_keys(raw: impl IntoIterator<Item = (u32, String)>) -> Result<Self, CoreError> {
        let mut keys = BTreeMap::new();
        for (version, value) in raw {
            keys.insert(version, Self::parse_master_key(&value)?);
        }
        if keys.is_empty() {
            return Err(CoreError::Config("no master encryption key provided".into()));
        }
        Ok(Self { keys })
    }

    fn parse_master_key(raw: &str) -> Result<[u8; 32], CoreError> {
        let trimmed = raw.trim();
        if trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            let bytes = hex::decode(trimmed)
                .map_err(|e| CoreError::Config(format!("bad hex master key: {e}")))?;
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(key);
        }
        // Arbitrary passphrase: derive a fixed-width key.
        let digest = Sha256::digest(trimmed.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(key)
    }

    /// Highest loaded version, used for all new encryptions.
    pub fn current_version(&self) -> u32 {
        *self.keys.keys().next_back().expect("at least one key loaded")
    }

    pub fn has_version(&self, version: u32) -> bool {
        self.keys.contains_key(&version)
    }

    // -------------------------------------------------------------------------
    // Encrypt / decrypt
    // -------------------------------------------------------------------------

    /// Encrypt with the current key version under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CoreError> {
        let version = self.current_version();
        let key = self.keys[&version];
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CoreError::Crypto("encryption failed".into()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("ENC[v{version}]:{}", BASE64.encode(payload)))
    }

    /// Decrypt by parsing the version embedded in the serialised form.
    pub fn decrypt(&self, serialized: &str) -> Result<String, CoreError> {
        let (version, payload) = Self::parse_envelope(serialized)?;
        let key = self.keys.get(&version).ok_or_else(|| {
            CoreError::Crypto(format!("key version {version} is not loaded"))
        })?;

        let raw = BASE64
            .decode(payload)
            .map_err(|e| CoreError::Crypto(format!("bad base64 payload: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(CoreError::Crypto("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::Crypto("decryption failed (bad key or tampered data)".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| CoreError::Crypto("decrypted payload is not UTF-8".into()))
    }

    /// Decrypt-then-encrypt with the current version. Used to migrate rows
    /// off retired key versions.
    pub fn reencrypt(&self, serialized: &str) -> Result<String, CoreError> {
        let plaintext = self.decrypt(serialized)?;
        let out = self.encrypt(&plaintext)?;
        debug!("credential re-encrypted to current key version");
        Ok(out)
    }

    /// Version embedded in a serialised ciphertext, without decrypting.
    pub fn embedded_version(serialized: &str) -> Result<u32, CoreError> {
        Ok(Self::parse_envelope(serialized)?.0)
    }

    fn parse_envelope(serialized: &str) -> Result<(u32, &str), CoreError> {
        let rest = serialized
            .strip_prefix("ENC[v")
            .ok_or_else(|| CoreError::Crypto("missing ENC[v..] prefix".into()))?;
        let close = rest
            .find("]:")
            .ok_or_else(|| CoreError::Crypto("malformed ENC envelope".into()))?;
        let version: u32 = rest[..close]
            .parse()
            .map_err(|_| CoreError::Crypto("bad key version in envelope".into()))?;
        Ok((version, &rest[close + 2..]))
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .field("keys", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> KeyManager {
        KeyManager::from_keys([(1, "test-passphrase-one".to_string())]).unwrap()
    }

    #[test]
    fn roundtrip_recovers_plaintext() {
        let km = manager();
        let ct = km.encrypt("api-secret-123").unwrap();
        assert!(ct.starts_with("ENC[v1]:"));
        assert_eq!(km.decrypt(&ct).unwrap(), "api-secret-123");
    }

    #[test]
    fn same_plaintext_distinct_ciphertexts() {
        let km = manager();
        let a = km.encrypt("same").unwrap();
        let b = km.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(km.decrypt(&a).unwrap(), km.decrypt(&b).unwrap());
    }

    #[test]
    fn new_encryptions_use_highest_version() {
        let km = KeyManager::from_keys([
            (1, "old-key".to_string()),
            (3, "new-key".to_string()),
        ])
        .unwrap();
        assert_eq!(km.current_version(), 3);
        let ct = km.encrypt("x").unwrap();
        assert!(ct.starts_with("ENC[v3]:"));
        assert_eq!(KeyManager::embedded_version(&ct).unwrap(), 3);
    }

    #[test]
    fn decrypt_requires_matching_version() {
        let old = KeyManager::from_keys([(1, "old-key".to_string())]).unwrap();
        let ct = old.encrypt("secret").unwrap();

        let new_only = KeyManager::from_keys([(2, "new-key".to_string())]).unwrap();
        let err = new_only.decrypt(&ct).unwrap_err();
        assert_eq!(err.code(), "CRYPTO");
    }

    #[test]
    fn reencrypt_upgrades_version() {
        let both = KeyManager::from_keys([
            (1, "old-key".to_string()),
            (2, "new-key".to_string()),
        ])
        .unwrap();
        let old = KeyManager::from_keys([(1, "old-key".to_string())]).unwrap();
        let v1 = old.encrypt("secret").unwrap();
        let v2 = both.reencrypt(&v1).unwrap();
        assert!(v2.starts_with("ENC[v2]:"));
        assert_eq!(both.decrypt(&v2).unwrap(), "secret");
    }

    #[test]
    fn hex_key_is_used_verbatim() {
        let hex_key = "00".repeat(32);
        let km = KeyManager::from_keys([(1, hex_key)]).unwrap();
        let ct = km.encrypt("x").unwrap();
        assert_eq!(km.decrypt(&ct).unwrap(), "x");
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let km = manager();
        let ct = km.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(ct.strip_prefix("ENC[v1]:").unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = format!("ENC[v1]:{}", BASE64.encode(raw));
        assert!(km.decrypt(&tampered).is_err());
    }

    #[test]
    fn malformed_envelopes_rejected() {
        let km = manager();
        assert!(km.decrypt("not-enc").is_err());
        assert!(km.decrypt("ENC[vX]:abc").is_err());
        assert!(km.decrypt("ENC[v1]:!!!").is_err());
        assert!(km.decrypt("ENC[v1]:AAAA").is_err());
    }
}
