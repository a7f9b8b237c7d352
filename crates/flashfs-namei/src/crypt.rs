//! Encryption policies for names and symlink targets.
//!
//! Each policy gets its own AES-256-GCM key, derived from the master key
//! with HKDF-SHA256. Ciphertext is laid out as `nonce(12) || ct || tag(16)`.
//! A policy key must be added to the keyring before anything under that
//! policy can be encrypted or read back.

use std::collections::HashMap;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{NamespaceError, Result};
use crate::types::PolicyId;

/// Length of the random nonce prefixed to every ciphertext.
pub const NONCE_LEN: usize = 12;

/// Bytes added to a plaintext by `encrypt`.
pub const CIPHER_OVERHEAD: usize = NONCE_LEN + 16;

/// Encryption collaborator consumed by the namespace layer.
pub trait EncryptionProvider: Send + Sync {
    /// Whether a child with policy `child` may be linked under a parent with
    /// policy `parent`. An unencrypted parent accepts anything.
    fn policy_consistent(&self, parent: Option<PolicyId>, child: Option<PolicyId>) -> bool {
        match parent {
            None => true,
            Some(p) => child == Some(p),
        }
    }

    /// Returns true when the key for `policy` is loaded.
    fn has_key(&self, policy: PolicyId) -> bool;

    /// Encrypts `plain` under `policy`.
    fn encrypt(&self, policy: PolicyId, plain: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts `cipher` produced by `encrypt` under the same policy.
    fn decrypt(&self, policy: PolicyId, cipher: &[u8]) -> Result<Vec<u8>>;
}

/// 256-bit key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(pub [u8; 32]);

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial([REDACTED])")
    }
}

/// Keyring holding the master key and the loaded policy keys.
pub struct KeyringCrypto {
    master: KeyMaterial,
    keys: RwLock<HashMap<PolicyId, KeyMaterial>>,
}

impl KeyringCrypto {
    /// Creates a keyring with no policy keys loaded.
    pub fn new(master: KeyMaterial) -> Self {
        Self {
            master,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Derives and loads the key for `policy`.
    pub fn add_key(&self, policy: PolicyId) -> Result<()> {
        let hk = Hkdf::<Sha256>::new(None, &self.master.0);
        let mut okm = [0u8; 32];
        let mut info = b"flashfs-policy-key".to_vec();
        info.extend_from_slice(&policy.as_u64().to_le_bytes());
        hk.expand(&info, &mut okm)
            .map_err(|e| NamespaceError::Crypto(e.to_string()))?;
        self.keys.write().insert(policy, KeyMaterial(okm));
        okm.zeroize();
        debug!(policy = %policy, "policy key added");
        Ok(())
    }

    /// Evicts the key for `policy`.
    pub fn remove_key(&self, policy: PolicyId) {
        self.keys.write().remove(&policy);
    }

    fn cipher(&self, policy: PolicyId) -> Result<Aes256Gcm> {
        let keys = self.keys.read();
        let key = keys.get(&policy).ok_or(NamespaceError::KeyUnavailable)?;
        Aes256Gcm::new_from_slice(&key.0).map_err(|e| NamespaceError::Crypto(e.to_string()))
    }
}

impl EncryptionProvider for KeyringCrypto {
    fn has_key(&self, policy: PolicyId) -> bool {
        self.keys.read().contains_key(&policy)
    }

    fn encrypt(&self, policy: PolicyId, plain: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher(policy)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ct = cipher
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plain)
            .map_err(|e| NamespaceError::Crypto(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn decrypt(&self, policy: PolicyId, cipher: &[u8]) -> Result<Vec<u8>> {
        let aead = self.cipher(policy)?;
        if cipher.len() < CIPHER_OVERHEAD {
            return Err(NamespaceError::Corrupted(format!(
                "ciphertext of {} bytes",
                cipher.len()
            )));
        }
        let (nonce, ct) = cipher.split_at(NONCE_LEN);
        aead.decrypt(aes_gcm::Nonce::from_slice(nonce), ct)
            .map_err(|_| NamespaceError::Crypto("authentication failed".to_string()))
    }
}
