//! Encrypt-then-MAC protection for stored ticket payloads.
//!
//! [`AesHmacCipher`] produces `nonce || ciphertext || tag` where the
//! ciphertext is AES-256-GCM under the encryption key and the tag is
//! HMAC-SHA256 over `nonce || ciphertext` under a separate signing key.
//! Decoding checks the tag in constant time before decrypting and returns
//! `None` on any mismatch, so a tampered record looks exactly like a
//! missing one. The executor knows nothing about tickets.

use std::{fmt, sync::Arc};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{ConfigError, TicketError, TicketResult};

/// AES-GCM nonce length.
const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag length.
const GCM_TAG_SIZE: usize = 16;

/// HMAC-SHA256 output length.
const MAC_SIZE: usize = 32;

/// Required encryption key length (AES-256).
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Minimum signing key length.
pub const MIN_SIGNING_KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Symmetric protection applied to serialized tickets.
pub trait CipherExecutor: Send + Sync + fmt::Debug {
    /// Protects `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Cipher`] if encryption fails.
    fn encode(&self, plaintext: &[u8]) -> TicketResult<Vec<u8>>;

    /// Verifies and unwraps `encoded`. Any failure yields `None`.
    fn decode(&self, encoded: &[u8]) -> Option<Vec<u8>>;

    /// Returns `false` for the pass-through executor.
    fn is_enabled(&self) -> bool;
}

/// Pass-through executor used when encryption is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCipher;

impl CipherExecutor for NoOpCipher {
    fn encode(&self, plaintext: &[u8]) -> TicketResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decode(&self, encoded: &[u8]) -> Option<Vec<u8>> {
        Some(encoded.to_vec())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// AES-256-GCM encryption followed by an HMAC-SHA256 signature.
pub struct AesHmacCipher {
    cipher: Aes256Gcm,
    signing_key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for AesHmacCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesHmacCipher").finish_non_exhaustive()
    }
}

impl AesHmacCipher {
    /// Creates an executor from raw key material.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCipherKey`] if the encryption key is
    /// not 32 bytes or the signing key is shorter than 32 bytes.
    pub fn new(encryption_key: &[u8], signing_key: &[u8]) -> Result<Self, ConfigError> {
        if encryption_key.len() != ENCRYPTION_KEY_LEN {
            return Err(ConfigError::InvalidCipherKey {
                key: "encryption_key",
                reason: format!(
                    "expected {ENCRYPTION_KEY_LEN} bytes, got {}",
                    encryption_key.len()
                ),
            });
        }
        if signing_key.len() < MIN_SIGNING_KEY_LEN {
            return Err(ConfigError::InvalidCipherKey {
                key: "signing_key",
                reason: format!(
                    "expected at least {MIN_SIGNING_KEY_LEN} bytes, got {}",
                    signing_key.len()
                ),
            });
        }

        let cipher = Aes256Gcm::new_from_slice(encryption_key).map_err(|e| {
            ConfigError::InvalidCipherKey { key: "encryption_key", reason: e.to_string() }
        })?;
        Ok(Self { cipher, signing_key: Zeroizing::new(signing_key.to_vec()) })
    }

    fn mac(&self) -> Option<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.signing_key).ok()
    }
}

impl CipherExecutor for AesHmacCipher {
    fn encode(&self, plaintext: &[u8]) -> TicketResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| TicketError::cipher(format!("encryption failed: {e}")))?;

        let mut mac = self.mac().ok_or_else(|| TicketError::cipher("signing key rejected"))?;
        mac.update(&nonce_bytes);
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len() + MAC_SIZE);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn decode(&self, encoded: &[u8]) -> Option<Vec<u8>> {
        if encoded.len() < NONCE_SIZE + GCM_TAG_SIZE + MAC_SIZE {
            return None;
        }
        let (signed, tag) = encoded.split_at(encoded.len() - MAC_SIZE);

        let mut mac = self.mac()?;
        mac.update(signed);
        let expected = mac.finalize().into_bytes();
        if !bool::from(expected.as_slice().ct_eq(tag)) {
            return None;
        }

        let (nonce, ciphertext) = signed.split_at(NONCE_SIZE);
        self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Cipher settings. Keys are standard base64.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CipherConfig {
    /// Whether payload protection is on.
    #[serde(default)]
    pub(crate) enabled: bool,

    /// 32-byte AES key, base64.
    #[serde(default)]
    pub(crate) encryption_key: Option<String>,

    /// HMAC key of at least 32 bytes, base64.
    #[serde(default)]
    pub(crate) signing_key: Option<String>,
}

impl fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |key: &Option<String>| key.as_ref().map(|_| "<redacted>");
        f.debug_struct("CipherConfig")
            .field("enabled", &self.enabled)
            .field("encryption_key", &redact(&self.encryption_key))
            .field("signing_key", &redact(&self.signing_key))
            .finish()
    }
}

#[bon::bon]
impl CipherConfig {
    /// Creates a validated cipher configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the cipher is enabled and a key is
    /// missing, is not valid base64, or has the wrong length.
    #[builder]
    pub fn new(
        #[builder(default)] enabled: bool,
        #[builder(into)] encryption_key: Option<String>,
        #[builder(into)] signing_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self { enabled, encryption_key, signing_key };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// # Errors
    ///
    /// See [`CipherConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build_executor().map(|_| ())
    }

    /// Whether payload protection is on.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Builds the executor described by this configuration.
    ///
    /// # Errors
    ///
    /// See [`CipherConfig::new`].
    pub fn build_executor(&self) -> Result<Arc<dyn CipherExecutor>, ConfigError> {
        if !self.enabled {
            return Ok(Arc::new(NoOpCipher));
        }
        let encryption_key = decode_key("encryption_key", self.encryption_key.as_deref())?;
        let signing_key = decode_key("signing_key", self.signing_key.as_deref())?;
        Ok(Arc::new(AesHmacCipher::new(&encryption_key, &signing_key)?))
    }
}

fn decode_key(key: &'static str, value: Option<&str>) -> Result<Zeroizing<Vec<u8>>, ConfigError> {
    let value = value.ok_or(ConfigError::MissingCipherKey { key })?;
    BASE64
        .decode(value.trim())
        .map(Zeroizing::new)
        .map_err(|e| ConfigError::InvalidCipherKey { key, reason: e.to_string() })
}
