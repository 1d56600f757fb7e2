//! Bridge configuration files.
//!
//! A configuration is a JSON document, stored either as plain text or
//! encrypted with AES-256-GCM under a passphrase. The encrypted form is the
//! base64 encoding of a 12 byte nonce followed by the ciphertext.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use base64::Engine;
use ring::{
    aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey},
    digest::{SHA256, digest},
    rand::{SecureRandom, SystemRandom},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    auth::ClientConfigs,
    error::{Error, Result},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// OAuth clients keyed by issuer.
    #[serde(default)]
    pub clients: ClientConfigs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_file: Option<PathBuf>,
    /// Serve elicitation through a local page. On unless set to `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_token_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_exchange_header: Option<String>,
}

impl BridgeConfig {
    /// Load from a `path` or `path|key` location. `key` applies when the
    /// location carries none.
    pub fn load(location: &str, key: Option<&str>) -> Result<Self> {
        let (path, embedded) = split_location(location);
        let key = embedded.or(key);
        let data = std::fs::read(path)?;
        debug!("Loading configuration from {}", path.display());
        match key {
            Some(key) => {
                let text = std::str::from_utf8(&data).map_err(|_| {
                    Error::InvalidConfiguration("encrypted configuration is not text".into())
                })?;
                Self::from_slice(&decrypt(text, key)?)
            }
            None => Self::from_slice(&data),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::InvalidConfiguration(format!("bad configuration: {e}")))
    }

    pub fn elicitation_enabled(&self) -> bool {
        self.elicitation.unwrap_or(true)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_secs.map(Duration::from_secs)
    }

    pub fn rejected_token_ttl(&self) -> Option<Duration> {
        self.rejected_token_ttl_secs.map(Duration::from_secs)
    }
}

/// Split `path|key` on the last `|`.
pub fn split_location(location: &str) -> (&Path, Option<&str>) {
    match location.rsplit_once('|') {
        Some((path, key)) if !key.is_empty() => (Path::new(path), Some(key)),
        Some((path, _)) => (Path::new(path), None),
        None => (Path::new(location), None),
    }
}

fn cipher_key(passphrase: &str) -> Result<LessSafeKey> {
    let hash = digest(&SHA256, passphrase.as_bytes());
    let key = UnboundKey::new(&AES_256_GCM, hash.as_ref())
        .map_err(|_| Error::InvalidConfiguration("cannot derive key".into()))?;
    Ok(LessSafeKey::new(key))
}

/// Encrypt `plaintext` into the on-disk form.
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> Result<String> {
    let key = cipher_key(passphrase)?;
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| Error::InternalError("no randomness available".into()))?;
    let mut sealed = plaintext.to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
        .map_err(|_| Error::InternalError("encryption failed".into()))?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&sealed);
    Ok(base64::engine::general_purpose::STANDARD.encode(out))
}

pub fn decrypt(encoded: &str, passphrase: &str) -> Result<Vec<u8>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidConfiguration(format!("encrypted configuration: {e}")))?;
    if bytes.len() < NONCE_LEN {
        return Err(Error::InvalidConfiguration(
            "encrypted configuration is truncated".into(),
        ));
    }
    let (nonce, sealed) = bytes.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| Error::InvalidConfiguration("bad nonce".into()))?;
    let key = cipher_key(passphrase)?;
    let mut sealed = sealed.to_vec();
    let plain = key
        .open_in_place(nonce, Aad::empty(), &mut sealed)
        .map_err(|_| Error::InvalidConfiguration("wrong key or corrupted configuration".into()))?;
    Ok(plain.to_vec())
}
