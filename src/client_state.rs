//! Client state tokens.
//!
//! A token names a session (`client_id`) and the process that owns it
//! (`instance_id`). It travels to the client in the SSE endpoint URL or the
//! `MCP-Session-Id` header and comes back on every follow-up request.
//!
//! Two encodings exist:
//!
//! - **plain**: `base64url("<client_id>|<instance_id>")`, for local use
//! - **encrypted**: AES-256-GCM over the plain form, with the whole sealed
//!   payload signed by HMAC-SHA256. The signature is checked before any
//!   decryption is attempted.
//!
//! ```rust
//! use mcp_relay::{ClientStateCodec, InstanceId, SecretString};
//!
//! let codec = ClientStateCodec::new(Some(&SecretString::new("operator-key"))).unwrap();
//! let instance = InstanceId::new("host-1");
//! let token = codec.format("abc", &instance, true).unwrap();
//!
//! let state = codec.try_parse(&token, true).unwrap();
//! assert_eq!(state.client_id, "abc");
//! assert_eq!(state.instance_id, instance);
//! ```

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::InstanceId;
use crate::error::{Error, Result};
use crate::secret::SecretString;

type HmacSha256 = Hmac<Sha256>;

const SEPARATOR: char = '|';
const NONCE_LEN: usize = 12;
const MAC_LEN: usize = 32;
/// GCM tag length; the smallest ciphertext is an empty plaintext plus the tag
const TAG_LEN: usize = 16;

const ENC_KEY_LABEL: &[u8] = b"mcp-relay/client-state/encryption";
const MAC_KEY_LABEL: &[u8] = b"mcp-relay/client-state/signing";

/// Decoded contents of a client state token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    pub client_id: String,
    pub instance_id: InstanceId,
}

impl ClientState {
    pub fn new(client_id: impl Into<String>, instance_id: InstanceId) -> Self {
        Self {
            client_id: client_id.into(),
            instance_id,
        }
    }

    /// Whether the session lives in the process identified by `local`
    pub fn is_local(&self, local: &InstanceId) -> bool {
        &self.instance_id == local
    }
}

struct Keys {
    cipher: Aes256Gcm,
    mac_key: [u8; 32],
}

/// Formats and parses client state tokens.
///
/// Built once from the operator secret and shared. Without a secret only
/// plain tokens can be produced.
pub struct ClientStateCodec {
    keys: Option<Keys>,
}

impl std::fmt::Debug for ClientStateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStateCodec")
            .field("encryption", &self.keys.is_some())
            .finish()
    }
}

impl ClientStateCodec {
    pub fn new(secret: Option<&SecretString>) -> Result<Self> {
        let keys = match secret {
            Some(secret) if !secret.is_empty() => {
                let enc_key = derive_key(secret, ENC_KEY_LABEL)?;
                let mac_key = derive_key(secret, MAC_KEY_LABEL)?;
                Some(Keys {
                    cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&enc_key)),
                    mac_key,
                })
            }
            _ => None,
        };
        Ok(Self { keys })
    }

    /// Codec with no secret; only plain tokens
    pub fn plain() -> Self {
        Self { keys: None }
    }

    /// Whether a secret is configured, i.e. whether tokens should be encrypted
    pub fn encrypts(&self) -> bool {
        self.keys.is_some()
    }

    /// Produce a token for `client_id` owned by `instance_id`.
    pub fn format(&self, client_id: &str, instance_id: &InstanceId, encrypt: bool) -> Result<String> {
        for (field, value) in [("client id", client_id), ("instance id", instance_id.as_str())] {
            if value.is_empty() {
                return Err(Error::ClientState(format!("{} is empty", field)));
            }
            if value.contains(SEPARATOR) {
                return Err(Error::ClientState(format!(
                    "{} must not contain '{}'",
                    field, SEPARATOR
                )));
            }
        }
        let plain = format!("{}{}{}", client_id, SEPARATOR, instance_id.as_str());

        if !encrypt {
            return Ok(URL_SAFE_NO_PAD.encode(plain));
        }

        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::ClientState("no client state key configured".to_string()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = keys
            .cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|_| Error::ClientState("encryption failed".to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len() + MAC_LEN);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);

        let mut mac = new_mac(&keys.mac_key)?;
        mac.update(&payload);
        payload.extend_from_slice(&mac.finalize().into_bytes());

        Ok(URL_SAFE_NO_PAD.encode(payload))
    }

    /// Inverse of [`format`](Self::format). Any failure (bad encoding, bad
    /// signature, bad tag, wrong field count) yields `None`.
    pub fn try_parse(&self, token: &str, encrypt: bool) -> Option<ClientState> {
        let bytes = URL_SAFE_NO_PAD.decode(token.trim()).ok()?;

        let plain = if encrypt {
            self.open(&bytes)?
        } else {
            bytes
        };

        let plain = String::from_utf8(plain).ok()?;
        let mut fields = plain.split(SEPARATOR);
        let client_id = fields.next()?;
        let instance_id = fields.next()?;
        if fields.next().is_some() || client_id.is_empty() || instance_id.is_empty() {
            return None;
        }

        Some(ClientState::new(client_id, InstanceId::new(instance_id)))
    }

    fn open(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let keys = self.keys.as_ref()?;
        if bytes.len() < NONCE_LEN + TAG_LEN + MAC_LEN {
            return None;
        }

        let (payload, signature) = bytes.split_at(bytes.len() - MAC_LEN);
        let mut mac = new_mac(&keys.mac_key).ok()?;
        mac.update(payload);
        mac.verify_slice(signature).ok()?;

        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        keys.cipher.decrypt(Nonce::from_slice(nonce), sealed).ok()
    }
}

fn new_mac(key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| Error::ClientState(e.to_string()))
}

fn derive_key(secret: &SecretString, label: &[u8]) -> Result<[u8; 32]> {
    let mut mac = new_mac(secret.as_bytes())?;
    mac.update(label);
    let mut key = [0u8; 32];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}
