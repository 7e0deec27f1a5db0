//! ---
//! ivsim_section: "06-security-access-control"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Device key derivation and shared access signatures."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::form_urlencoded::byte_serialize;

type HmacSha256 = Hmac<Sha256>;

/// Failures while deriving keys or signing tokens.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Neither a device key nor a group key was supplied.
    #[error("no device key or group key available for {0}")]
    MissingKey(String),
    /// A key was not valid base64.
    #[error("{which} is not valid base64: {source}")]
    InvalidKey {
        /// Which key failed to decode.
        which: &'static str,
        /// Decoder error.
        #[source]
        source: base64::DecodeError,
    },
    /// The HMAC implementation rejected the key length.
    #[error("HMAC key rejected: {0}")]
    Hmac(#[from] hmac::digest::InvalidLength),
}

/// Derive a per-device key from an enrollment group key.
///
/// The result is `base64(HMAC-SHA256(base64_decode(group_key), device_id))`.
pub fn derive_device_key(group_key: &str, device_id: &str) -> Result<String, CredentialError> {
    let key = BASE64
        .decode(group_key.trim())
        .map_err(|source| CredentialError::InvalidKey {
            which: "group key",
            source,
        })?;
    let mut mac = HmacSha256::new_from_slice(&key)?;
    mac.update(device_id.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Short, non-reversible identifier for a base64 key, safe to log.
pub fn key_fingerprint(key: &str) -> String {
    let bytes = BASE64.decode(key.trim()).unwrap_or_else(|_| key.as_bytes().to_vec());
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..8])
}

/// Symmetric-key identity of a simulated device.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    /// Registration / device identifier.
    pub device_id: String,
    /// Base64 symmetric key.
    pub device_key: String,
    /// True when the key was derived from a group key.
    pub derived: bool,
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("device_id", &self.device_id)
            .field("device_key", &"<redacted>")
            .field("fingerprint", &key_fingerprint(&self.device_key))
            .field("derived", &self.derived)
            .finish()
    }
}

impl DeviceCredentials {
    /// Pick the explicit device key, else derive one from the group key.
    pub fn resolve(
        device_id: &str,
        device_key: Option<&str>,
        group_key: Option<&str>,
    ) -> Result<Self, CredentialError> {
        if let Some(key) = non_empty(device_key) {
            BASE64
                .decode(key)
                .map_err(|source| CredentialError::InvalidKey {
                    which: "device key",
                    source,
                })?;
            return Ok(Self {
                device_id: device_id.to_owned(),
                device_key: key.to_owned(),
                derived: false,
            });
        }
        let group_key = non_empty(group_key)
            .ok_or_else(|| CredentialError::MissingKey(device_id.to_owned()))?;
        let device_key = derive_device_key(group_key, device_id)?;
        debug!(
            device_id,
            fingerprint = %key_fingerprint(&device_key),
            "derived device key from group key"
        );
        Ok(Self {
            device_id: device_id.to_owned(),
            device_key,
            derived: true,
        })
    }

    /// Sign a token for `resource` valid for `ttl` from now.
    pub fn sign(
        &self,
        resource: &str,
        key_name: Option<&str>,
        ttl: Duration,
    ) -> Result<SasToken, CredentialError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        SasToken::generate(resource, &self.device_key, key_name, Utc::now() + ttl)
    }
}

/// Shared access signature authorising requests against `resource`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    resource: String,
    signature: String,
    expiry: i64,
    key_name: Option<String>,
}

impl SasToken {
    /// Sign `urlencode(resource) + "\n" + expiry` with the base64 `key`.
    pub fn generate(
        resource: &str,
        key: &str,
        key_name: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, CredentialError> {
        let secret = BASE64
            .decode(key.trim())
            .map_err(|source| CredentialError::InvalidKey {
                which: "signing key",
                source,
            })?;
        let resource = encode(resource);
        let expiry = expires_at.timestamp();
        let mut mac = HmacSha256::new_from_slice(&secret)?;
        mac.update(format!("{resource}\n{expiry}").as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        Ok(Self {
            resource,
            signature,
            expiry,
            key_name: key_name.map(str::to_owned),
        })
    }

    /// Expiry as seconds since the Unix epoch.
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    /// Base64 signature before URL encoding.
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SharedAccessSignature sr={}&sig={}&se={}",
            self.resource,
            encode(&self.signature),
            self.expiry
        )?;
        if let Some(name) = &self.key_name {
            write!(f, "&skn={}", encode(name))?;
        }
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}
