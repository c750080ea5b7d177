//! Terminal configuration
//!
//! Every field has a default, so an empty document is a valid configuration
//! apart from the trust anchor, which must always be given.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    card::DEFAULT_EXCHANGE_TIMEOUT,
    credential::{
        CredentialReader, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_OBJECT_SIZE, DEVICE_CERTIFICATE_FILE,
        SC_HSM_AID, TrustAnchor,
    },
    engine::DEFAULT_BLINK_INTERVAL,
    terminal::DEFAULT_POLL_INTERVAL,
};

/// Errors turning configuration into runtime objects
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A hex field could not be decoded
    #[error("Invalid hex in {field}: {source}")]
    InvalidHex {
        /// Name of the field
        field: &'static str,
        /// Decoding error
        source: hex::FromHexError,
    },

    /// No trust anchor configured
    #[error("No trust anchor configured")]
    MissingTrustAnchor,

    /// The anchor key is not a valid secp256k1 point
    #[error("Trust anchor public key is not a valid secp256k1 point")]
    InvalidPublicKey,
}

/// Complete terminal configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Reader selection
    pub reader: ReaderConfig,
    /// Credential object location
    pub credential: CredentialConfig,
    /// Root of trust
    pub trust_anchor: Option<TrustAnchorConfig>,
    /// Intervals and timeouts
    pub timing: TimingConfig,
    /// PIN policy
    pub pin: PinConfig,
}

/// Reader selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Reader name, first available when unset
    pub name: Option<String>,
    /// Connect in exclusive mode
    pub exclusive: bool,
}

/// Where the credential object lives on the card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Application to select as hex, empty to skip selection
    ///
    /// Must identify the access applet, not a stock SmartCard-HSM.
    pub aid: Option<String>,
    /// Elementary file id
    pub file_id: u16,
    /// Bytes per READ BINARY
    pub chunk_size: u8,
    /// Upper bound on the object size
    pub max_size: usize,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            aid: Some(hex::encode_upper(SC_HSM_AID)),
            file_id: DEVICE_CERTIFICATE_FILE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

impl CredentialConfig {
    /// Build the credential reader
    pub fn credential_reader(&self) -> Result<CredentialReader, ConfigError> {
        let aid = match self.aid.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(aid) => Some(Bytes::from(hex::decode(aid).map_err(|source| {
                ConfigError::InvalidHex {
                    field: "aid",
                    source,
                }
            })?)),
        };

        Ok(CredentialReader::new()
            .with_aid(aid)
            .with_file_id(self.file_id)
            .with_chunk_size(self.chunk_size)
            .with_max_size(self.max_size))
    }
}

/// Root of trust as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchorConfig {
    /// Holder reference of the root certificate
    pub holder: String,
    /// SEC1 encoded root public key as hex
    pub public_key: String,
}

impl TrustAnchorConfig {
    /// Decode the anchor
    pub fn trust_anchor(&self) -> Result<TrustAnchor, ConfigError> {
        let key = hex::decode(self.public_key.trim()).map_err(|source| ConfigError::InvalidHex {
            field: "trust_anchor.public_key",
            source,
        })?;
        TrustAnchor::from_sec1(self.holder.clone(), &key).map_err(|_| ConfigError::InvalidPublicKey)
    }
}

/// Intervals and timeouts in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause between presence probes
    pub poll_interval_ms: u64,
    /// Bound on one card exchange
    pub exchange_timeout_ms: u64,
    /// Pause between denial blink steps
    pub blink_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            exchange_timeout_ms: DEFAULT_EXCHANGE_TIMEOUT.as_millis() as u64,
            blink_interval_ms: DEFAULT_BLINK_INTERVAL.as_millis() as u64,
        }
    }
}

impl TimingConfig {
    /// Pause between presence probes
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Bound on one card exchange
    pub const fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    /// Pause between denial blink steps
    pub const fn blink_interval(&self) -> Duration {
        Duration::from_millis(self.blink_interval_ms)
    }
}

/// How the PIN is obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    /// Never ask; the channel handshake alone grants
    #[default]
    None,
    /// Read from the PIN pad
    Pad,
    /// Use the configured value
    Fixed,
}

/// PIN policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    /// Source of the PIN
    pub mode: PinMode,
    /// PIN for [`PinMode::Fixed`]
    pub value: Option<String>,
    /// How long to wait for PIN pad entry, forever when unset
    pub entry_timeout_ms: Option<u64>,
}

impl PinConfig {
    /// PIN pad entry timeout
    pub fn entry_timeout(&self) -> Option<Duration> {
        self.entry_timeout_ms.map(Duration::from_millis)
    }
}

impl TerminalConfig {
    /// The configured trust anchor
    pub fn trust_anchor(&self) -> Result<TrustAnchor, ConfigError> {
        self.trust_anchor
            .as_ref()
            .ok_or(ConfigError::MissingTrustAnchor)?
            .trust_anchor()
    }

    /// The configured credential reader
    pub fn credential_reader(&self) -> Result<CredentialReader, ConfigError> {
        self.credential.credential_reader()
    }
}
