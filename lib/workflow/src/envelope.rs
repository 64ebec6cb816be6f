//! Versioned wrapper for persisted execution records.
//!
//! Stored bytes carry a format version so that a node running an older
//! build refuses records written in a newer format instead of misreading
//! them.

use serde::{Deserialize, Serialize};

/// Format version written by this build.
pub const CURRENT_VERSION: u32 = 1;

/// A payload tagged with its format version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Format version of the payload.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload at the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    /// Unwraps the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Encodes the envelope as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Errors from opening stored bytes.
#[derive(Debug)]
pub enum EnvelopeError {
    /// The bytes are not a valid envelope or payload.
    Decode(serde_json::Error),
    /// The record was written by a newer build.
    UnsupportedVersion { version: u32 },
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "invalid envelope: {e}"),
            Self::UnsupportedVersion { version } => write!(
                f,
                "envelope version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        }
    }
}

impl std::error::Error for EnvelopeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::UnsupportedVersion { .. } => None,
        }
    }
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e)
    }
}

/// An envelope whose payload has not been decoded yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnvelope {
    /// Format version of the payload.
    pub version: u32,
    /// Undecoded payload.
    pub payload: serde_json::Value,
}

impl RawEnvelope {
    /// Parses the envelope header from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not an envelope.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Decodes the payload, refusing versions newer than this build.
    ///
    /// # Errors
    ///
    /// Returns an error if the version is unsupported or the payload does
    /// not decode as `T`.
    pub fn open<T: for<'de> Deserialize<'de>>(self) -> Result<Envelope<T>, EnvelopeError> {
        if self.version > CURRENT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                version: self.version,
            });
        }
        let payload: T = serde_json::from_value(self.payload)?;
        Ok(Envelope {
            version: self.version,
            payload,
        })
    }
}

/// Decodes stored bytes into a payload.
///
/// # Errors
///
/// Returns an error if the bytes are not a supported envelope of `T`.
pub fn open_bytes<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    Ok(RawEnvelope::from_json_bytes(bytes)?.open()?.into_payload())
}
