//! Shared identifiers, hex helpers and the error taxonomy for the relay.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod jsonrpc;

/// 0x-prefixed hex string (e.g. "0x1234...").
pub type Hex = String;

/// Value returned to legacy callers when a request fails for any reason.
pub const SENTINEL_FAILURE: &str = "0x";

/// Relay error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("account resolution failed: {0}")]
    AccountResolution(String),

    #[error("call building failed: {0}")]
    CallBuilding(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("chain query failed: {0}")]
    ChainQuery(String),

    #[error("no confirmation observed for operation {0}")]
    ConfirmationTimeout(OpHash),

    #[error("{0}")]
    Other(String),
}

/// Coarse grouping of [`RelayError`] used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    InputValidation,
    ExternalStep,
    ConfirmationTimeout,
    TransientScan,
    Other,
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::InvalidHex(_)
            | RelayError::InvalidLength { .. }
            | RelayError::MissingField(_)
            | RelayError::InvalidField { .. } => ErrorClass::InputValidation,
            RelayError::AccountResolution(_)
            | RelayError::CallBuilding(_)
            | RelayError::Signing(_)
            | RelayError::Submission(_)
            | RelayError::Transport(_)
            | RelayError::Rpc { .. } => ErrorClass::ExternalStep,
            RelayError::ConfirmationTimeout(_) => ErrorClass::ConfirmationTimeout,
            RelayError::ChainQuery(_) => ErrorClass::TransientScan,
            RelayError::Other(_) => ErrorClass::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| RelayError::InvalidLength {
                    expected: $len,
                    got: bytes.len(),
                })?;
                Ok(Self(arr))
            }

            pub fn from_hex(s: &str) -> Result<Self> {
                Self::from_slice(&hex_to_bytes(s)?)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> Hex {
                bytes_to_hex(&self.0)
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl std::str::FromStr for $name {
            type Err = RelayError;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// Content hash naming one submitted operation. Compared bytewise only.
    OpHash,
    32
);

fixed_bytes!(
    /// Hash of the transaction that included an operation.
    TxHash,
    32
);

fixed_bytes!(
    /// 20-byte account or contract address.
    Address,
    20
);

impl Address {
    /// Take the low 20 bytes of a left-padded 32-byte word (indexed event topic).
    pub fn from_word(word: &[u8; 32]) -> Self {
        let mut out = [0u8; 20];
        out.copy_from_slice(&word[12..]);
        Self(out)
    }
}

/// Parse a hex string to a big-endian byte array.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| RelayError::InvalidHex(e.to_string()))
}

/// Convert bytes to a 0x-prefixed hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a JSON-RPC quantity ("0x1a") into a u64.
pub fn parse_quantity(s: &str) -> Result<u64> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| RelayError::InvalidHex(format!("quantity without 0x prefix: {}", s)))?;
    if digits.is_empty() {
        return Err(RelayError::InvalidHex("empty quantity".into()));
    }
    u64::from_str_radix(digits, 16).map_err(|e| RelayError::InvalidHex(format!("{}: {}", s, e)))
}

/// Format a u64 as a JSON-RPC quantity (no leading zeros).
pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}
