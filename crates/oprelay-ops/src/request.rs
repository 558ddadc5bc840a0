//! Inbound execution request and its validation.

use std::fmt;

use oprelay_types::{hex_to_bytes, parse_quantity, Address, RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_UINT48: u64 = (1 << 48) - 1;

/// Request body as received. Every field is required; values may arrive as
/// JSON strings or numbers, so they are kept raw until validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    #[serde(default)]
    pub user_address: Option<Value>,
    #[serde(default)]
    pub valid_after: Option<Value>,
    #[serde(default)]
    pub valid_until: Option<Value>,
    #[serde(default)]
    pub session_key_address: Option<Value>,
    #[serde(default)]
    pub session_key_priv_key: Option<Value>,
    #[serde(default)]
    pub enable_data: Option<Value>,
    #[serde(default)]
    pub enable_data_signature: Option<Value>,
}

/// Private key of a session key. `Debug` never prints the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeyCredential([u8; 32]);

impl SessionKeyCredential {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeyCredential(<redacted>)")
    }
}

/// Validity window of the session, in seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub valid_after: u64,
    pub valid_until: u64,
}

/// Delegated signer for one request.
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub address: Address,
    pub credential: SessionKeyCredential,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub user: Address,
    pub window: ValidityWindow,
    pub session_key: SessionKey,
    pub enable_data: Vec<u8>,
    pub enable_data_signature: Vec<u8>,
}

fn present<'a>(field: &'static str, value: &'a Option<Value>) -> Result<&'a Value> {
    match value {
        None | Some(Value::Null) => Err(RelayError::MissingField(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(RelayError::MissingField(field)),
        Some(v) => Ok(v),
    }
}

fn text<'a>(field: &'static str, value: &'a Option<Value>) -> Result<&'a str> {
    match present(field, value)? {
        Value::String(s) => Ok(s.trim()),
        other => Err(RelayError::InvalidField {
            field,
            reason: format!("expected a hex string, got {}", other),
        }),
    }
}

fn timestamp(field: &'static str, value: &Option<Value>) -> Result<u64> {
    let parsed = match present(field, value)? {
        Value::Number(n) => n.as_u64().ok_or_else(|| RelayError::InvalidField {
            field,
            reason: format!("{} is not an unsigned integer", n),
        })?,
        Value::String(s) => {
            let s = s.trim();
            if s.starts_with("0x") {
                parse_quantity(s).map_err(|e| RelayError::InvalidField { field, reason: e.to_string() })?
            } else {
                s.parse::<u64>()
                    .map_err(|e| RelayError::InvalidField { field, reason: format!("{}: {}", s, e) })?
            }
        }
        other => {
            return Err(RelayError::InvalidField {
                field,
                reason: format!("expected an integer, got {}", other),
            })
        }
    };
    if parsed > MAX_UINT48 {
        return Err(RelayError::InvalidField {
            field,
            reason: format!("{} does not fit in 48 bits", parsed),
        });
    }
    Ok(parsed)
}

fn address(field: &'static str, value: &Option<Value>) -> Result<Address> {
    Address::from_hex(text(field, value)?)
        .map_err(|e| RelayError::InvalidField { field, reason: e.to_string() })
}

fn blob(field: &'static str, value: &Option<Value>) -> Result<Vec<u8>> {
    hex_to_bytes(text(field, value)?).map_err(|e| RelayError::InvalidField { field, reason: e.to_string() })
}

impl ExecRequest {
    /// Check every field in request order. The first missing or malformed
    /// field is reported.
    pub fn validate(&self) -> Result<ValidatedRequest> {
        let user = address("userAddress", &self.user_address)?;
        let valid_after = timestamp("validAfter", &self.valid_after)?;
        let valid_until = timestamp("validUntil", &self.valid_until)?;
        let session_address = address("sessionKeyAddress", &self.session_key_address)?;

        let key = blob("sessionKeyPrivKey", &self.session_key_priv_key)?;
        let key: [u8; 32] = key.as_slice().try_into().map_err(|_| RelayError::InvalidField {
            field: "sessionKeyPrivKey",
            reason: format!("expected 32 bytes, got {}", key.len()),
        })?;

        let enable_data = blob("enableData", &self.enable_data)?;
        let enable_data_signature = blob("enableDataSignature", &self.enable_data_signature)?;

        if valid_until != 0 && valid_until < valid_after {
            return Err(RelayError::InvalidField {
                field: "validUntil",
                reason: format!("{} is before validAfter {}", valid_until, valid_after),
            });
        }

        Ok(ValidatedRequest {
            user,
            window: ValidityWindow { valid_after, valid_until },
            session_key: SessionKey {
                address: session_address,
                credential: SessionKeyCredential::new(key),
            },
            enable_data,
            enable_data_signature,
        })
    }
}
