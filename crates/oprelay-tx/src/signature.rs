//! Enable-mode authorization signature.
//!
//! Byte layout, in order:
//!
//! | bytes | field |
//! |---|---|
//! | 4  | validator mode `0x00000002` |
//! | 6  | `valid_after`, big-endian |
//! | 6  | constant `1`, big-endian |
//! | 20 | executor address |
//! | 20 | relayer address |
//! | 32 | length of enable data, big-endian |
//! | n  | enable data |
//! | 32 | length of enable data signature, big-endian |
//! | m  | enable data signature |
//! | .. | session block: key address, message signature, session data |
//!
//! The verifier contract parses these offsets directly.

use oprelay_types::{bytes_to_hex, Address, Hex, RelayError, Result};

/// Validator mode tag selecting "enable".
pub const ENABLE_MODE: [u8; 4] = [0x00, 0x00, 0x00, 0x02];

const VALIDITY_START_MARKER: u64 = 1;
const MAX_UINT48: u64 = (1 << 48) - 1;

fn uint48_be(field: &'static str, value: u64) -> Result<[u8; 6]> {
    if value > MAX_UINT48 {
        return Err(RelayError::InvalidField {
            field,
            reason: format!("{} does not fit in 48 bits", value),
        });
    }
    let mut out = [0u8; 6];
    out.copy_from_slice(&value.to_be_bytes()[2..]);
    Ok(out)
}

fn uint256_be(value: usize) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&(value as u64).to_be_bytes());
    out
}

/// Signature produced by the session key over the operation hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSignature {
    pub session_key: Address,
    pub message_signature: Vec<u8>,
    /// Encoded permission and session-key metadata.
    pub session_data: Vec<u8>,
}

impl SessionSignature {
    pub fn encoded_len(&self) -> usize {
        Address::LEN + self.message_signature.len() + self.session_data.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.session_key.as_bytes());
        out.extend_from_slice(&self.message_signature);
        out.extend_from_slice(&self.session_data);
    }
}

/// Full authorization signature attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableModeSignature {
    pub valid_after: u64,
    pub executor: Address,
    pub relayer: Address,
    pub enable_data: Vec<u8>,
    pub enable_data_signature: Vec<u8>,
    pub session: SessionSignature,
}

impl EnableModeSignature {
    pub fn encoded_len(&self) -> usize {
        ENABLE_MODE.len()
            + 6
            + 6
            + Address::LEN * 2
            + 32
            + self.enable_data.len()
            + 32
            + self.enable_data_signature.len()
            + self.session.encoded_len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&ENABLE_MODE);
        out.extend_from_slice(&uint48_be("validAfter", self.valid_after)?);
        out.extend_from_slice(&uint48_be("validityStart", VALIDITY_START_MARKER)?);
        out.extend_from_slice(self.executor.as_bytes());
        out.extend_from_slice(self.relayer.as_bytes());
        out.extend_from_slice(&uint256_be(self.enable_data.len()));
        out.extend_from_slice(&self.enable_data);
        out.extend_from_slice(&uint256_be(self.enable_data_signature.len()));
        out.extend_from_slice(&self.enable_data_signature);
        self.session.encode_into(&mut out);
        Ok(out)
    }

    pub fn encode_hex(&self) -> Result<Hex> {
        Ok(bytes_to_hex(&self.encode()?))
    }
}
