//! Operation payloads and bundler submission.
//!
//! - Operation shape accepted by `eth_sendUserOperation`
//! - Enable-mode authorization signature encoding
//! - Submit to the bundler and look up receipts

use oprelay_types::{Address, Hex};
use serde::{Deserialize, Serialize};

pub mod bundler_client;
pub mod signature;

/// A user operation as submitted to the bundler. Numeric fields are
/// JSON-RPC quantities, byte fields are 0x-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: Hex,
    pub init_code: Hex,
    pub call_data: Hex,
    pub call_gas_limit: Hex,
    pub verification_gas_limit: Hex,
    pub pre_verification_gas: Hex,
    pub max_fee_per_gas: Hex,
    pub max_priority_fee_per_gas: Hex,
    pub paymaster_and_data: Hex,
    pub signature: Hex,
}

/// Receipt returned by `eth_getUserOperationReceipt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: Hex,
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
    pub receipt: TransactionReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: Hex,
    #[serde(default)]
    pub block_number: Option<Hex>,
}
