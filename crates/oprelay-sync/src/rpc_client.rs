//! JSON-RPC client for an execution node.
//!
//! Methods:
//! - eth_blockNumber
//! - eth_getLogs (UserOperationEvent emitted by the entry point)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use oprelay_types::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use oprelay_types::{
    bytes_to_hex, hex_to_bytes, parse_quantity, to_quantity, Address, Hex, OpHash, RelayError,
    Result,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha3::{Digest, Keccak256};

use crate::{ChainQuery, ConfirmationEvent};

/// Solidity signature of the entry point's confirmation event.
pub const USER_OPERATION_EVENT: &str =
    "UserOperationEvent(bytes32,address,address,uint256,bool,uint256,uint256)";

/// topic0 of [`USER_OPERATION_EVENT`].
pub fn user_operation_event_topic() -> [u8; 32] {
    Keccak256::digest(USER_OPERATION_EVENT.as_bytes()).into()
}

/// A log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<Hex>,
    pub data: Hex,
    pub block_number: Option<Hex>,
    pub transaction_hash: Option<Hex>,
    pub log_index: Option<Hex>,
    #[serde(default)]
    pub removed: bool,
}

fn word(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex_to_bytes(hex_str)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| RelayError::InvalidLength { expected: 32, got: bytes.len() })
}

/// Decode a `UserOperationEvent` log. Returns `Ok(None)` for logs that are
/// pending or were removed by a reorg.
pub fn decode_user_operation_event(log: &RpcLog) -> Result<Option<ConfirmationEvent>> {
    if log.removed {
        return Ok(None);
    }
    let (Some(block_number), Some(tx_hash)) = (&log.block_number, &log.transaction_hash) else {
        return Ok(None);
    };

    if log.topics.len() != 4 {
        return Err(RelayError::ChainQuery(format!(
            "expected 4 topics, got {}",
            log.topics.len()
        )));
    }
    if word(&log.topics[0])? != user_operation_event_topic() {
        return Err(RelayError::ChainQuery(format!(
            "unexpected event topic {}",
            log.topics[0]
        )));
    }

    let data = hex_to_bytes(&log.data)?;
    if data.len() != 128 {
        return Err(RelayError::ChainQuery(format!(
            "expected 128 bytes of event data, got {}",
            data.len()
        )));
    }
    let data_word = |i: usize| bytes_to_hex(&data[i * 32..(i + 1) * 32]);

    Ok(Some(ConfirmationEvent {
        op_hash: OpHash::new(word(&log.topics[1])?),
        tx_hash: tx_hash.parse()?,
        block_number: parse_quantity(block_number)?,
        log_index: log.log_index.as_deref().map(parse_quantity).transpose()?.unwrap_or(0),
        sender: Address::from_word(&word(&log.topics[2])?),
        paymaster: Address::from_word(&word(&log.topics[3])?),
        nonce: data_word(0),
        success: data[32..64].iter().any(|b| *b != 0),
        actual_gas_cost: data_word(2),
        actual_gas_used: data_word(3),
    }))
}

/// Node-side errors are scan failures like any other, so they are reported
/// as `ChainQuery` and retried by the poller.
fn node_result<T>(method: &str, body: JsonRpcResponse<T>) -> Result<Option<T>> {
    body.into_result().map_err(|e| match e {
        RelayError::Rpc { code, message } => {
            RelayError::ChainQuery(format!("{} failed ({}): {}", method, code, message))
        }
        other => other,
    })
}

/// Execution node client.
pub struct JsonRpcChainClient {
    url: String,
    entry_point: Address,
    client: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl JsonRpcChainClient {
    pub fn new(url: &str, entry_point: Address, timeout_ms: Option<u64>) -> Self {
        let timeout_ms = timeout_ms.unwrap_or(20_000);
        Self {
            url: url.to_string(),
            entry_point,
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            timeout: Duration::from_millis(timeout_ms),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    async fn call<P: Serialize + Send + Sync, T: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<Option<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let resp = self.client
            .post(&self.url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RelayError::ChainQuery(format!("{} request failed: {}", method, e)))?;

        if !resp.status().is_success() {
            return Err(RelayError::ChainQuery(format!(
                "{} returned status {}",
                method,
                resp.status()
            )));
        }

        let body: JsonRpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| RelayError::ChainQuery(format!("failed to parse {} response: {}", method, e)))?;

        node_result(method, body)
    }

    /// Raw `eth_getLogs` for the entry point's confirmation event.
    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        op_hash: Option<OpHash>,
    ) -> Result<Vec<RpcLog>> {
        let topic0 = bytes_to_hex(&user_operation_event_topic());
        let filter = json!({
            "address": self.entry_point,
            "fromBlock": to_quantity(from_block),
            "toBlock": to_quantity(to_block),
            "topics": [topic0, op_hash],
        });
        let logs: Option<Vec<RpcLog>> = self.call("eth_getLogs", [filter]).await?;
        Ok(logs.unwrap_or_default())
    }
}

#[async_trait]
impl ChainQuery for JsonRpcChainClient {
    async fn block_number(&self) -> Result<u64> {
        let head: Option<Hex> = self.call("eth_blockNumber", [(); 0]).await?;
        let head = head.ok_or_else(|| RelayError::ChainQuery("eth_blockNumber returned null".into()))?;
        parse_quantity(&head)
    }

    async fn confirmation_events(
        &self,
        from_block: u64,
        to_block: u64,
        op_hash: Option<OpHash>,
    ) -> Result<Vec<ConfirmationEvent>> {
        let logs = self.get_logs(from_block, to_block, op_hash).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            if let Some(event) = decode_user_operation_event(log)? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(byte: u8, width: usize) -> String {
        format!("0x{}{}", "00".repeat(32 - width), format!("{:02x}", byte).repeat(width))
    }

    fn sample_log() -> RpcLog {
        let mut data = String::from("0x");
        data.push_str(&format!("{:064x}", 5)); // nonce
        data.push_str(&format!("{:064x}", 1)); // success
        data.push_str(&format!("{:064x}", 0x1234)); // actualGasCost
        data.push_str(&format!("{:064x}", 0x56)); // actualGasUsed

        RpcLog {
            address: Address::new([0xee; 20]),
            topics: vec![
                bytes_to_hex(&user_operation_event_topic()),
                padded(0xab, 32),
                padded(0x11, 20),
                padded(0x22, 20),
            ],
            data,
            block_number: Some("0x10".into()),
            transaction_hash: Some(padded(0xcd, 32)),
            log_index: Some("0x3".into()),
            removed: false,
        }
    }

    #[test]
    fn test_user_operation_event_topic() {
        assert_eq!(
            bytes_to_hex(&user_operation_event_topic()),
            "0x49628fd1471006c1482da88028e9ce4dbb080b815c9b0344d39e5a8e6ec1419f"
        );
    }

    #[test]
    fn test_decode_user_operation_event() {
        let event = decode_user_operation_event(&sample_log()).unwrap().unwrap();
        assert_eq!(event.op_hash, OpHash::new([0xab; 32]));
        assert_eq!(event.tx_hash.as_bytes(), &[0xcd; 32]);
        assert_eq!(event.block_number, 16);
        assert_eq!(event.log_index, 3);
        assert_eq!(event.sender, Address::new([0x11; 20]));
        assert_eq!(event.paymaster, Address::new([0x22; 20]));
        assert!(event.success);
        assert_eq!(event.nonce, format!("0x{:064x}", 5));
        assert_eq!(event.actual_gas_cost, format!("0x{:064x}", 0x1234));
    }

    #[test]
    fn test_pending_and_removed_logs_are_skipped() {
        let mut log = sample_log();
        log.removed = true;
        assert_eq!(decode_user_operation_event(&log).unwrap(), None);

        let mut log = sample_log();
        log.block_number = None;
        assert_eq!(decode_user_operation_event(&log).unwrap(), None);
    }

    #[test]
    fn test_foreign_event_is_rejected() {
        let mut log = sample_log();
        log.topics[0] = padded(0x01, 32);
        assert!(matches!(
            decode_user_operation_event(&log),
            Err(RelayError::ChainQuery(_))
        ));

        let mut log = sample_log();
        log.data = "0x00".into();
        assert!(decode_user_operation_event(&log).is_err());
    }

    #[test]
    fn test_node_error_is_a_transient_scan_failure() {
        let body: JsonRpcResponse<Vec<RpcLog>> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32005,"message":"query returned more than 10000 results"}}"#,
        )
        .unwrap();
        let err = node_result("eth_getLogs", body).unwrap_err();
        assert!(matches!(err, RelayError::ChainQuery(_)));
        assert_eq!(err.class(), oprelay_types::ErrorClass::TransientScan);

        let body: JsonRpcResponse<Hex> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":4,"result":"0x10"}"#).unwrap();
        assert_eq!(node_result("eth_blockNumber", body).unwrap().as_deref(), Some("0x10"));
    }

    #[test]
    fn test_log_deserializes_from_node_json() {
        let log = sample_log();
        let json = serde_json::json!({
            "address": log.address,
            "topics": log.topics,
            "data": log.data,
            "blockNumber": "0x10",
            "transactionHash": log.transaction_hash,
            "logIndex": "0x3",
            "blockHash": padded(0x99, 32),
        });
        let parsed: RpcLog = serde_json::from_value(json).unwrap();
        assert!(!parsed.removed);
        assert_eq!(parsed.block_number.as_deref(), Some("0x10"));
    }
}
