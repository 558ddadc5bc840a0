//! JSON-RPC client for the bundler (aggregation network entry).
//!
//! Methods:
//! - eth_sendUserOperation
//! - eth_getUserOperationReceipt
//! - eth_supportedEntryPoints

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use oprelay_types::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use oprelay_types::{Address, OpHash, RelayError, Result, TxHash};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{UserOperation, UserOperationReceipt};

/// Bundler client for submitting operations.
pub struct BundlerClient {
    url: String,
    entry_point: Address,
    client: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl BundlerClient {
    pub fn new(url: &str, entry_point: Address, timeout_ms: Option<u64>) -> Self {
        let timeout_ms = timeout_ms.unwrap_or(30_000);
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

    async fn call<P: Serialize, T: DeserializeOwned>(
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
            .map_err(|e| RelayError::Transport(format!("bundler request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Transport(format!(
                "bundler returned status {}: {}",
                status, body
            )));
        }

        let body: JsonRpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| RelayError::Transport(format!("failed to parse bundler response: {}", e)))?;

        body.into_result()
    }

    /// Submit an operation; returns the hash the bundler assigned to it.
    ///
    /// eth_sendUserOperation(op, entryPoint)
    pub async fn send_user_operation(&self, op: &UserOperation) -> Result<OpHash> {
        let hash: Option<OpHash> = self
            .call("eth_sendUserOperation", (op, self.entry_point))
            .await
            .map_err(|e| match e {
                RelayError::Rpc { code, message } => {
                    RelayError::Submission(format!("bundler rejected operation ({}): {}", code, message))
                }
                other => other,
            })?;
        let hash = hash.ok_or_else(|| RelayError::Submission("bundler returned no hash".into()))?;
        debug!(op_hash = %hash, sender = %op.sender, "operation submitted");
        Ok(hash)
    }

    /// Look up the receipt directly from the bundler. `None` while unmined.
    ///
    /// eth_getUserOperationReceipt(hash)
    pub async fn get_user_operation_receipt(
        &self,
        op_hash: &OpHash,
    ) -> Result<Option<UserOperationReceipt>> {
        self.call("eth_getUserOperationReceipt", [op_hash]).await
    }

    /// Poll the bundler for the including transaction, waiting between attempts.
    pub async fn wait_for_receipt(
        &self,
        op_hash: &OpHash,
        max_attempts: u32,
        poll_interval_ms: u64,
    ) -> Result<TxHash> {
        for attempt in 0..max_attempts {
            if let Some(receipt) = self.get_user_operation_receipt(op_hash).await? {
                return receipt.receipt.transaction_hash.parse();
            }
            if attempt + 1 < max_attempts {
                tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
            }
        }
        Err(RelayError::ConfirmationTimeout(*op_hash))
    }

    /// eth_supportedEntryPoints
    pub async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        let points: Option<Vec<Address>> = self.call("eth_supportedEntryPoints", [(); 0]).await?;
        Ok(points.unwrap_or_default())
    }
}
