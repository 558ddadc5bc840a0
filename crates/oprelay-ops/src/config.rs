//! Relay service configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use oprelay_cache::DEFAULT_CAPACITY;
use oprelay_sync::PollerConfig;
use oprelay_types::{Address, RelayError, Result};
use serde::{Deserialize, Serialize};

use crate::OrchestratorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayConfig {
    pub chain_id: u64,
    pub node_rpc_url: String,
    pub bundler_url: String,
    pub entry_point: Address,
    /// Executor written into the enable-mode signature.
    pub executor: Address,
    /// Relayer written into the enable-mode signature.
    pub relayer: Address,
    pub cache_capacity: usize,
    /// Upper bound on a request's confirmation wait. `None` waits forever.
    pub confirmation_timeout_ms: Option<u64>,
    /// HTTP timeout for node and bundler calls.
    pub request_timeout_ms: Option<u64>,
    pub poller: PollerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            node_rpc_url: "http://127.0.0.1:8545".to_string(),
            bundler_url: "http://127.0.0.1:4337".to_string(),
            entry_point: Address::default(),
            executor: Address::default(),
            relayer: Address::default(),
            cache_capacity: DEFAULT_CAPACITY.get(),
            confirmation_timeout_ms: Some(120_000),
            request_timeout_ms: None,
            poller: PollerConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Parse from JSON. Omitted keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RelayError::InvalidField { field: "config", reason: e.to_string() })
    }

    pub fn cache_capacity(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.cache_capacity).ok_or_else(|| RelayError::InvalidField {
            field: "cacheCapacity",
            reason: "must be greater than zero".into(),
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            executor: self.executor,
            relayer: self.relayer,
            confirmation_timeout: self.confirmation_timeout_ms.map(Duration::from_millis),
        }
    }
}
