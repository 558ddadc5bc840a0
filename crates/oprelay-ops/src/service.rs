//! Wires the cache, poller and orchestrator into one running service.

use std::sync::Arc;

use oprelay_cache::OpConfirmationCache;
use oprelay_sync::rpc_client::JsonRpcChainClient;
use oprelay_sync::{ChainPoller, ChainQuery, PollerEventHandler, ScanCursor};
use oprelay_types::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{OperationBackend, RelayConfig, RequestOrchestrator};

/// A started relay: one poller task feeding a cache shared with the
/// orchestrator. Must be started inside a tokio runtime.
pub struct RelayService {
    cache: Arc<OpConfirmationCache>,
    orchestrator: Arc<RequestOrchestrator>,
    cancel: CancellationToken,
    poller: JoinHandle<Option<ScanCursor>>,
}

impl RelayService {
    /// Start against the node configured in `config.node_rpc_url`.
    pub fn connect(config: &RelayConfig, backend: Arc<dyn OperationBackend>) -> Result<Self> {
        let query = JsonRpcChainClient::new(
            &config.node_rpc_url,
            config.entry_point,
            config.request_timeout_ms,
        );
        Self::start(config, Arc::new(query), backend)
    }

    pub fn start(
        config: &RelayConfig,
        query: Arc<dyn ChainQuery>,
        backend: Arc<dyn OperationBackend>,
    ) -> Result<Self> {
        Self::launch(config, query, backend, None)
    }

    /// Start with a callback receiving the poller's progress events.
    pub fn start_with_event_handler(
        config: &RelayConfig,
        query: Arc<dyn ChainQuery>,
        backend: Arc<dyn OperationBackend>,
        handler: PollerEventHandler,
    ) -> Result<Self> {
        Self::launch(config, query, backend, Some(handler))
    }

    fn launch(
        config: &RelayConfig,
        query: Arc<dyn ChainQuery>,
        backend: Arc<dyn OperationBackend>,
        handler: Option<PollerEventHandler>,
    ) -> Result<Self> {
        let cache = Arc::new(OpConfirmationCache::new(config.cache_capacity()?));
        let orchestrator = Arc::new(RequestOrchestrator::new(
            backend,
            cache.clone(),
            config.orchestrator_config(),
        ));

        let mut poller = ChainPoller::new(config.poller.clone(), query, cache.clone());
        if let Some(handler) = handler {
            poller = poller.with_event_handler(handler);
        }
        let cancel = CancellationToken::new();
        let poller = poller.spawn(cancel.child_token());

        info!(chain_id = config.chain_id, capacity = cache.capacity(), "relay service started");
        Ok(Self { cache, orchestrator, cancel, poller })
    }

    pub fn cache(&self) -> &Arc<OpConfirmationCache> {
        &self.cache
    }

    pub fn orchestrator(&self) -> &Arc<RequestOrchestrator> {
        &self.orchestrator
    }

    /// Whether the poller task is still running.
    pub fn is_running(&self) -> bool {
        !self.poller.is_finished()
    }

    /// Stop the poller and wait for it to exit. Returns its final cursor,
    /// or `None` if it never started scanning.
    ///
    /// Requests still waiting on the cache are not woken; their own
    /// timeouts apply.
    pub async fn shutdown(self) -> Option<ScanCursor> {
        self.cancel.cancel();
        match self.poller.await {
            Ok(cursor) => {
                info!(cursor = ?cursor.map(|c| c.last_block()), "relay service stopped");
                cursor
            }
            Err(e) => {
                error!(error = %e, "poller task failed");
                None
            }
        }
    }
}
