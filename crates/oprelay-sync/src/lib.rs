//! Chain poller: incremental discovery of operation confirmations.
//!
//! The poller owns a [`ScanCursor`] (last block fully processed). Each pass
//! reads the chain head, queries confirmation events over `(cursor, head]`,
//! writes every discovered `(op_hash, tx_hash)` pair into the shared
//! [`OpConfirmationCache`] and only then advances the cursor. A failed read
//! leaves the cursor untouched so the same range is retried.
//!
//! The cursor starts at the chain head observed at startup and is never
//! persisted. After a restart, operations mined between the old cursor and the
//! new head are never observed; deployments that cannot tolerate that gap must
//! persist the cursor outside this crate.

pub mod rpc_client;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use oprelay_cache::OpConfirmationCache;
use oprelay_types::{Address, Hex, OpHash, Result, TxHash};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollerConfig {
    /// Delay between passes once the cursor has caught up with the head.
    pub poll_ms: u64,
    /// Widest block range requested in one event query.
    pub max_block_range: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_ms: 1_000,
            max_block_range: 2_000,
            initial_backoff_ms: 400,
            max_backoff_ms: 30_000,
        }
    }
}

impl PollerConfig {
    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: Duration::from_millis(self.max_backoff_ms),
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

/// A `UserOperationEvent` log decoded from the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationEvent {
    pub op_hash: OpHash,
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub log_index: u64,
    pub sender: Address,
    pub paymaster: Address,
    pub nonce: Hex,
    pub success: bool,
    pub actual_gas_cost: Hex,
    pub actual_gas_used: Hex,
}

/// Read access to the chain, as needed by the poller.
#[async_trait]
pub trait ChainQuery: Send + Sync {
    /// Current head block number.
    async fn block_number(&self) -> Result<u64>;

    /// Confirmation events in the inclusive range `from_block..=to_block`,
    /// in chain order, optionally narrowed to one operation hash.
    async fn confirmation_events(
        &self,
        from_block: u64,
        to_block: u64,
        op_hash: Option<OpHash>,
    ) -> Result<Vec<ConfirmationEvent>>;
}

/// Last block fully processed by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    last_block: u64,
}

impl ScanCursor {
    pub fn new(last_block: u64) -> Self {
        Self { last_block }
    }

    pub fn last_block(&self) -> u64 {
        self.last_block
    }
}

/// Result of a single [`ChainPoller::poll_once`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The head has not moved past the cursor.
    Idle { head: u64 },
    Scanned {
        from_block: u64,
        to_block: u64,
        head: u64,
        /// Events returned by the query.
        events: usize,
        /// Distinct operation hashes written to the cache.
        recorded: usize,
    },
}

impl PollOutcome {
    /// Whether the cursor now sits at the head observed in this pass.
    pub fn caught_up(&self) -> bool {
        match self {
            PollOutcome::Idle { .. } => true,
            PollOutcome::Scanned { to_block, head, .. } => to_block == head,
        }
    }
}

/// Poller event for progress reporting.
#[derive(Debug, Clone)]
pub enum PollerEvent {
    Started { cursor: u64 },
    Scanned { from_block: u64, to_block: u64, recorded: usize },
    ScanFailed { cursor: u64, message: String, retry_in: Duration },
    Stopped { cursor: Option<u64> },
}

/// Callback type for poller events.
pub type PollerEventHandler = Box<dyn Fn(PollerEvent) + Send + Sync>;

/// Scans new blocks for confirmation events and feeds the cache.
pub struct ChainPoller {
    config: PollerConfig,
    query: Arc<dyn ChainQuery>,
    cache: Arc<OpConfirmationCache>,
    on_event: Option<PollerEventHandler>,
}

impl ChainPoller {
    pub fn new(
        config: PollerConfig,
        query: Arc<dyn ChainQuery>,
        cache: Arc<OpConfirmationCache>,
    ) -> Self {
        Self { config, query, cache, on_event: None }
    }

    pub fn with_event_handler(mut self, handler: PollerEventHandler) -> Self {
        self.on_event = Some(handler);
        self
    }

    fn emit(&self, event: PollerEvent) {
        if let Some(ref handler) = self.on_event {
            handler(event);
        }
    }

    /// Cursor positioned at the current head; earlier blocks are never scanned.
    pub async fn start_cursor(&self) -> Result<ScanCursor> {
        let head = self.query.block_number().await?;
        Ok(ScanCursor::new(head))
    }

    /// Run one pass. On error the cursor is left where it was.
    pub async fn poll_once(&self, cursor: &mut ScanCursor) -> Result<PollOutcome> {
        let head = self.query.block_number().await?;
        if head <= cursor.last_block {
            return Ok(PollOutcome::Idle { head });
        }

        let from_block = cursor.last_block + 1;
        let to_block = head.min(
            cursor
                .last_block
                .saturating_add(self.config.max_block_range.max(1)),
        );

        let events = self
            .query
            .confirmation_events(from_block, to_block, None)
            .await?;
        let recorded = self.record(&events);
        cursor.last_block = to_block;

        debug!(
            from_block,
            to_block,
            head,
            events = events.len(),
            recorded,
            "scanned block range"
        );
        self.emit(PollerEvent::Scanned { from_block, to_block, recorded });

        Ok(PollOutcome::Scanned {
            from_block,
            to_block,
            head,
            events: events.len(),
            recorded,
        })
    }

    /// Write events to the cache in query order. Within one batch the first
    /// event for a hash wins; a later batch may still overwrite it.
    fn record(&self, events: &[ConfirmationEvent]) -> usize {
        let mut seen = HashSet::with_capacity(events.len());
        for event in events {
            if !seen.insert(event.op_hash) {
                debug!(
                    op_hash = %event.op_hash,
                    tx_hash = %event.tx_hash,
                    "duplicate confirmation in batch ignored"
                );
                continue;
            }
            self.cache.set(event.op_hash, event.tx_hash);
        }
        seen.len()
    }

    async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Run until `cancel` fires. Returns the final cursor, or `None` if the
    /// poller was cancelled before it could read the initial head.
    pub async fn run(self, cancel: CancellationToken) -> Option<ScanCursor> {
        let poll_interval = Duration::from_millis(self.config.poll_ms);
        let mut backoff = self.config.backoff();

        let cursor = loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.start_cursor() => Some(result),
            };
            let delay = match result {
                None => break None,
                Some(Ok(cursor)) => break Some(cursor),
                Some(Err(err)) => {
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(%err, ?delay, "failed to read chain head, retrying");
                    delay
                }
            };
            if !self.wait(delay, &cancel).await {
                break None;
            }
        };

        let Some(mut cursor) = cursor else {
            info!("chain poller cancelled before start");
            self.emit(PollerEvent::Stopped { cursor: None });
            return None;
        };

        backoff.reset();
        info!(cursor = cursor.last_block, "chain poller started");
        self.emit(PollerEvent::Started { cursor: cursor.last_block });

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.poll_once(&mut cursor) => result,
            };

            let delay = match result {
                Ok(outcome) => {
                    backoff.reset();
                    if outcome.caught_up() {
                        poll_interval
                    } else {
                        Duration::ZERO
                    }
                }
                Err(err) => {
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(
                        %err,
                        cursor = cursor.last_block,
                        ?delay,
                        "scan failed, range will be retried"
                    );
                    self.emit(PollerEvent::ScanFailed {
                        cursor: cursor.last_block,
                        message: err.to_string(),
                        retry_in: delay,
                    });
                    delay
                }
            };

            if !self.wait(delay, &cancel).await {
                break;
            }
        }

        info!(cursor = cursor.last_block, "chain poller stopped");
        self.emit(PollerEvent::Stopped { cursor: Some(cursor.last_block) });
        Some(cursor)
    }

    /// Spawn [`run`](Self::run) on the current tokio runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Option<ScanCursor>> {
        tokio::spawn(self.run(cancel))
    }
}
