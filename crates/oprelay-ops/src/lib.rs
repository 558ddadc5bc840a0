//! Request orchestration: validate, build, sign, submit, then wait for the
//! chain poller to confirm the operation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oprelay_cache::OpConfirmationCache;
use oprelay_tx::signature::{EnableModeSignature, SessionSignature};
use oprelay_tx::UserOperation;
use oprelay_types::{Address, Hex, OpHash, RelayError, Result, TxHash, SENTINEL_FAILURE};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod config;
pub mod request;
pub mod service;

pub use config::RelayConfig;
pub use request::{ExecRequest, SessionKey, SessionKeyCredential, ValidatedRequest, ValidityWindow};
pub use service::RelayService;

/// Step a request was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Validating,
    Building,
    Signing,
    Submitting,
    AwaitingConfirmation,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStage::Validating => "validating",
            RequestStage::Building => "building",
            RequestStage::Signing => "signing",
            RequestStage::Submitting => "submitting",
            RequestStage::AwaitingConfirmation => "awaiting confirmation",
        };
        f.write_str(name)
    }
}

/// A failed request and the stage it failed in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request failed while {stage}: {error}")]
pub struct ExecFailure {
    pub stage: RequestStage,
    #[source]
    pub error: RelayError,
}

impl ExecFailure {
    fn at(stage: RequestStage) -> impl FnOnce(RelayError) -> Self {
        move |error| Self { stage, error }
    }
}

/// Account and operation plumbing supplied by the host.
///
/// None of these calls are retried by the orchestrator.
#[async_trait]
pub trait OperationBackend: Send + Sync {
    /// Deterministic smart account address for a user.
    async fn account_address(&self, user: Address) -> Result<Address>;

    /// Call data the account should execute.
    async fn build_call(&self, account: Address) -> Result<Hex>;

    /// Unsigned operation carrying `call_data` for `account`.
    async fn build_operation(
        &self,
        account: Address,
        call_data: Hex,
        window: ValidityWindow,
    ) -> Result<UserOperation>;

    /// Hash identifying the operation on-chain.
    fn operation_hash(&self, op: &UserOperation) -> Result<OpHash>;

    /// Session-key signature over `op_hash`.
    async fn sign_session(
        &self,
        account: Address,
        session_key: &SessionKey,
        op_hash: &OpHash,
        window: ValidityWindow,
    ) -> Result<SessionSignature>;

    /// Hand the signed operation to the bundler.
    async fn submit(&self, op: &UserOperation, op_hash: &OpHash) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub executor: Address,
    pub relayer: Address,
    /// `None` waits until the poller records the operation.
    pub confirmation_timeout: Option<Duration>,
}

/// Drives requests through the backend and the shared confirmation cache.
pub struct RequestOrchestrator {
    backend: Arc<dyn OperationBackend>,
    cache: Arc<OpConfirmationCache>,
    config: OrchestratorConfig,
}

impl RequestOrchestrator {
    pub fn new(
        backend: Arc<dyn OperationBackend>,
        cache: Arc<OpConfirmationCache>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { backend, cache, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Execute a request and return the hash of the transaction that
    /// included its operation.
    pub async fn execute(&self, request: &ExecRequest) -> std::result::Result<TxHash, ExecFailure> {
        let request = request.validate().map_err(ExecFailure::at(RequestStage::Validating))?;
        let (op, op_hash) = self.prepare(&request).await?;
        self.submit_and_wait(&op, op_hash).await
    }

    /// Like [`execute`](Self::execute), but any failure becomes `"0x"`.
    pub async fn execute_or_sentinel(&self, request: &ExecRequest) -> Hex {
        match self.execute(request).await {
            Ok(tx_hash) => tx_hash.to_hex(),
            Err(failure) => {
                warn!(stage = %failure.stage, error = %failure.error, "request failed");
                SENTINEL_FAILURE.to_string()
            }
        }
    }

    /// Build and sign the operation. Returns it with its hash.
    pub async fn prepare(
        &self,
        request: &ValidatedRequest,
    ) -> std::result::Result<(UserOperation, OpHash), ExecFailure> {
        let account = self
            .backend
            .account_address(request.user)
            .await
            .map_err(ExecFailure::at(RequestStage::Building))?;
        let call_data = self
            .backend
            .build_call(account)
            .await
            .map_err(ExecFailure::at(RequestStage::Building))?;
        let mut op = self
            .backend
            .build_operation(account, call_data, request.window)
            .await
            .map_err(ExecFailure::at(RequestStage::Building))?;
        let op_hash = self
            .backend
            .operation_hash(&op)
            .map_err(ExecFailure::at(RequestStage::Building))?;
        debug!(user = %request.user, %account, %op_hash, "operation built");

        let session = self
            .backend
            .sign_session(account, &request.session_key, &op_hash, request.window)
            .await
            .map_err(ExecFailure::at(RequestStage::Signing))?;
        let signature = EnableModeSignature {
            valid_after: request.window.valid_after,
            executor: self.config.executor,
            relayer: self.config.relayer,
            enable_data: request.enable_data.clone(),
            enable_data_signature: request.enable_data_signature.clone(),
            session,
        };
        op.sender = account;
        op.signature = signature.encode_hex().map_err(ExecFailure::at(RequestStage::Signing))?;

        Ok((op, op_hash))
    }

    /// Submit a signed operation and wait once for its confirmation.
    ///
    /// A confirmation recorded before the wait starts is still returned: the
    /// cache keeps the entry and `get` checks for it before suspending.
    pub async fn submit_and_wait(
        &self,
        op: &UserOperation,
        op_hash: OpHash,
    ) -> std::result::Result<TxHash, ExecFailure> {
        self.backend
            .submit(op, &op_hash)
            .await
            .map_err(ExecFailure::at(RequestStage::Submitting))?;
        info!(%op_hash, sender = %op.sender, "operation submitted, awaiting confirmation");

        let tx_hash = match self.config.confirmation_timeout {
            Some(timeout) => self.cache.get_timeout(&op_hash, timeout).await.ok_or(ExecFailure {
                stage: RequestStage::AwaitingConfirmation,
                error: RelayError::ConfirmationTimeout(op_hash),
            })?,
            None => self.cache.get(&op_hash).await,
        };

        info!(%op_hash, %tx_hash, "operation confirmed");
        Ok(tx_hash)
    }
}
