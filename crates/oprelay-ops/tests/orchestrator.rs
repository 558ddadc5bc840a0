use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use oprelay_cache::OpConfirmationCache;
use oprelay_ops::{
    ExecRequest, OperationBackend, OrchestratorConfig, RelayConfig, RelayService, RequestOrchestrator,
    RequestStage, SessionKey, ValidityWindow,
};
use oprelay_sync::{ChainQuery, ConfirmationEvent, PollerConfig, PollerEvent, ScanCursor};
use oprelay_tx::signature::SessionSignature;
use oprelay_tx::UserOperation;
use oprelay_types::{Address, Hex, OpHash, RelayError, Result, TxHash, SENTINEL_FAILURE};
use serde_json::json;
use tokio::sync::{mpsc, Notify};

const H1: OpHash = OpHash::new([0x11; 32]);
const TX1: TxHash = TxHash::new([0xaa; 32]);
const ACCOUNT: Address = Address::new([0x77; 20]);

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Calls {
    account: AtomicUsize,
    build: AtomicUsize,
    sign: AtomicUsize,
    submit: AtomicUsize,
}

impl Calls {
    fn total(&self) -> usize {
        self.account.load(Ordering::SeqCst)
            + self.build.load(Ordering::SeqCst)
            + self.sign.load(Ordering::SeqCst)
            + self.submit.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockBackend {
    calls: Calls,
    fail_at: Option<RequestStage>,
    submitted: Mutex<Vec<UserOperation>>,
    on_submit: Notify,
    /// Record the confirmation as part of submission, ahead of any wait.
    confirm_on_submit: Option<Arc<OpConfirmationCache>>,
}

impl MockBackend {
    fn failing_at(stage: RequestStage) -> Self {
        Self { fail_at: Some(stage), ..Default::default() }
    }

    fn fail(&self, stage: RequestStage, error: RelayError) -> Result<()> {
        if self.fail_at == Some(stage) {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl OperationBackend for MockBackend {
    async fn account_address(&self, _user: Address) -> Result<Address> {
        self.calls.account.fetch_add(1, Ordering::SeqCst);
        Ok(ACCOUNT)
    }

    async fn build_call(&self, _account: Address) -> Result<Hex> {
        self.calls.build.fetch_add(1, Ordering::SeqCst);
        self.fail(RequestStage::Building, RelayError::CallBuilding("unknown target".into()))?;
        Ok("0xdeadbeef".into())
    }

    async fn build_operation(
        &self,
        _account: Address,
        call_data: Hex,
        _window: ValidityWindow,
    ) -> Result<UserOperation> {
        Ok(UserOperation {
            sender: Address::default(),
            nonce: "0x0".into(),
            init_code: "0x".into(),
            call_data,
            call_gas_limit: "0x30d40".into(),
            verification_gas_limit: "0x30d40".into(),
            pre_verification_gas: "0xc350".into(),
            max_fee_per_gas: "0x1".into(),
            max_priority_fee_per_gas: "0x1".into(),
            paymaster_and_data: "0x".into(),
            signature: "0x".into(),
        })
    }

    fn operation_hash(&self, _op: &UserOperation) -> Result<OpHash> {
        Ok(H1)
    }

    async fn sign_session(
        &self,
        _account: Address,
        session_key: &SessionKey,
        _op_hash: &OpHash,
        _window: ValidityWindow,
    ) -> Result<SessionSignature> {
        self.calls.sign.fetch_add(1, Ordering::SeqCst);
        self.fail(RequestStage::Signing, RelayError::Signing("key rejected".into()))?;
        Ok(SessionSignature {
            session_key: session_key.address,
            message_signature: vec![0x5a; 65],
            session_data: vec![0x01, 0x02],
        })
    }

    async fn submit(&self, op: &UserOperation, op_hash: &OpHash) -> Result<()> {
        self.calls.submit.fetch_add(1, Ordering::SeqCst);
        self.fail(RequestStage::Submitting, RelayError::Submission("AA21 didn't pay prefund".into()))?;
        self.submitted.lock().unwrap().push(op.clone());
        if let Some(cache) = &self.confirm_on_submit {
            cache.set(*op_hash, TX1);
        }
        self.on_submit.notify_one();
        Ok(())
    }
}

#[derive(Default)]
struct MockChain {
    head: Mutex<u64>,
    logs: Mutex<Vec<ConfirmationEvent>>,
    calls: AtomicUsize,
}

impl MockChain {
    fn at(head: u64) -> Arc<Self> {
        let chain = Self::default();
        *chain.head.lock().unwrap() = head;
        Arc::new(chain)
    }

    /// Mine a block holding the confirmation for `op_hash`.
    fn mine(&self, op_hash: OpHash, tx_hash: TxHash) {
        let mut head = self.head.lock().unwrap();
        *head += 1;
        self.logs.lock().unwrap().push(ConfirmationEvent {
            op_hash,
            tx_hash,
            block_number: *head,
            log_index: 0,
            sender: ACCOUNT,
            paymaster: Address::default(),
            nonce: "0x0".into(),
            success: true,
            actual_gas_cost: "0x0".into(),
            actual_gas_used: "0x0".into(),
        });
    }
}

#[async_trait]
impl ChainQuery for MockChain {
    async fn block_number(&self) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.head.lock().unwrap())
    }

    async fn confirmation_events(
        &self,
        from_block: u64,
        to_block: u64,
        _op_hash: Option<OpHash>,
    ) -> Result<Vec<ConfirmationEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_number))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn request() -> ExecRequest {
    serde_json::from_value(json!({
        "userAddress": format!("0x{}", "01".repeat(20)),
        "validAfter": 1700000000u64,
        "validUntil": "1800000000",
        "sessionKeyAddress": format!("0x{}", "02".repeat(20)),
        "sessionKeyPrivKey": format!("0x{}", "03".repeat(32)),
        "enableData": "0xabcd",
        "enableDataSignature": "0xef01",
    }))
    .unwrap()
}

fn orchestrator(
    backend: Arc<MockBackend>,
    cache: Arc<OpConfirmationCache>,
    timeout: Option<Duration>,
) -> RequestOrchestrator {
    RequestOrchestrator::new(
        backend,
        cache,
        OrchestratorConfig {
            executor: Address::new([0xe0; 20]),
            relayer: Address::new([0xe1; 20]),
            confirmation_timeout: timeout,
        },
    )
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        confirmation_timeout_ms: Some(5_000),
        poller: PollerConfig { poll_ms: 10, ..Default::default() },
        ..Default::default()
    }
}

fn observed() -> (Box<dyn Fn(PollerEvent) + Send + Sync>, mpsc::UnboundedReceiver<PollerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Box::new(move |event: PollerEvent| {
        let _ = tx.send(event);
    });
    (handler, rx)
}

async fn wait_started(events: &mut mpsc::UnboundedReceiver<PollerEvent>) -> u64 {
    loop {
        match events.recv().await {
            Some(PollerEvent::Started { cursor }) => return cursor,
            Some(_) => continue,
            None => panic!("poller exited before starting"),
        }
    }
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_wait_returns_once_poller_observes_confirmation() {
    let chain = MockChain::at(500);
    let backend = Arc::new(MockBackend::default());
    let (handler, mut events) = observed();
    let service =
        RelayService::start_with_event_handler(&fast_config(), chain.clone(), backend.clone(), handler)
            .unwrap();
    assert_eq!(wait_started(&mut events).await, 500);

    let orchestrator = service.orchestrator().clone();
    let task = tokio::spawn(async move { orchestrator.execute(&request()).await });

    backend.on_submit.notified().await;
    while service.cache().pending_waiters(&H1) == 0 {
        tokio::task::yield_now().await;
    }

    // Several empty poll passes go by without resolving the wait.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    chain.mine(H1, TX1);
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("wait did not resolve after the confirmation was mined")
        .unwrap();
    assert_eq!(result, Ok(TX1));
    assert_eq!(service.cache().pending_waiters(&H1), 0);

    assert_eq!(service.shutdown().await, Some(ScanCursor::new(501)));
}

#[tokio::test]
async fn test_missing_session_key_address_returns_sentinel() {
    let backend = Arc::new(MockBackend::default());
    let cache = Arc::new(OpConfirmationCache::default());
    let orchestrator = orchestrator(backend.clone(), cache.clone(), None);

    let mut req = request();
    req.session_key_address = None;

    assert_eq!(orchestrator.execute_or_sentinel(&req).await, SENTINEL_FAILURE);

    let failure = orchestrator.execute(&req).await.unwrap_err();
    assert_eq!(failure.stage, RequestStage::Validating);
    assert_eq!(failure.error, RelayError::MissingField("sessionKeyAddress"));

    assert_eq!(backend.calls.total(), 0);
    assert_eq!(cache.stats(), Default::default());
    assert!(cache.is_empty());
    assert_eq!(cache.pending_waiters(&H1), 0);
}

#[tokio::test]
async fn test_confirmation_before_wait_is_not_lost() {
    let cache = Arc::new(OpConfirmationCache::default());
    let backend = Arc::new(MockBackend {
        confirm_on_submit: Some(cache.clone()),
        ..Default::default()
    });
    let orchestrator = orchestrator(backend, cache.clone(), None);

    let result = tokio::time::timeout(Duration::from_secs(1), orchestrator.execute(&request()))
        .await
        .expect("confirmed operation should not suspend");
    assert_eq!(result, Ok(TX1));
    assert_eq!(cache.stats().hits, 1);
    assert_eq!(cache.stats().waits, 0);
}

#[tokio::test]
async fn test_wait_times_out_and_late_confirmation_is_kept() {
    let backend = Arc::new(MockBackend::default());
    let cache = Arc::new(OpConfirmationCache::default());
    let orchestrator = orchestrator(backend, cache.clone(), Some(Duration::from_millis(30)));

    let failure = orchestrator.execute(&request()).await.unwrap_err();
    assert_eq!(failure.stage, RequestStage::AwaitingConfirmation);
    assert_eq!(failure.error, RelayError::ConfirmationTimeout(H1));
    assert_eq!(cache.pending_waiters(&H1), 0);

    cache.set(H1, TX1);
    assert_eq!(cache.try_get(&H1), Some(TX1));
}

#[tokio::test]
async fn test_external_failure_reports_its_stage() {
    let cases = [
        (RequestStage::Building, RelayError::CallBuilding("unknown target".into()), 0),
        (RequestStage::Signing, RelayError::Signing("key rejected".into()), 0),
        (RequestStage::Submitting, RelayError::Submission("AA21 didn't pay prefund".into()), 1),
    ];
    for (stage, error, submits) in cases {
        let backend = Arc::new(MockBackend::failing_at(stage));
        let cache = Arc::new(OpConfirmationCache::default());
        let orchestrator = orchestrator(backend.clone(), cache.clone(), None);

        let failure = orchestrator.execute(&request()).await.unwrap_err();
        assert_eq!(failure.stage, stage);
        assert_eq!(failure.error, error);
        assert_eq!(backend.calls.submit.load(Ordering::SeqCst), submits);
        assert_eq!(cache.stats().waits, 0);
        assert_eq!(orchestrator.execute_or_sentinel(&request()).await, SENTINEL_FAILURE);
    }
}

#[tokio::test]
async fn test_submitted_operation_carries_enable_mode_signature() {
    let cache = Arc::new(OpConfirmationCache::default());
    let backend = Arc::new(MockBackend {
        confirm_on_submit: Some(cache.clone()),
        ..Default::default()
    });
    let orchestrator = orchestrator(backend.clone(), cache, None);

    assert_eq!(orchestrator.execute_or_sentinel(&request()).await, TX1.to_hex());

    let submitted = backend.submitted.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    let op = &submitted[0];
    assert_eq!(op.sender, ACCOUNT);
    assert_eq!(op.call_data, "0xdeadbeef");

    let expected_head = format!(
        "0x00000002{:012x}{:012x}{}{}",
        1_700_000_000u64,
        1,
        "e0".repeat(20),
        "e1".repeat(20)
    );
    assert!(op.signature.starts_with(&expected_head));
    assert!(op.signature.ends_with(&format!("{}{}0102", "02".repeat(20), "5a".repeat(65))));
}

#[tokio::test]
async fn test_concurrent_requests_for_same_operation_all_resolve() {
    let chain = MockChain::at(0);
    let backend = Arc::new(MockBackend::default());
    let (handler, mut events) = observed();
    let service =
        RelayService::start_with_event_handler(&fast_config(), chain.clone(), backend, handler).unwrap();
    wait_started(&mut events).await;

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let orchestrator = service.orchestrator().clone();
            tokio::spawn(async move { orchestrator.execute(&request()).await })
        })
        .collect();
    while service.cache().pending_waiters(&H1) < 3 {
        tokio::task::yield_now().await;
    }

    chain.mine(H1, TX1);
    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(TX1));
    }
    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_before_chain_answers() {
    let config = RelayConfig {
        node_rpc_url: "http://127.0.0.1:9".into(),
        request_timeout_ms: Some(100),
        ..fast_config()
    };
    let service = RelayService::connect(&config, Arc::new(MockBackend::default())).unwrap();
    assert!(service.is_running());
    assert_eq!(service.shutdown().await, None);
}
