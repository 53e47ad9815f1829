use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use alloy_primitives::{address, TxHash};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ledger_gateway::{
    sim::{encode_error_string, SimulatedLedger, RATE_LIMIT_REASON},
    PendingTransaction, ProviderError, ProviderErrorCode, Receipt,
};
use shared::{
    error::ErrorClass,
    units::{tokens, TOKEN_DECIMALS},
};
use tokio_stream::StreamExt;

const LEDGER: Address = address!("1aec70c1bcb65a0cde00ff1a6c5d348761363d99");
const TOKEN: Address = address!("58eb07f482c3d4c524c25d0a5bd22f44adb7396d");
const OWNER: Address = address!("00000000000000000000000000000000000000a1");
const HOUR: Duration = Duration::from_secs(60 * 60);

fn one() -> U256 {
    tokens(1, TOKEN_DECIMALS)
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        spender: LEDGER,
        unit: one(),
        gas_limit: Some(500_000),
        lock_timeout: HOUR,
    }
}

fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::builtin().expect("catalog"))
}

async fn funded_ledger(block_time: Duration) -> Arc<SimulatedLedger> {
    let ledger = SimulatedLedger::with_timing(LEDGER, TOKEN, HOUR, block_time);
    ledger.mint(OWNER, tokens(10, TOKEN_DECIMALS)).await;
    ledger
}

fn orchestrator_for(ledger: &Arc<SimulatedLedger>) -> Arc<TransactionOrchestrator> {
    TransactionOrchestrator::new(
        SessionId::new(),
        catalog(),
        Arc::clone(ledger) as _,
        WalletHandle::connected(ledger.signer(OWNER)),
        config(),
    )
}

async fn collect(stream: OutcomeStream) -> Vec<TransactionOutcome> {
    stream.collect::<Vec<_>>().await
}

fn kinds(outcomes: &[TransactionOutcome]) -> Vec<RequestPhase> {
    outcomes.iter().map(RequestPhase::of).collect()
}

#[test]
fn allowance_decision_approves_exact_shortfall_amount() {
    assert_eq!(AllowanceStep::decide(one(), one()), AllowanceStep::Sufficient);
    assert_eq!(
        AllowanceStep::decide(tokens(5, TOKEN_DECIMALS), one()),
        AllowanceStep::Sufficient
    );
    assert_eq!(
        AllowanceStep::decide(U256::ZERO, one()),
        AllowanceStep::ApprovalRequired { amount: one() }
    );
}

#[test]
fn terminal_phases_are_final() {
    for terminal in [
        RequestPhase::Confirmed,
        RequestPhase::Rejected,
        RequestPhase::Failed,
    ] {
        assert!(!terminal.can_advance_to(RequestPhase::Submitting));
        assert!(!terminal.can_advance_to(RequestPhase::Failed));
    }
    assert!(!RequestPhase::CheckingAllowance.can_advance_to(RequestPhase::Confirmed));
    assert!(RequestPhase::Approving.can_advance_to(RequestPhase::Rejected));
}

#[tokio::test]
async fn happy_path_with_zero_allowance_approves_then_contributes() {
    let ledger = funded_ledger(Duration::ZERO).await;
    let orchestrator = orchestrator_for(&ledger);

    let outcomes = collect(orchestrator.submit("US", one()).expect("submit")).await;
    assert_eq!(
        kinds(&outcomes),
        vec![
            RequestPhase::CheckingAllowance,
            RequestPhase::Approving,
            RequestPhase::Approved,
            RequestPhase::Submitting,
            RequestPhase::Submitted,
            RequestPhase::Confirmed,
        ]
    );
    assert_eq!(outcomes[1], TransactionOutcome::Approving { amount: one() });
    let submitted_hash = match &outcomes[4] {
        TransactionOutcome::Submitted { tx_hash } => *tx_hash,
        other => panic!("unexpected {other:?}"),
    };
    assert!(matches!(
        &outcomes[5],
        TransactionOutcome::Confirmed { tx_hash, .. } if *tx_hash == submitted_hash
    ));
    assert_eq!(ledger.approve_calls(), 1);
    assert_eq!(ledger.read(&"US".parse().expect("id")).await.expect("read"), one());
    assert_eq!(orchestrator.in_flight(), None);
}

#[tokio::test]
async fn sufficient_allowance_skips_approval() {
    let ledger = funded_ledger(Duration::ZERO).await;
    ledger.set_allowance(OWNER, LEDGER, tokens(3, TOKEN_DECIMALS)).await;
    let orchestrator = orchestrator_for(&ledger);

    let outcomes = collect(orchestrator.submit("CN", one()).expect("submit")).await;
    assert_eq!(
        kinds(&outcomes),
        vec![
            RequestPhase::CheckingAllowance,
            RequestPhase::Submitting,
            RequestPhase::Submitted,
            RequestPhase::Confirmed,
        ]
    );
    assert_eq!(ledger.approve_calls(), 0);
}

#[tokio::test]
async fn invalid_input_never_reaches_the_ledger() {
    let ledger = funded_ledger(Duration::ZERO).await;
    let orchestrator = orchestrator_for(&ledger);

    assert!(matches!(
        orchestrator.submit("ZZ", one()),
        Err(SubmitError::Validation(ValidationError::UnknownBucket(_)))
    ));
    assert!(matches!(
        orchestrator.submit("usa", one()),
        Err(SubmitError::Validation(ValidationError::MalformedBucketId(_)))
    ));
    assert!(matches!(
        orchestrator.submit("US", tokens(2, TOKEN_DECIMALS)),
        Err(SubmitError::Validation(ValidationError::WrongAmount { .. }))
    ));
    assert_eq!(ledger.allowance_calls(), 0);
    assert_eq!(ledger.contribute_calls(), 0);
    assert!(orchestrator.in_flight().is_none());
}

#[tokio::test]
async fn disconnected_wallet_fails_before_any_ledger_call() {
    let ledger = funded_ledger(Duration::ZERO).await;
    let orchestrator = TransactionOrchestrator::new(
        SessionId::new(),
        catalog(),
        Arc::clone(&ledger) as _,
        WalletHandle::disconnected(),
        config(),
    );
    assert!(matches!(
        orchestrator.submit("US", one()),
        Err(SubmitError::WalletDisconnected)
    ));
    assert_eq!(ledger.allowance_calls(), 0);

    orchestrator.wallet().connect(ledger.signer(OWNER));
    let outcomes = collect(orchestrator.submit("US", one()).expect("submit")).await;
    assert!(matches!(
        outcomes.last(),
        Some(TransactionOutcome::Confirmed { .. })
    ));
}

#[tokio::test]
async fn concurrent_submits_admit_exactly_one() {
    let ledger = funded_ledger(Duration::from_millis(50)).await;
    let orchestrator = orchestrator_for(&ledger);

    let first = orchestrator.submit("US", one()).expect("first");
    let second = orchestrator.submit("CN", one()).expect("second");

    let second = collect(second).await;
    assert_eq!(second, vec![TransactionOutcome::AlreadyInFlight]);

    let first = collect(first).await;
    assert!(first
        .iter()
        .any(|outcome| matches!(outcome, TransactionOutcome::Submitted { .. })));
    assert_eq!(ledger.allowance_calls(), 1);
    assert_eq!(ledger.contribute_calls(), 1);
}

#[tokio::test]
async fn lock_is_released_on_every_terminal_outcome() {
    let ledger = funded_ledger(Duration::ZERO).await;
    ledger.decline_approvals(true).await;
    let orchestrator = orchestrator_for(&ledger);

    let declined = collect(orchestrator.submit("US", one()).expect("submit")).await;
    assert_eq!(
        declined.last(),
        Some(&TransactionOutcome::Rejected {
            reason: RejectReason::ApprovalDeclined
        })
    );
    assert!(orchestrator.in_flight().is_none());

    ledger.decline_approvals(false).await;
    let retried = collect(orchestrator.submit("US", one()).expect("retry")).await;
    assert!(matches!(
        retried.last(),
        Some(TransactionOutcome::Confirmed { .. })
    ));
}

#[tokio::test]
async fn declined_approval_never_attempts_contribution() {
    let ledger = funded_ledger(Duration::ZERO).await;
    ledger.decline_approvals(true).await;
    let orchestrator = orchestrator_for(&ledger);

    let outcomes = collect(orchestrator.submit("US", one()).expect("submit")).await;
    assert_eq!(
        kinds(&outcomes),
        vec![
            RequestPhase::CheckingAllowance,
            RequestPhase::Approving,
            RequestPhase::Rejected,
        ]
    );
    assert_eq!(ledger.contribute_calls(), 0);
}

#[tokio::test]
async fn reverted_approval_is_rejected_not_failed() {
    let ledger = funded_ledger(Duration::ZERO).await;
    ledger.revert_approvals(true).await;
    let orchestrator = orchestrator_for(&ledger);

    let outcomes = collect(orchestrator.submit("US", one()).expect("submit")).await;
    assert_eq!(
        outcomes.last(),
        Some(&TransactionOutcome::Rejected {
            reason: RejectReason::ApprovalReverted
        })
    );
    assert_eq!(ledger.contribute_calls(), 0);
}

#[tokio::test]
async fn declined_contribution_is_user_declined() {
    let ledger = funded_ledger(Duration::ZERO).await;
    ledger.set_allowance(OWNER, LEDGER, one()).await;
    ledger.decline_contributions(true).await;
    let orchestrator = orchestrator_for(&ledger);

    let outcomes = collect(orchestrator.submit("US", one()).expect("submit")).await;
    let last = outcomes.last().expect("terminal");
    assert_eq!(
        last,
        &TransactionOutcome::Rejected {
            reason: RejectReason::UserDeclined
        }
    );
    assert_eq!(last.error_class(), Some(ErrorClass::UserDeclined));
}

#[tokio::test]
async fn rate_limited_contribution_fails_with_decoded_reason() {
    let ledger = funded_ledger(Duration::ZERO).await;
    ledger.set_allowance(OWNER, LEDGER, tokens(5, TOKEN_DECIMALS)).await;
    let orchestrator = orchestrator_for(&ledger);

    let first = collect(orchestrator.submit("US", one()).expect("first")).await;
    assert!(matches!(first.last(), Some(TransactionOutcome::Confirmed { .. })));

    let second = collect(orchestrator.submit("US", one()).expect("second")).await;
    assert_eq!(
        second.last(),
        Some(&TransactionOutcome::Failed {
            reason: RATE_LIMIT_REASON.to_string()
        })
    );
    assert!(second
        .iter()
        .any(|outcome| matches!(outcome, TransactionOutcome::Submitted { .. })));
}

enum ContributeBehavior {
    CallException,
    TransportError,
    WaitError,
    DeclinedByMessage,
}

struct ScriptedSigner {
    behavior: ContributeBehavior,
    contribute_calls: AtomicUsize,
}

struct FailingWait;

#[async_trait]
impl PendingTransaction for FailingWait {
    fn tx_hash(&self) -> TxHash {
        TxHash::repeat_byte(0x42)
    }

    async fn wait(self: Box<Self>) -> Result<Receipt> {
        Err(anyhow!("receipt polling timed out"))
    }
}

#[async_trait]
impl LedgerSigner for ScriptedSigner {
    fn address(&self) -> Address {
        OWNER
    }

    async fn approve(
        &self,
        _spender: Address,
        _amount: U256,
    ) -> Result<Box<dyn PendingTransaction>> {
        Err(anyhow!("approve should not be called"))
    }

    async fn contribute(
        &self,
        _bucket: &BucketId,
        _amount: U256,
        _overrides: TxOverrides,
    ) -> Result<Box<dyn PendingTransaction>> {
        self.contribute_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            ContributeBehavior::CallException => Err(ProviderError::new(
                Some(ProviderErrorCode::CallException),
                "execution reverted",
            )
            .with_data(encode_error_string(RATE_LIMIT_REASON))
            .into()),
            ContributeBehavior::TransportError => Err(anyhow!("connection reset by peer")),
            ContributeBehavior::WaitError => Ok(Box::new(FailingWait)),
            ContributeBehavior::DeclinedByMessage => {
                Err(anyhow!("MetaMask Tx Signature: User denied transaction signature."))
            }
        }
    }
}

async fn run_scripted(behavior: ContributeBehavior) -> Vec<TransactionOutcome> {
    let ledger = SimulatedLedger::new(LEDGER, TOKEN);
    ledger.set_allowance(OWNER, LEDGER, one()).await;
    let signer = Arc::new(ScriptedSigner {
        behavior,
        contribute_calls: AtomicUsize::new(0),
    });
    let orchestrator = TransactionOrchestrator::new(
        SessionId::new(),
        catalog(),
        ledger as _,
        WalletHandle::connected(Arc::clone(&signer) as _),
        config(),
    );
    let outcomes = collect(orchestrator.submit("US", one()).expect("submit")).await;
    assert_eq!(signer.contribute_calls.load(Ordering::SeqCst), 1);
    assert!(orchestrator.in_flight().is_none());
    outcomes
}

#[tokio::test]
async fn pre_broadcast_revert_is_decoded() {
    let outcomes = run_scripted(ContributeBehavior::CallException).await;
    assert_eq!(
        kinds(&outcomes),
        vec![
            RequestPhase::CheckingAllowance,
            RequestPhase::Submitting,
            RequestPhase::Failed,
        ]
    );
    assert_eq!(
        outcomes.last(),
        Some(&TransactionOutcome::Failed {
            reason: RATE_LIMIT_REASON.to_string()
        })
    );
}

#[tokio::test]
async fn transport_errors_fail_with_context() {
    let outcomes = run_scripted(ContributeBehavior::TransportError).await;
    match outcomes.last() {
        Some(TransactionOutcome::Failed { reason }) => {
            assert!(reason.contains("connection reset"), "{reason}")
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn receipt_wait_error_fails_after_submission() {
    let outcomes = run_scripted(ContributeBehavior::WaitError).await;
    assert_eq!(
        kinds(&outcomes),
        vec![
            RequestPhase::CheckingAllowance,
            RequestPhase::Submitting,
            RequestPhase::Submitted,
            RequestPhase::Failed,
        ]
    );
}

#[tokio::test]
async fn message_only_decline_is_still_rejected() {
    let outcomes = run_scripted(ContributeBehavior::DeclinedByMessage).await;
    assert_eq!(
        outcomes.last(),
        Some(&TransactionOutcome::Rejected {
            reason: RejectReason::UserDeclined
        })
    );
}
