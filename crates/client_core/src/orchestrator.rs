use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, U256};
use ledger_gateway::{LedgerReader, LedgerSigner, TxOverrides, WalletHandle};
use shared::{
    domain::{BucketId, Catalog, RequestToken, SessionId},
    error::ValidationError,
    protocol::{RejectReason, TransactionOutcome},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    revert::{failure_reason, is_call_exception, is_user_decline, revert_payload},
    session_lock::{SessionLock, SessionLockGuard},
};

const OUTCOME_BUFFER: usize = 16;

pub type OutcomeStream = ReceiverStream<TransactionOutcome>;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ledger contract address; the spender of the allowance.
    pub spender: Address,
    /// The only amount a single request may contribute, in base units.
    pub unit: U256,
    pub gas_limit: Option<u64>,
    pub lock_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("wallet is not connected")]
    WalletDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionRequest {
    pub bucket: BucketId,
    pub amount: U256,
    pub token: RequestToken,
}

/// Whether an approval transaction has to precede the contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowanceStep {
    Sufficient,
    ApprovalRequired { amount: U256 },
}

impl AllowanceStep {
    /// Approves exactly the requested amount, never more.
    pub fn decide(current: U256, requested: U256) -> Self {
        if current >= requested {
            AllowanceStep::Sufficient
        } else {
            AllowanceStep::ApprovalRequired { amount: requested }
        }
    }
}

/// Per-request lifecycle. Terminal phases admit no further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Validating,
    CheckingAllowance,
    Approving,
    Approved,
    Submitting,
    Submitted,
    Confirmed,
    Rejected,
    Failed,
}

impl RequestPhase {
    pub fn of(outcome: &TransactionOutcome) -> Self {
        match outcome {
            TransactionOutcome::CheckingAllowance => RequestPhase::CheckingAllowance,
            TransactionOutcome::Approving { .. } => RequestPhase::Approving,
            TransactionOutcome::Approved => RequestPhase::Approved,
            TransactionOutcome::Submitting => RequestPhase::Submitting,
            TransactionOutcome::Submitted { .. } => RequestPhase::Submitted,
            TransactionOutcome::Confirmed { .. } => RequestPhase::Confirmed,
            TransactionOutcome::Rejected { .. } | TransactionOutcome::AlreadyInFlight => {
                RequestPhase::Rejected
            }
            TransactionOutcome::Failed { .. } => RequestPhase::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestPhase::Confirmed | RequestPhase::Rejected | RequestPhase::Failed
        )
    }

    pub fn can_advance_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Failed) => true,
            (Validating, CheckingAllowance | Rejected) => true,
            (CheckingAllowance, Approving | Submitting | Rejected) => true,
            (Approving, Approved | Rejected) => true,
            (Approved, Submitting) => true,
            (Submitting, Submitted | Rejected) => true,
            (Submitted, Confirmed | Rejected) => true,
            _ => false,
        }
    }
}

struct RequestTracker {
    token: RequestToken,
    phase: RequestPhase,
    outcomes: mpsc::Sender<TransactionOutcome>,
}

impl RequestTracker {
    async fn emit(&mut self, outcome: TransactionOutcome) {
        let next = RequestPhase::of(&outcome);
        if !self.phase.can_advance_to(next) {
            warn!(
                token = %self.token,
                from = ?self.phase,
                to = ?next,
                "orchestrator: dropping out-of-order outcome"
            );
            return;
        }
        debug!(token = %self.token, from = ?self.phase, to = ?next, "orchestrator: transition");
        self.phase = next;
        // The receiver may be gone; the chain work continues regardless.
        let _ = self.outcomes.send(outcome).await;
    }
}

/// Drives the allowance + contribution protocol for one session.
pub struct TransactionOrchestrator {
    catalog: Arc<Catalog>,
    reader: Arc<dyn LedgerReader>,
    wallet: WalletHandle,
    config: OrchestratorConfig,
    lock: SessionLock,
}

impl TransactionOrchestrator {
    pub fn new(
        session: SessionId,
        catalog: Arc<Catalog>,
        reader: Arc<dyn LedgerReader>,
        wallet: WalletHandle,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let lock = SessionLock::new(session, config.lock_timeout);
        Arc::new(Self {
            catalog,
            reader,
            wallet,
            config,
            lock,
        })
    }

    pub fn session(&self) -> SessionId {
        self.lock.session()
    }

    pub fn wallet(&self) -> &WalletHandle {
        &self.wallet
    }

    pub fn unit(&self) -> U256 {
        self.config.unit
    }

    pub fn in_flight(&self) -> Option<RequestToken> {
        self.lock.holder()
    }

    pub fn validate(&self, bucket: &str, amount: U256) -> Result<BucketId, ValidationError> {
        let bucket = self.catalog.resolve(bucket)?.id.clone();
        if amount != self.config.unit {
            return Err(ValidationError::WrongAmount {
                expected: self.config.unit.to_string(),
                actual: amount.to_string(),
            });
        }
        Ok(bucket)
    }

    /// Starts a contribution and returns its outcome stream.
    ///
    /// Invalid input and a disconnected wallet fail here without touching
    /// the ledger. If another request is in flight the stream carries a
    /// single `AlreadyInFlight`. Must be called within a Tokio runtime.
    pub fn submit(
        self: &Arc<Self>,
        bucket: &str,
        amount: U256,
    ) -> Result<OutcomeStream, SubmitError> {
        let bucket = self.validate(bucket, amount)?;
        let signer = self
            .wallet
            .current()
            .signer()
            .ok_or(SubmitError::WalletDisconnected)?;

        let (tx, rx) = mpsc::channel(OUTCOME_BUFFER);
        let guard = match self.lock.try_acquire() {
            Ok(guard) => guard,
            Err(busy) => {
                info!(
                    session = %self.session(),
                    %bucket,
                    holder = %busy.holder,
                    "orchestrator: request rejected, another is in flight"
                );
                let _ = tx.try_send(TransactionOutcome::AlreadyInFlight);
                return Ok(ReceiverStream::new(rx));
            }
        };

        let request = ContributionRequest {
            bucket,
            amount,
            token: guard.token(),
        };
        info!(
            session = %self.session(),
            token = %request.token,
            bucket = %request.bucket,
            "orchestrator: request accepted"
        );

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run(request, signer, guard, tx).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn run(
        &self,
        request: ContributionRequest,
        signer: Arc<dyn LedgerSigner>,
        guard: SessionLockGuard,
        outcomes: mpsc::Sender<TransactionOutcome>,
    ) {
        let mut tracker = RequestTracker {
            token: request.token,
            phase: RequestPhase::Validating,
            outcomes,
        };
        let terminal = self.drive(&request, signer.as_ref(), &mut tracker).await;

        // Release before reporting so a caller reacting to the terminal
        // outcome can submit again immediately.
        guard.release();
        match &terminal {
            TransactionOutcome::Confirmed { tx_hash, gas_used } => info!(
                token = %request.token,
                bucket = %request.bucket,
                %tx_hash,
                gas_used,
                "orchestrator: contribution confirmed"
            ),
            TransactionOutcome::Rejected { reason } => info!(
                token = %request.token,
                %reason,
                "orchestrator: request rejected"
            ),
            other => warn!(token = %request.token, outcome = ?other, "orchestrator: request failed"),
        }
        tracker.emit(terminal).await;
    }

    /// Runs the protocol up to, but not including, the terminal outcome,
    /// which is returned.
    async fn drive(
        &self,
        request: &ContributionRequest,
        signer: &dyn LedgerSigner,
        tracker: &mut RequestTracker,
    ) -> TransactionOutcome {
        tracker.emit(TransactionOutcome::CheckingAllowance).await;
        let current = match self
            .reader
            .allowance(signer.address(), self.config.spender)
            .await
        {
            Ok(current) => current,
            Err(err) if is_user_decline(&err) => {
                return TransactionOutcome::Rejected {
                    reason: RejectReason::UserDeclined,
                }
            }
            Err(err) => {
                return TransactionOutcome::Failed {
                    reason: format!("allowance query failed: {err}"),
                }
            }
        };

        match AllowanceStep::decide(current, request.amount) {
            AllowanceStep::Sufficient => {
                debug!(token = %request.token, %current, "orchestrator: allowance sufficient");
            }
            AllowanceStep::ApprovalRequired { amount } => {
                tracker
                    .emit(TransactionOutcome::Approving { amount })
                    .await;
                if let Err(outcome) = self.approve(signer, amount).await {
                    return outcome;
                }
                tracker.emit(TransactionOutcome::Approved).await;
            }
        }

        tracker.emit(TransactionOutcome::Submitting).await;
        let overrides = TxOverrides {
            gas_limit: self.config.gas_limit,
        };
        let pending = match signer
            .contribute(&request.bucket, request.amount, overrides)
            .await
        {
            Ok(pending) => pending,
            Err(err) => return contribution_failure(&err),
        };

        let tx_hash = pending.tx_hash();
        tracker
            .emit(TransactionOutcome::Submitted { tx_hash })
            .await;

        match pending.wait().await {
            Ok(receipt) if receipt.succeeded() => TransactionOutcome::Confirmed {
                tx_hash,
                gas_used: receipt.gas_used,
            },
            Ok(receipt) => TransactionOutcome::Failed {
                reason: failure_reason(receipt.revert_data.as_ref().map(|data| &data[..])),
            },
            Err(err) => contribution_failure(&err),
        }
    }

    async fn approve(
        &self,
        signer: &dyn LedgerSigner,
        amount: U256,
    ) -> Result<(), TransactionOutcome> {
        let pending = signer
            .approve(self.config.spender, amount)
            .await
            .map_err(|err| approval_failure(&err))?;
        let receipt = pending.wait().await.map_err(|err| approval_failure(&err))?;
        if !receipt.succeeded() {
            return Err(TransactionOutcome::Rejected {
                reason: RejectReason::ApprovalReverted,
            });
        }
        Ok(())
    }
}

fn approval_failure(err: &anyhow::Error) -> TransactionOutcome {
    if is_user_decline(err) {
        TransactionOutcome::Rejected {
            reason: RejectReason::ApprovalDeclined,
        }
    } else if revert_payload(err).is_some() || is_call_exception(err) {
        TransactionOutcome::Rejected {
            reason: RejectReason::ApprovalReverted,
        }
    } else {
        TransactionOutcome::Failed {
            reason: format!("approval failed: {err}"),
        }
    }
}

fn contribution_failure(err: &anyhow::Error) -> TransactionOutcome {
    if is_user_decline(err) {
        TransactionOutcome::Rejected {
            reason: RejectReason::UserDeclined,
        }
    } else if revert_payload(err).is_some() || is_call_exception(err) {
        TransactionOutcome::Failed {
            reason: failure_reason(revert_payload(err)),
        }
    } else {
        TransactionOutcome::Failed {
            reason: format!("contribution failed: {err}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
