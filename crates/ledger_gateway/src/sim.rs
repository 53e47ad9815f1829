//! In-process ledger that behaves like the deployed contract pair (token +
//! bucket map) from a client's point of view.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use alloy_primitives::{keccak256, Address, Bytes, TxHash, U256};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::BucketId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    LedgerReader, LedgerSigner, LogEntry, PendingTransaction, ProviderError, Receipt,
    TxOverrides,
};

const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
const APPROVE_GAS: u64 = 46_000;
const CONTRIBUTE_GAS: u64 = 85_000;
const REVERT_GAS: u64 = 31_000;
pub const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(60 * 60);

pub const RATE_LIMIT_REASON: &str = "rate limit: one contribution per hour";
pub const INSUFFICIENT_ALLOWANCE_REASON: &str = "ERC20: insufficient allowance";
pub const INSUFFICIENT_BALANCE_REASON: &str = "ERC20: transfer amount exceeds balance";

/// ABI-encodes `Error(string)`, the payload of a `revert("...")`.
pub fn encode_error_string(reason: &str) -> Bytes {
    let data = reason.as_bytes();
    let padded_len = data.len().div_ceil(32) * 32;
    let mut out = Vec::with_capacity(4 + 64 + padded_len);
    out.extend_from_slice(&ERROR_STRING_SELECTOR);
    out.extend_from_slice(&U256::from(32u64).to_be_bytes::<32>());
    out.extend_from_slice(&U256::from(data.len()).to_be_bytes::<32>());
    out.extend_from_slice(data);
    out.resize(4 + 64 + padded_len, 0);
    Bytes::from(out)
}

#[derive(Default)]
struct LedgerState {
    totals: HashMap<BucketId, U256>,
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    last_contribution: HashMap<Address, Instant>,
    failing_reads: HashSet<BucketId>,
    decline_approvals: bool,
    decline_contributions: bool,
    revert_approvals: bool,
}

/// Simulated ledger. Transactions execute at broadcast; `wait()` models
/// block inclusion latency.
pub struct SimulatedLedger {
    address: Address,
    token_address: Address,
    throttle_window: Duration,
    block_time: Duration,
    read_delay_ms: AtomicU64,
    state: Mutex<LedgerState>,
    nonce: AtomicU64,
    read_calls: AtomicUsize,
    allowance_calls: AtomicUsize,
    approve_calls: AtomicUsize,
    contribute_calls: AtomicUsize,
}

impl SimulatedLedger {
    pub fn new(address: Address, token_address: Address) -> Arc<Self> {
        Self::with_timing(address, token_address, DEFAULT_THROTTLE_WINDOW, Duration::ZERO)
    }

    pub fn with_timing(
        address: Address,
        token_address: Address,
        throttle_window: Duration,
        block_time: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            token_address,
            throttle_window,
            block_time,
            read_delay_ms: AtomicU64::new(0),
            state: Mutex::new(LedgerState::default()),
            nonce: AtomicU64::new(1),
            read_calls: AtomicUsize::new(0),
            allowance_calls: AtomicUsize::new(0),
            approve_calls: AtomicUsize::new(0),
            contribute_calls: AtomicUsize::new(0),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signer(self: &Arc<Self>, owner: Address) -> Arc<SimulatedSigner> {
        Arc::new(SimulatedSigner {
            ledger: Arc::clone(self),
            owner,
        })
    }

    pub async fn set_total(&self, bucket: &BucketId, amount: U256) {
        self.state.lock().await.totals.insert(bucket.clone(), amount);
    }

    pub async fn mint(&self, owner: Address, amount: U256) {
        let mut state = self.state.lock().await;
        let balance = state.balances.entry(owner).or_default();
        *balance = balance.saturating_add(amount);
    }

    pub async fn set_allowance(&self, owner: Address, spender: Address, amount: U256) {
        self.state
            .lock()
            .await
            .allowances
            .insert((owner, spender), amount);
    }

    pub async fn balance_of(&self, owner: Address) -> U256 {
        self.state
            .lock()
            .await
            .balances
            .get(&owner)
            .copied()
            .unwrap_or_default()
    }

    pub async fn fail_reads_for(&self, bucket: &BucketId, failing: bool) {
        let mut state = self.state.lock().await;
        if failing {
            state.failing_reads.insert(bucket.clone());
        } else {
            state.failing_reads.remove(bucket);
        }
    }

    pub async fn decline_approvals(&self, decline: bool) {
        self.state.lock().await.decline_approvals = decline;
    }

    pub async fn decline_contributions(&self, decline: bool) {
        self.state.lock().await.decline_contributions = decline;
    }

    pub async fn revert_approvals(&self, revert: bool) {
        self.state.lock().await.revert_approvals = revert;
    }

    /// Forgets throttle history, as if the window elapsed for everyone.
    pub async fn reset_throttle(&self) {
        self.state.lock().await.last_contribution.clear();
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn allowance_calls(&self) -> usize {
        self.allowance_calls.load(Ordering::SeqCst)
    }

    pub fn approve_calls(&self) -> usize {
        self.approve_calls.load(Ordering::SeqCst)
    }

    pub fn contribute_calls(&self) -> usize {
        self.contribute_calls.load(Ordering::SeqCst)
    }

    pub fn set_read_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.read_delay_ms.store(millis, Ordering::SeqCst);
    }

    fn next_tx_hash(&self) -> TxHash {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        keccak256(nonce.to_be_bytes())
    }

    fn pending(&self, receipt: Receipt) -> Box<dyn PendingTransaction> {
        Box::new(SimulatedPending {
            receipt,
            block_time: self.block_time,
        })
    }

    fn reverted(&self, tx_hash: TxHash, reason: Option<&str>) -> Receipt {
        Receipt {
            tx_hash,
            status: 0,
            logs: Vec::new(),
            gas_used: REVERT_GAS,
            revert_data: reason.map(encode_error_string),
        }
    }

    async fn execute_approve(
        &self,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> Result<Receipt> {
        self.approve_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.decline_approvals {
            return Err(ProviderError::user_rejected().into());
        }
        let tx_hash = self.next_tx_hash();
        if state.revert_approvals {
            return Ok(self.reverted(tx_hash, None));
        }
        state.allowances.insert((owner, spender), amount);
        debug!(%owner, %spender, %amount, %tx_hash, "sim: approval mined");
        Ok(Receipt {
            tx_hash,
            status: 1,
            logs: vec![LogEntry {
                address: self.token_address,
                topics: vec![
                    keccak256("Approval(address,address,uint256)"),
                    owner.into_word(),
                    spender.into_word(),
                ],
                data: Bytes::from(amount.to_be_bytes::<32>().to_vec()),
            }],
            gas_used: APPROVE_GAS,
            revert_data: None,
        })
    }

    async fn execute_contribute(
        &self,
        owner: Address,
        bucket: &BucketId,
        amount: U256,
        overrides: TxOverrides,
    ) -> Result<Receipt> {
        self.contribute_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.decline_contributions {
            return Err(ProviderError::user_rejected().into());
        }
        let tx_hash = self.next_tx_hash();

        if overrides.gas_limit.is_some_and(|limit| limit < CONTRIBUTE_GAS) {
            return Ok(self.reverted(tx_hash, None));
        }
        let throttled = state
            .last_contribution
            .get(&owner)
            .is_some_and(|last| last.elapsed() < self.throttle_window);
        if throttled {
            return Ok(self.reverted(tx_hash, Some(RATE_LIMIT_REASON)));
        }
        let allowance = state
            .allowances
            .get(&(owner, self.address))
            .copied()
            .unwrap_or_default();
        if allowance < amount {
            return Ok(self.reverted(tx_hash, Some(INSUFFICIENT_ALLOWANCE_REASON)));
        }
        let balance = state.balances.get(&owner).copied().unwrap_or_default();
        if balance < amount {
            return Ok(self.reverted(tx_hash, Some(INSUFFICIENT_BALANCE_REASON)));
        }

        state
            .allowances
            .insert((owner, self.address), allowance - amount);
        state.balances.insert(owner, balance - amount);
        let total = state.totals.entry(bucket.clone()).or_default();
        *total = total.saturating_add(amount);
        state.last_contribution.insert(owner, Instant::now());
        debug!(%owner, %bucket, %amount, %tx_hash, "sim: contribution mined");

        Ok(Receipt {
            tx_hash,
            status: 1,
            logs: vec![LogEntry {
                address: self.address,
                topics: vec![
                    keccak256("ContributionMade(address,string,uint256)"),
                    owner.into_word(),
                ],
                data: Bytes::from(amount.to_be_bytes::<32>().to_vec()),
            }],
            gas_used: CONTRIBUTE_GAS,
            revert_data: None,
        })
    }
}

#[async_trait]
impl LedgerReader for SimulatedLedger {
    async fn read(&self, bucket: &BucketId) -> Result<U256> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.read_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let state = self.state.lock().await;
        if state.failing_reads.contains(bucket) {
            return Err(anyhow!("rpc timeout reading contributions for {bucket}"));
        }
        Ok(state.totals.get(bucket).copied().unwrap_or_default())
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<U256> {
        self.allowance_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .await
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default())
    }
}

pub struct SimulatedSigner {
    ledger: Arc<SimulatedLedger>,
    owner: Address,
}

#[async_trait]
impl LedgerSigner for SimulatedSigner {
    fn address(&self) -> Address {
        self.owner
    }

    async fn approve(
        &self,
        spender: Address,
        amount: U256,
    ) -> Result<Box<dyn PendingTransaction>> {
        let receipt = self
            .ledger
            .execute_approve(self.owner, spender, amount)
            .await?;
        Ok(self.ledger.pending(receipt))
    }

    async fn contribute(
        &self,
        bucket: &BucketId,
        amount: U256,
        overrides: TxOverrides,
    ) -> Result<Box<dyn PendingTransaction>> {
        let receipt = self
            .ledger
            .execute_contribute(self.owner, bucket, amount, overrides)
            .await?;
        Ok(self.ledger.pending(receipt))
    }
}

struct SimulatedPending {
    receipt: Receipt,
    block_time: Duration,
}

#[async_trait]
impl PendingTransaction for SimulatedPending {
    fn tx_hash(&self) -> TxHash {
        self.receipt.tx_hash
    }

    async fn wait(self: Box<Self>) -> Result<Receipt> {
        if !self.block_time.is_zero() {
            tokio::time::sleep(self.block_time).await;
        }
        Ok(self.receipt)
    }
}

#[cfg(test)]
#[path = "tests/sim_tests.rs"]
mod tests;
