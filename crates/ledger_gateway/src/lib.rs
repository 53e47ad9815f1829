use std::{fmt, sync::Arc};

use alloy_primitives::{Address, Bytes, TxHash, B256, U256};
use async_trait::async_trait;
use shared::domain::BucketId;
use thiserror::Error;
use tokio::sync::watch;

pub mod sim;

pub use sim::{SimulatedLedger, SimulatedSigner};

/// EIP-1193 "user rejected request".
pub const USER_REJECTED_CODE: i64 = 4001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorCode {
    /// Numeric JSON-RPC / EIP-1193 code.
    Rpc(i64),
    /// Signer refused the action (string-coded by some providers).
    ActionRejected,
    /// A call or estimation reverted before broadcast.
    CallException,
    Disconnected,
}

impl ProviderErrorCode {
    pub fn is_user_rejection(self) -> bool {
        matches!(
            self,
            ProviderErrorCode::Rpc(USER_REJECTED_CODE) | ProviderErrorCode::ActionRejected
        )
    }
}

/// Structured error surfaced by a wallet or RPC provider.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub code: Option<ProviderErrorCode>,
    pub message: String,
    /// Raw revert payload, when the provider reports one.
    pub data: Option<Bytes>,
}

impl ProviderError {
    pub fn new(code: Option<ProviderErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn user_rejected() -> Self {
        Self::new(
            Some(ProviderErrorCode::Rpc(USER_REJECTED_CODE)),
            "user rejected transaction",
        )
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    /// 1 on success, 0 when the transaction was mined but reverted.
    pub status: u64,
    pub logs: Vec<LogEntry>,
    pub gas_used: u64,
    pub revert_data: Option<Bytes>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOverrides {
    pub gas_limit: Option<u64>,
}

/// Read-only view calls. No signer required.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn read(&self, bucket: &BucketId) -> anyhow::Result<U256>;
    async fn allowance(&self, owner: Address, spender: Address) -> anyhow::Result<U256>;
}

/// A broadcast transaction awaiting inclusion.
#[async_trait]
pub trait PendingTransaction: Send {
    fn tx_hash(&self) -> TxHash;
    async fn wait(self: Box<Self>) -> anyhow::Result<Receipt>;
}

/// State-changing calls, signed by the connected wallet.
#[async_trait]
pub trait LedgerSigner: Send + Sync {
    fn address(&self) -> Address;
    async fn approve(
        &self,
        spender: Address,
        amount: U256,
    ) -> anyhow::Result<Box<dyn PendingTransaction>>;
    async fn contribute(
        &self,
        bucket: &BucketId,
        amount: U256,
        overrides: TxOverrides,
    ) -> anyhow::Result<Box<dyn PendingTransaction>>;
}

#[derive(Clone, Default)]
pub enum WalletState {
    #[default]
    Disconnected,
    Connected(Arc<dyn LedgerSigner>),
}

impl WalletState {
    pub fn signer(&self) -> Option<Arc<dyn LedgerSigner>> {
        match self {
            WalletState::Disconnected => None,
            WalletState::Connected(signer) => Some(Arc::clone(signer)),
        }
    }
}

impl fmt::Debug for WalletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletState::Disconnected => f.write_str("Disconnected"),
            WalletState::Connected(signer) => {
                f.debug_tuple("Connected").field(&signer.address()).finish()
            }
        }
    }
}

/// Injected wallet capability. Starts disconnected; the host connects and
/// disconnects it as the provider comes and goes.
#[derive(Clone)]
pub struct WalletHandle {
    state: Arc<watch::Sender<WalletState>>,
}

impl WalletHandle {
    pub fn disconnected() -> Self {
        let (state, _) = watch::channel(WalletState::Disconnected);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn connected(signer: Arc<dyn LedgerSigner>) -> Self {
        let handle = Self::disconnected();
        handle.connect(signer);
        handle
    }

    pub fn connect(&self, signer: Arc<dyn LedgerSigner>) {
        tracing::info!(address = %signer.address(), "wallet connected");
        self.state.send_replace(WalletState::Connected(signer));
    }

    pub fn disconnect(&self) {
        if self.is_connected() {
            tracing::info!("wallet disconnected");
        }
        self.state.send_replace(WalletState::Disconnected);
    }

    pub fn current(&self) -> WalletState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), WalletState::Connected(_))
    }

    pub fn subscribe(&self) -> watch::Receiver<WalletState> {
        self.state.subscribe()
    }
}

impl Default for WalletHandle {
    fn default() -> Self {
        Self::disconnected()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
