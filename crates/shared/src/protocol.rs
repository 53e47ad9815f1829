use std::fmt;

use alloy_primitives::{TxHash, U256};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::BucketId,
    error::ErrorClass,
    units::whole_units_u128,
};

/// Range over buckets with a non-zero amount, in base units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: U256,
    pub max: U256,
}

impl Bounds {
    pub fn over<I>(amounts: I) -> Option<Self>
    where
        I: IntoIterator<Item = U256>,
    {
        amounts
            .into_iter()
            .filter(|amount| !amount.is_zero())
            .fold(None, |acc, amount| match acc {
                None => Some(Self {
                    min: amount,
                    max: amount,
                }),
                Some(bounds) => Some(Self {
                    min: bounds.min.min(amount),
                    max: bounds.max.max(amount),
                }),
            })
    }

    pub fn whole_units(&self, decimals: u8) -> (u128, u128) {
        (
            whole_units_u128(self.min, decimals),
            whole_units_u128(self.max, decimals),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketView {
    pub id: BucketId,
    pub name: String,
    pub amount: U256,
    pub rank: usize,
}

impl BucketView {
    pub fn tooltip(&self, symbol: &str, decimals: u8) -> String {
        format!(
            "{}\nColony size: {} {symbol}",
            self.name,
            whole_units_u128(self.amount, decimals)
        )
    }
}

/// Read model handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotView {
    pub buckets: Vec<BucketView>,
    pub bounds: Option<Bounds>,
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl SnapshotView {
    /// Buckets with a non-zero amount, largest first.
    pub fn leaders(&self) -> impl Iterator<Item = &BucketView> {
        self.buckets.iter().filter(|bucket| !bucket.amount.is_zero())
    }

    pub fn bucket(&self, id: &BucketId) -> Option<&BucketView> {
        self.buckets.iter().find(|bucket| &bucket.id == id)
    }

    pub fn color_scale(&self, decimals: u8) -> ColorScale {
        ColorScale::new(self.bounds, decimals)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fill {
    NoContribution,
    /// Position in `[0, 1]` between the smallest and largest bucket.
    Intensity(f64),
}

/// Sequential color scale over whole-token amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorScale {
    range: Option<(u128, u128)>,
    decimals: u8,
}

impl ColorScale {
    pub fn new(bounds: Option<Bounds>, decimals: u8) -> Self {
        Self {
            range: bounds.map(|bounds| bounds.whole_units(decimals)),
            decimals,
        }
    }

    /// Legend endpoints `(smallest, largest)`, if any bucket has contributions.
    pub fn legend(&self) -> Option<(u128, u128)> {
        self.range
    }

    pub fn fill(&self, amount: U256) -> Fill {
        let Some((min, max)) = self.range else {
            return Fill::NoContribution;
        };
        let whole = whole_units_u128(amount, self.decimals);
        if whole == 0 {
            return Fill::NoContribution;
        }
        if max <= min {
            return Fill::Intensity(1.0);
        }
        let clamped = whole.clamp(min, max);
        Fill::Intensity((clamped - min) as f64 / (max - min) as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    ApprovalDeclined,
    ApprovalReverted,
    UserDeclined,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::ApprovalDeclined => "approval-declined",
            RejectReason::ApprovalReverted => "approval-reverted",
            RejectReason::UserDeclined => "user-declined",
        }
    }

    pub fn class(self) -> ErrorClass {
        match self {
            RejectReason::ApprovalDeclined | RejectReason::UserDeclined => {
                ErrorClass::UserDeclined
            }
            RejectReason::ApprovalReverted => ErrorClass::ChainRejected,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one contribution request, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TransactionOutcome {
    CheckingAllowance,
    Approving { amount: U256 },
    Approved,
    Submitting,
    Submitted { tx_hash: TxHash },
    Confirmed { tx_hash: TxHash, gas_used: u64 },
    Rejected { reason: RejectReason },
    Failed { reason: String },
    AlreadyInFlight,
}

impl TransactionOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionOutcome::Confirmed { .. }
                | TransactionOutcome::Rejected { .. }
                | TransactionOutcome::Failed { .. }
                | TransactionOutcome::AlreadyInFlight
        )
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            TransactionOutcome::Rejected { reason } => Some(reason.class()),
            TransactionOutcome::Failed { .. } => Some(ErrorClass::ChainRejected),
            _ => None,
        }
    }

    /// One-line status text for the given bucket display name. `at` is the
    /// local time shown in the success message.
    pub fn status_message(&self, bucket_name: &str, amount_text: &str, at: NaiveTime) -> String {
        match self {
            TransactionOutcome::CheckingAllowance => format!(
                "Contributing to the {bucket_name} colony. Your wallet may ask you to accept two transactions: the first authorizes the amount, the second makes the contribution."
            ),
            TransactionOutcome::Approving { .. } => {
                "Waiting for the spending approval to be confirmed...".to_string()
            }
            TransactionOutcome::Approved => "Approval confirmed.".to_string(),
            TransactionOutcome::Submitting => {
                "Please approve the contribution transaction.".to_string()
            }
            TransactionOutcome::Submitted { tx_hash } => {
                format!("Contribution pending ({tx_hash}).")
            }
            TransactionOutcome::Confirmed { .. } => format!(
                "You have successfully contributed {amount_text} to the {bucket_name} colony at {}!",
                at.format("%H:%M:%S")
            ),
            TransactionOutcome::Rejected { reason } => match reason {
                RejectReason::ApprovalReverted => "The spending approval failed on chain.".to_string(),
                RejectReason::ApprovalDeclined | RejectReason::UserDeclined => {
                    "Transaction signature declined.".to_string()
                }
            },
            TransactionOutcome::Failed { reason } => format!("Contribution failed: {reason}"),
            TransactionOutcome::AlreadyInFlight => {
                "A contribution is already in progress.".to_string()
            }
        }
    }
}
