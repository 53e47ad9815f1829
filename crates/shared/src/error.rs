use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User-facing error taxonomy. Each class carries its own retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    TransientRead,
    UserDeclined,
    ChainRejected,
    FatalSetup,
}

impl ErrorClass {
    /// Whether the binding should present this as an error rather than an
    /// informational status.
    pub fn is_error(self) -> bool {
        !matches!(self, ErrorClass::UserDeclined)
    }

    pub fn retried_automatically(self) -> bool {
        matches!(self, ErrorClass::TransientRead)
    }

    pub fn blocks_interaction(self) -> bool {
        matches!(self, ErrorClass::FatalSetup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("malformed bucket id '{0}': expected two uppercase letters")]
    MalformedBucketId(String),
    #[error("unknown bucket '{0}'")]
    UnknownBucket(String),
    #[error("contribution amount must be exactly {expected} base units, got {actual}")]
    WrongAmount { expected: String, actual: String },
    #[error("invalid token amount '{0}'")]
    InvalidAmount(String),
}

impl ValidationError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to read catalog '{path}': {source}")]
    CatalogUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed catalog: {0}")]
    CatalogMalformed(String),
    #[error("catalog contains no buckets")]
    EmptyCatalog,
    #[error("duplicate bucket '{0}' in catalog")]
    DuplicateBucket(String),
    #[error("ledger gateway unreachable: {0}")]
    GatewayUnreachable(String),
    #[error("invalid setting {name}: {message}")]
    InvalidSetting { name: &'static str, message: String },
}

impl SetupError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::FatalSetup
    }
}

/// A single bucket read that failed. Absorbed by the aggregator.
#[derive(Debug, Clone, Error)]
#[error("read of bucket {bucket} failed: {message}")]
pub struct TransientReadError {
    pub bucket: String,
    pub message: String,
}

impl TransientReadError {
    pub fn new(bucket: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransientRead
    }
}
