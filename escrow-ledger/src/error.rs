//! Error types for the escrow ledger

use crate::types::{Bucket, OrderAction, OrderStatus, UserId};
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Rejected input (bad amount, unknown outcome, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A debit would take a balance below zero
    #[error("Insufficient funds for {user_id} ({bucket:?}): required {required}, available {available}")]
    InsufficientFunds {
        /// Wallet owner
        user_id: UserId,
        /// Balance that was debited
        bucket: Bucket,
        /// Amount requested
        required: u64,
        /// Amount present
        available: u64,
    },

    /// Wallet not found
    #[error("Wallet not found: {0}")]
    WalletNotFound(UserId),

    /// Order not found
    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    /// Order id already used
    #[error("Order already exists: {0}")]
    DuplicateOrder(Uuid),

    /// Transition not in the order state table
    #[error("Illegal transition for order {order_id}: {action:?} from {from:?}")]
    IllegalTransition {
        /// Order
        order_id: Uuid,
        /// Current status
        from: OrderStatus,
        /// Requested action
        action: OrderAction,
    },

    /// Escrow already left HELD
    #[error("Escrow already resolved for order {0}")]
    AlreadyResolved(Uuid),

    /// Order is not in a resolvable status
    #[error("Order {order_id} cannot be resolved in status {status:?}")]
    IllegalState {
        /// Order
        order_id: Uuid,
        /// Current status
        status: OrderStatus,
    },

    /// Actor is neither buyer nor seller of the order
    #[error("{actor} is not a party to order {order_id}")]
    NotAParty {
        /// Order
        order_id: Uuid,
        /// Offending actor
        actor: UserId,
    },

    /// Counter overflow on credit
    #[error("Amount overflow: {0}")]
    AmountOverflow(String),

    /// Ledger and materialized state disagree, or an invariant broke upstream
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Notification delivery failed
    #[error("Notification error: {0}")]
    Notification(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input, rejected before any mutation
    Validation,
    /// Expected state conflict; refresh and reconcile
    State,
    /// An invariant is already broken; alert, do not retry
    Integrity,
    /// Best-effort side effect failed after commit
    SideEffect,
    /// Storage, IO, runtime plumbing
    Infrastructure,
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_)
            | Error::NotAParty { .. }
            | Error::DuplicateOrder(_)
            | Error::AmountOverflow(_) => ErrorCategory::Validation,
            Error::InsufficientFunds { bucket: Bucket::Available, .. }
            | Error::WalletNotFound(_)
            | Error::OrderNotFound(_)
            | Error::IllegalTransition { .. }
            | Error::AlreadyResolved(_)
            | Error::IllegalState { .. } => ErrorCategory::State,
            // Pending funds back every HELD order; running short means the hold invariant broke.
            Error::InsufficientFunds { bucket: Bucket::Pending, .. }
            | Error::IntegrityViolation(_) => ErrorCategory::Integrity,
            Error::Notification(_) => ErrorCategory::SideEffect,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::Concurrency(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Whether this error should raise an integrity alarm
    pub fn is_integrity(&self) -> bool {
        self.category() == ErrorCategory::Integrity
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
