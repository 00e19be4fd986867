//! Core types for the escrow ledger
//!
//! All amounts are integer minor currency units (`u64`), so balances are
//! non-negative by construction and every debit is checked explicitly.
//! Types serialize deterministically with bincode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// User identifier (buyer, seller, admin, platform, system actor)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Which balance of a wallet an operation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bucket {
    /// Spendable funds
    Available,
    /// Funds earmarked in escrow
    Pending,
}

/// Per-user wallet, the materialized view over the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub wallet_id: Uuid,
    /// Owner
    pub user_id: UserId,
    /// Available funds
    pub balance: u64,
    /// Funds held in escrow for this user's open orders
    pub pending_balance: u64,
    /// Lifetime earnings (audit only)
    pub total_earned: u64,
    /// Lifetime spend (audit only)
    pub total_spent: u64,
    /// Hash of the latest ledger entry for this wallet
    pub head_hash: [u8; 32],
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Fresh zero-balance wallet
    pub fn open(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            wallet_id: Uuid::now_v7(),
            user_id,
            balance: 0,
            pending_balance: 0,
            total_earned: 0,
            total_spent: 0,
            head_hash: [0u8; 32],
            created_at: now,
            updated_at: now,
        }
    }

    /// Balance held in the given bucket
    pub fn bucket(&self, bucket: Bucket) -> u64 {
        match bucket {
            Bucket::Available => self.balance,
            Bucket::Pending => self.pending_balance,
        }
    }
}

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionKind {
    /// Funds enter the wallet from outside
    Deposit = 1,
    /// Funds leave the wallet to outside
    Withdrawal = 2,
    /// Available funds moved into escrow
    EscrowHold = 3,
    /// Escrowed funds paid out to the seller
    EscrowRelease = 4,
    /// Escrowed funds returned to the buyer
    Refund = 5,
    /// Direct purchase from available funds
    Purchase = 6,
    /// Platform fee credited to the fee account
    Commission = 7,
}

impl TransactionKind {
    /// Whether this kind adds to the available balance
    pub fn is_credit(&self) -> bool {
        match self {
            TransactionKind::Deposit
            | TransactionKind::EscrowRelease
            | TransactionKind::Refund
            | TransactionKind::Commission => true,
            TransactionKind::Withdrawal
            | TransactionKind::EscrowHold
            | TransactionKind::Purchase => false,
        }
    }

    /// Signed effect of an entry of this kind on the available balance
    pub fn signed_effect(&self, amount: u64) -> i128 {
        if self.is_credit() {
            amount as i128
        } else {
            -(amount as i128)
        }
    }

    /// Wire name
    pub fn code(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "DEPOSIT",
            TransactionKind::Withdrawal => "WITHDRAWAL",
            TransactionKind::EscrowHold => "ESCROW_HOLD",
            TransactionKind::EscrowRelease => "ESCROW_RELEASE",
            TransactionKind::Refund => "REFUND",
            TransactionKind::Purchase => "PURCHASE",
            TransactionKind::Commission => "COMMISSION",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Applied to the balance
    Completed = 1,
    /// Recorded, not yet applied
    Pending = 2,
    /// Attempted and failed
    Failed = 3,
    /// Withdrawn before applying
    Cancelled = 4,
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Opaque entry ID
    pub tx_id: Uuid,
    /// Global insertion sequence
    pub sequence: u64,
    /// Wallet the entry belongs to
    pub wallet_id: Uuid,
    /// Wallet owner
    pub user_id: UserId,
    /// Entry type
    pub kind: TransactionKind,
    /// Amount moved
    pub amount: u64,
    /// Fee withheld (informational, not part of the signed effect)
    pub fee: u64,
    /// Entry status
    pub status: TransactionStatus,
    /// Order this entry settles, if any
    pub order_id: Option<Uuid>,
    /// Available balance before the entry
    pub balance_before: u64,
    /// Available balance after the entry
    pub balance_after: u64,
    /// Free-form note
    pub description: Option<String>,
    /// Entry timestamp
    pub created_at: DateTime<Utc>,
    /// Hash of the previous entry in this wallet's chain
    pub previous_hash: [u8; 32],
    /// Hash of this entry
    pub entry_hash: [u8; 32],
}

impl Transaction {
    /// Check `balance_after == balance_before + signed_effect`
    pub fn is_balanced(&self) -> bool {
        self.balance_before as i128 + self.kind.signed_effect(self.amount)
            == self.balance_after as i128
    }
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderStatus {
    /// Created, escrow held, payment not yet confirmed
    Pending = 1,
    /// Payment confirmed
    Paid = 2,
    /// Seller working on it
    InProgress = 3,
    /// Handed to carrier
    Shipped = 4,
    /// Delivered, awaiting confirmation
    Delivered = 5,
    /// Paid out to seller (terminal)
    Completed = 6,
    /// Cancelled before payment, refunded (terminal)
    Cancelled = 7,
    /// Frozen by an open dispute
    Disputed = 8,
    /// Refunded by dispute resolution (terminal)
    Refunded = 9,
}

impl OrderStatus {
    /// Terminal statuses freeze the escrow status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }
}

/// Escrow status of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EscrowStatus {
    /// Buyer funds in pending balance
    Held = 1,
    /// Paid out to seller (terminal)
    Released = 2,
    /// Returned to buyer (terminal)
    Refunded = 3,
}

/// Dispute lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeStatus {
    /// No dispute ever opened
    None,
    /// Dispute open; order frozen
    Open,
    /// Dispute resolved (permanent)
    Resolved,
}

/// How an escrow is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    /// Pay the seller, minus the service fee
    ReleaseToSeller,
    /// Return the full amount to the buyer
    RefundToBuyer,
}

impl ResolutionOutcome {
    /// Wire name
    pub fn code(&self) -> &'static str {
        match self {
            ResolutionOutcome::ReleaseToSeller => "RELEASE_TO_SELLER",
            ResolutionOutcome::RefundToBuyer => "REFUND_TO_BUYER",
        }
    }
}

impl FromStr for ResolutionOutcome {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RELEASE_TO_SELLER" => Ok(ResolutionOutcome::ReleaseToSeller),
            "REFUND_TO_BUYER" => Ok(ResolutionOutcome::RefundToBuyer),
            other => Err(crate::Error::Validation(format!(
                "Unknown resolution outcome: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Request to move an order through the state table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    /// Payment captured
    ConfirmPayment,
    /// Seller starts work
    StartWork,
    /// Seller ships
    Ship,
    /// Seller or carrier reports delivery
    MarkDelivered,
    /// Either party opens a dispute
    OpenDispute,
    /// Escrow released to seller
    Release,
    /// Escrow refunded to buyer after dispute
    Refund,
    /// Cancelled before payment capture
    Cancel,
}

/// One purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order ID
    pub order_id: Uuid,
    /// Buyer
    pub buyer_id: UserId,
    /// Seller
    pub seller_id: UserId,
    /// Amount held from the buyer
    pub total_amount: u64,
    /// Platform fee taken on release
    pub service_fee: u64,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Escrow status
    pub escrow_status: EscrowStatus,
    /// Dispute status
    pub dispute_status: DisputeStatus,
    /// Why the dispute was opened
    pub dispute_reason: Option<String>,
    /// Who opened the dispute
    pub dispute_opened_by: Option<UserId>,
    /// Outcome chosen by the resolver
    pub dispute_resolution: Option<ResolutionOutcome>,
    /// Resolver notes
    pub resolution_notes: Option<String>,
    /// Who resolved the escrow
    pub dispute_resolved_by: Option<UserId>,
    /// When escrow left HELD
    pub escrow_released_at: Option<DateTime<Utc>>,
    /// When the order reached DELIVERED
    pub delivered_at: Option<DateTime<Utc>>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Order placement request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    /// Caller-assigned order ID
    pub order_id: Uuid,
    /// Buyer
    pub buyer_id: UserId,
    /// Seller
    pub seller_id: UserId,
    /// Amount to hold
    pub total_amount: u64,
    /// Platform fee taken on release
    pub service_fee: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_effect() {
        assert_eq!(TransactionKind::Deposit.signed_effect(100), 100);
        assert_eq!(TransactionKind::EscrowHold.signed_effect(100), -100);
        assert_eq!(TransactionKind::Refund.signed_effect(100), 100);
        assert_eq!(TransactionKind::Purchase.signed_effect(100), -100);
    }

    #[test]
    fn test_outcome_from_str() {
        assert_eq!(
            "RELEASE_TO_SELLER".parse::<ResolutionOutcome>().unwrap(),
            ResolutionOutcome::ReleaseToSeller
        );
        assert_eq!(
            "REFUND_TO_BUYER".parse::<ResolutionOutcome>().unwrap(),
            ResolutionOutcome::RefundToBuyer
        );
        assert!(matches!(
            "SPLIT".parse::<ResolutionOutcome>(),
            Err(crate::Error::Validation(_))
        ));
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
        assert!(!OrderStatus::Disputed.is_terminal());
        assert!(!OrderStatus::Delivered.is_terminal());
    }
}
