//! Wallet accessor
//!
//! The only code that changes wallet balances. Each operation reads the
//! wallet through the unit of work, checks funds, writes the new balances and
//! appends the matching journal entry in the same unit, so a balance change
//! and its entry land together or not at all.
//!
//! Debits never clamp: a shortfall is [`Error::InsufficientFunds`].

use crate::{
    journal::{self, EntryDraft},
    storage::UnitOfWork,
    types::{Bucket, Transaction, TransactionKind, UserId, Wallet},
    Error, Result,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A balance movement to record
#[derive(Debug, Clone)]
pub struct Posting {
    /// Wallet owner
    pub user_id: UserId,
    /// Entry type
    pub kind: TransactionKind,
    /// Amount moved
    pub amount: u64,
    /// Fee withheld
    pub fee: u64,
    /// Order settled by the movement
    pub order_id: Option<Uuid>,
    /// Free-form note
    pub description: Option<String>,
}

impl Posting {
    /// New posting without order, fee or note
    pub fn new(user_id: UserId, kind: TransactionKind, amount: u64) -> Self {
        Self {
            user_id,
            kind,
            amount,
            fee: 0,
            order_id: None,
            description: None,
        }
    }

    /// Attach the order being settled
    pub fn for_order(mut self, order_id: Uuid) -> Self {
        self.order_id = Some(order_id);
        self
    }

    /// Record the fee withheld
    pub fn with_fee(mut self, fee: u64) -> Self {
        self.fee = fee;
        self
    }

    /// Attach a note
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn into_draft(self) -> EntryDraft {
        EntryDraft {
            kind: self.kind,
            amount: self.amount,
            fee: self.fee,
            order_id: self.order_id,
            description: self.description,
        }
    }
}

/// How escrowed funds leave a buyer's pending balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingExit {
    /// Paid to the seller; counts toward the buyer's lifetime spend
    Released,
    /// Returned to the buyer's available balance by a separate credit
    Refunded,
}

/// Read a wallet, opening a zero-balance one if the user has none yet
pub fn load_or_open<U: UnitOfWork>(
    uow: &mut U,
    user_id: &UserId,
    now: DateTime<Utc>,
) -> Result<Wallet> {
    Ok(uow
        .wallet(user_id)?
        .unwrap_or_else(|| Wallet::open(user_id.clone(), now)))
}

/// Add to a wallet's available balance
pub fn credit<U: UnitOfWork>(
    uow: &mut U,
    posting: Posting,
    now: DateTime<Utc>,
) -> Result<Transaction> {
    check_posting(&posting, true)?;

    let mut wallet = load_or_open(uow, &posting.user_id, now)?;
    let before = wallet.balance;
    wallet.balance = before.checked_add(posting.amount).ok_or_else(|| {
        Error::AmountOverflow(format!("credit of {} to {}", posting.amount, posting.user_id))
    })?;
    if posting.kind == TransactionKind::EscrowRelease {
        wallet.total_earned = wallet.total_earned.saturating_add(posting.amount);
    }
    wallet.updated_at = now;

    let entry = journal::append(uow, &mut wallet, posting.into_draft(), before, now)?;
    uow.put_wallet(wallet);
    Ok(entry)
}

/// Take from a wallet's available balance
///
/// An `EscrowHold` debit moves the amount into the pending balance instead
/// of out of the wallet.
pub fn debit<U: UnitOfWork>(
    uow: &mut U,
    posting: Posting,
    now: DateTime<Utc>,
) -> Result<Transaction> {
    check_posting(&posting, false)?;

    let mut wallet = load_or_open(uow, &posting.user_id, now)?;
    let before = wallet.bucket(Bucket::Available);
    wallet.balance = before
        .checked_sub(posting.amount)
        .ok_or_else(|| Error::InsufficientFunds {
            user_id: posting.user_id.clone(),
            bucket: Bucket::Available,
            required: posting.amount,
            available: before,
        })?;
    match posting.kind {
        TransactionKind::EscrowHold => {
            wallet.pending_balance = wallet
                .pending_balance
                .checked_add(posting.amount)
                .ok_or_else(|| {
                    Error::AmountOverflow(format!("hold of {} for {}", posting.amount, posting.user_id))
                })?;
        }
        TransactionKind::Purchase => {
            wallet.total_spent = wallet.total_spent.saturating_add(posting.amount);
        }
        _ => {}
    }
    wallet.updated_at = now;

    let entry = journal::append(uow, &mut wallet, posting.into_draft(), before, now)?;
    uow.put_wallet(wallet);
    Ok(entry)
}

/// Take escrowed funds out of a buyer's pending balance
///
/// Pending movements have no journal entry of their own: the pending balance
/// is reconciled against the buyer's HELD orders, and the counterpart credit
/// (release, refund) is journaled by the caller in the same unit.
pub fn debit_pending<U: UnitOfWork>(
    uow: &mut U,
    user_id: &UserId,
    amount: u64,
    exit: PendingExit,
    now: DateTime<Utc>,
) -> Result<Wallet> {
    if amount == 0 {
        return Err(Error::Validation("Pending debit must be positive".to_string()));
    }

    let mut wallet = uow
        .wallet(user_id)?
        .ok_or_else(|| Error::InsufficientFunds {
            user_id: user_id.clone(),
            bucket: Bucket::Pending,
            required: amount,
            available: 0,
        })?;
    let available = wallet.bucket(Bucket::Pending);
    wallet.pending_balance =
        available
            .checked_sub(amount)
            .ok_or_else(|| Error::InsufficientFunds {
                user_id: user_id.clone(),
                bucket: Bucket::Pending,
                required: amount,
                available,
            })?;
    if exit == PendingExit::Released {
        wallet.total_spent = wallet.total_spent.saturating_add(amount);
    }
    wallet.updated_at = now;

    uow.put_wallet(wallet.clone());
    Ok(wallet)
}

fn check_posting(posting: &Posting, credit: bool) -> Result<()> {
    if posting.amount == 0 {
        return Err(Error::Validation(format!(
            "{} amount must be positive",
            posting.kind
        )));
    }
    if posting.kind.is_credit() != credit {
        return Err(Error::Validation(format!(
            "{} cannot be posted as a {}",
            posting.kind,
            if credit { "credit" } else { "debit" }
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::test_storage;

    #[test]
    fn test_credit_opens_wallet() {
        let (storage, _temp) = test_storage();
        let alice = UserId::new("alice");

        let mut uow = storage.begin().unwrap();
        let entry = credit(
            &mut uow,
            Posting::new(alice.clone(), TransactionKind::Deposit, 500),
            Utc::now(),
        )
        .unwrap();
        uow.commit().unwrap();

        assert_eq!(entry.balance_before, 0);
        assert_eq!(entry.balance_after, 500);
        assert_eq!(storage.get_wallet(&alice).unwrap().unwrap().balance, 500);
    }

    #[test]
    fn test_debit_never_clamps() {
        let (storage, _temp) = test_storage();
        let alice = UserId::new("alice");

        let mut uow = storage.begin().unwrap();
        credit(&mut uow, Posting::new(alice.clone(), TransactionKind::Deposit, 100), Utc::now())
            .unwrap();
        let result = debit(
            &mut uow,
            Posting::new(alice.clone(), TransactionKind::Withdrawal, 101),
            Utc::now(),
        );

        match result {
            Err(Error::InsufficientFunds { required, available, bucket, .. }) => {
                assert_eq!(required, 101);
                assert_eq!(available, 100);
                assert_eq!(bucket, Bucket::Available);
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }
    }

    #[test]
    fn test_hold_moves_to_pending() {
        let (storage, _temp) = test_storage();
        let alice = UserId::new("alice");
        let order_id = Uuid::now_v7();

        let mut uow = storage.begin().unwrap();
        credit(&mut uow, Posting::new(alice.clone(), TransactionKind::Deposit, 1_000), Utc::now())
            .unwrap();
        let hold = debit(
            &mut uow,
            Posting::new(alice.clone(), TransactionKind::EscrowHold, 400).for_order(order_id),
            Utc::now(),
        )
        .unwrap();
        uow.commit().unwrap();

        assert_eq!(hold.balance_after, 600);
        assert_eq!(hold.order_id, Some(order_id));
        let wallet = storage.get_wallet(&alice).unwrap().unwrap();
        assert_eq!(wallet.balance, 600);
        assert_eq!(wallet.pending_balance, 400);
    }

    #[test]
    fn test_pending_shortfall() {
        let (storage, _temp) = test_storage();
        let alice = UserId::new("alice");

        let mut uow = storage.begin().unwrap();
        credit(&mut uow, Posting::new(alice.clone(), TransactionKind::Deposit, 100), Utc::now())
            .unwrap();
        let result = debit_pending(&mut uow, &alice, 50, PendingExit::Refunded, Utc::now());
        assert!(matches!(
            result,
            Err(Error::InsufficientFunds { bucket: Bucket::Pending, .. })
        ));
    }

    #[test]
    fn test_kind_direction_checked() {
        let (storage, _temp) = test_storage();
        let mut uow = storage.begin().unwrap();
        let result = credit(
            &mut uow,
            Posting::new(UserId::new("alice"), TransactionKind::Withdrawal, 10),
            Utc::now(),
        );
        assert!(matches!(result, Err(Error::Validation(_))));

        let result = credit(
            &mut uow,
            Posting::new(UserId::new("alice"), TransactionKind::Deposit, 0),
            Utc::now(),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
