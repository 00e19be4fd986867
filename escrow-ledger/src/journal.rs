//! Ledger store: the append-only journal of balance-affecting entries
//!
//! `append` is the only write primitive and always runs inside a
//! [`UnitOfWork`]. Everything else here is a read used for audit:
//! point-in-time balances, replay, and reconciliation of the journal against
//! the materialized wallets.
//!
//! # Invariants
//!
//! - Every entry satisfies `balance_after == balance_before + signed_effect`
//! - Replaying a wallet's entries in insertion order yields its balance
//! - A buyer's pending balance equals the total of their HELD orders

use crate::{
    crypto::{self, GENESIS_HASH},
    storage::{Storage, UnitOfWork},
    types::{EscrowStatus, Transaction, TransactionKind, TransactionStatus, UserId, Wallet},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entry fields supplied by the wallet accessor
#[derive(Debug, Clone)]
pub struct EntryDraft {
    /// Entry type
    pub kind: TransactionKind,
    /// Amount moved
    pub amount: u64,
    /// Fee withheld
    pub fee: u64,
    /// Order settled by the entry
    pub order_id: Option<Uuid>,
    /// Free-form note
    pub description: Option<String>,
}

/// Append an entry for a wallet whose balance already moved from `balance_before`
///
/// Advances the wallet's hash chain head; the caller stages the wallet.
pub fn append<U: UnitOfWork>(
    uow: &mut U,
    wallet: &mut Wallet,
    draft: EntryDraft,
    balance_before: u64,
    now: DateTime<Utc>,
) -> Result<Transaction> {
    let mut entry = Transaction {
        tx_id: Uuid::now_v7(),
        sequence: uow.allocate_sequence()?,
        wallet_id: wallet.wallet_id,
        user_id: wallet.user_id.clone(),
        kind: draft.kind,
        amount: draft.amount,
        fee: draft.fee,
        status: TransactionStatus::Completed,
        order_id: draft.order_id,
        balance_before,
        balance_after: wallet.balance,
        description: draft.description,
        created_at: now,
        previous_hash: wallet.head_hash,
        entry_hash: GENESIS_HASH,
    };

    if !entry.is_balanced() {
        return Err(Error::IntegrityViolation(format!(
            "{} entry of {} for {} moves balance {} -> {}",
            entry.kind, entry.amount, entry.user_id, entry.balance_before, entry.balance_after
        )));
    }

    entry.entry_hash = crypto::hash_transaction(&entry);
    wallet.head_hash = entry.entry_hash;
    uow.append_transaction(entry.clone());

    tracing::debug!(
        tx_id = %entry.tx_id,
        user_id = %entry.user_id,
        kind = %entry.kind,
        amount = entry.amount,
        balance_after = entry.balance_after,
        "Ledger entry staged"
    );

    Ok(entry)
}

/// Replay entries in insertion order and return the resulting balance
///
/// Fails if an entry is unbalanced, does not continue from its predecessor,
/// or would take the balance below zero.
pub fn replay(entries: &[Transaction]) -> Result<u64> {
    let mut balance: i128 = 0;
    for entry in entries.iter().filter(|e| e.status == TransactionStatus::Completed) {
        if entry.balance_before as i128 != balance {
            return Err(Error::IntegrityViolation(format!(
                "Entry {} starts at {} but replayed balance is {}",
                entry.tx_id, entry.balance_before, balance
            )));
        }
        if !entry.is_balanced() {
            return Err(Error::IntegrityViolation(format!(
                "Entry {} is unbalanced",
                entry.tx_id
            )));
        }
        balance += entry.kind.signed_effect(entry.amount);
        if balance < 0 {
            return Err(Error::IntegrityViolation(format!(
                "Replay goes negative at entry {}",
                entry.tx_id
            )));
        }
    }
    u64::try_from(balance)
        .map_err(|_| Error::IntegrityViolation("Replayed balance out of range".to_string()))
}

/// Available balance of a wallet as of `at`, derived from the journal
pub fn balance_as_of(storage: &Storage, wallet_id: Uuid, at: DateTime<Utc>) -> Result<u64> {
    let entries: Vec<Transaction> = storage
        .wallet_transactions(wallet_id)?
        .into_iter()
        .filter(|e| e.created_at <= at)
        .collect();
    replay(&entries)
}

/// Outcome of reconciling one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Wallet owner
    pub user_id: UserId,
    /// Wallet ID
    pub wallet_id: Uuid,
    /// Materialized available balance
    pub balance: u64,
    /// Balance rebuilt from the journal
    pub replayed_balance: u64,
    /// Materialized pending balance
    pub pending_balance: u64,
    /// Total of the user's HELD orders
    pub held_in_escrow: u64,
    /// Entries replayed
    pub entry_count: usize,
}

/// Reconcile one wallet against its journal and its HELD orders
///
/// Writers are paused for the whole pass, so the wallet row, journal and
/// orders are read from one committed state. Any divergence is an
/// [`Error::IntegrityViolation`].
pub fn reconcile_wallet(storage: &Storage, user_id: &UserId) -> Result<ReconciliationReport> {
    let _writers = storage.pause_writers();
    let wallet = storage
        .get_wallet(user_id)?
        .ok_or_else(|| Error::WalletNotFound(user_id.clone()))?;
    reconcile(storage, &wallet)
}

/// Reconcile every wallet
pub fn reconcile_all(storage: &Storage) -> Result<Vec<ReconciliationReport>> {
    let _writers = storage.pause_writers();
    storage
        .list_wallets()?
        .iter()
        .map(|wallet| reconcile(storage, wallet))
        .collect()
}

fn reconcile(storage: &Storage, wallet: &Wallet) -> Result<ReconciliationReport> {
    let entries = storage.wallet_transactions(wallet.wallet_id)?;

    let head = crypto::verify_chain(&entries)?;
    if head != wallet.head_hash {
        return Err(Error::IntegrityViolation(format!(
            "Wallet {} chain head {} does not match journal head {}",
            wallet.user_id,
            crypto::to_hex(&wallet.head_hash),
            crypto::to_hex(&head)
        )));
    }

    let replayed_balance = replay(&entries)?;
    if replayed_balance != wallet.balance {
        return Err(Error::IntegrityViolation(format!(
            "Wallet {} balance {} diverges from journal replay {}",
            wallet.user_id, wallet.balance, replayed_balance
        )));
    }

    let held_in_escrow = storage
        .orders_by_buyer(&wallet.user_id)?
        .iter()
        .filter(|order| order.escrow_status == EscrowStatus::Held)
        .try_fold(0u64, |acc, order| acc.checked_add(order.total_amount))
        .ok_or_else(|| Error::IntegrityViolation("Held total overflows".to_string()))?;
    if held_in_escrow != wallet.pending_balance {
        return Err(Error::IntegrityViolation(format!(
            "Wallet {} pending balance {} diverges from held orders {}",
            wallet.user_id, wallet.pending_balance, held_in_escrow
        )));
    }

    Ok(ReconciliationReport {
        user_id: wallet.user_id.clone(),
        wallet_id: wallet.wallet_id,
        balance: wallet.balance,
        replayed_balance,
        pending_balance: wallet.pending_balance,
        held_in_escrow,
        entry_count: entries.len(),
    })
}
