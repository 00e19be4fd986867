//! Hashing for the ledger
//!
//! Every wallet's entries form a SHA-256 chain: each entry commits to the
//! previous entry's hash and to its own balance-affecting fields, so any
//! rewrite of history breaks reconciliation.

use crate::types::Transaction;
use crate::{Error, Result};
use sha2::{Digest, Sha256};

/// Chain head of a wallet with no entries
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Hash a ledger entry over its chained fields
pub fn hash_transaction(tx: &Transaction) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tx.previous_hash);
    hasher.update(tx.tx_id.as_bytes());
    hasher.update(tx.sequence.to_be_bytes());
    hasher.update(tx.wallet_id.as_bytes());
    hasher.update(tx.user_id.as_str().as_bytes());
    hasher.update([tx.kind as u8, tx.status as u8]);
    hasher.update(tx.amount.to_be_bytes());
    hasher.update(tx.fee.to_be_bytes());
    match tx.order_id {
        Some(order_id) => hasher.update(order_id.as_bytes()),
        None => hasher.update([0u8; 16]),
    }
    hasher.update(tx.balance_before.to_be_bytes());
    hasher.update(tx.balance_after.to_be_bytes());
    hasher.update(tx.created_at.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
    hasher.finalize().into()
}

/// Verify a wallet's entries (in insertion order) form an unbroken chain
///
/// Returns the hash of the last entry.
pub fn verify_chain(entries: &[Transaction]) -> Result<[u8; 32]> {
    let mut previous = GENESIS_HASH;
    for entry in entries {
        if entry.previous_hash != previous {
            return Err(Error::IntegrityViolation(format!(
                "Entry {} does not link to its predecessor",
                entry.tx_id
            )));
        }
        if hash_transaction(entry) != entry.entry_hash {
            return Err(Error::IntegrityViolation(format!(
                "Entry {} hash mismatch",
                entry.tx_id
            )));
        }
        previous = entry.entry_hash;
    }
    Ok(previous)
}

/// Hex encoding for logs
pub fn to_hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}
