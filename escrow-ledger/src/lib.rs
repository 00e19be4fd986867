//! Escrow Ledger
//!
//! Escrow ledger and order fulfillment state machine for a marketplace.
//! Buyer funds are held in escrow when an order is placed and leave it
//! exactly once: released to the seller (minus the platform fee) or
//! refunded to the buyer.
//!
//! # Architecture
//!
//! - **Unit of Work**: every mutation reads, validates and writes through one
//!   atomic RocksDB batch
//! - **Single Writer**: one actor task executes all mutations in order
//! - **Append-only journal**: wallet balances are replayable from
//!   hash-chained ledger entries
//! - **Outbox**: notifications leave only after commit
//!
//! # Invariants
//!
//! - Money conservation: a resolution moves exactly the held amount
//! - At-most-once: escrow goes HELD → RELEASED | REFUNDED once
//! - No negative balances: debits fail instead of clamping
//! - Replay: journal replay equals the materialized balance

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod config;
pub mod crypto;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod journal;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod order;
pub mod storage;
pub mod sweeper;
pub mod types;
pub mod wallet;

// Re-exports
pub use config::Config;
pub use error::{Error, ErrorCategory, Result};
pub use escrow::{EscrowResolver, Resolution};
pub use journal::ReconciliationReport;
pub use ledger::Ledger;
pub use notify::{ChannelEmitter, Notification, NotificationEmitter, NotificationKind, TracingEmitter};
pub use storage::{Storage, StorageStats, UnitOfWork};
pub use sweeper::{SweepReport, Sweeper};
pub use types::{
    DisputeStatus, EscrowStatus, NewOrder, Order, OrderAction, OrderStatus, ResolutionOutcome,
    Transaction, TransactionKind, TransactionStatus, UserId, Wallet,
};
