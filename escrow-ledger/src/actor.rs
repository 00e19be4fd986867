//! Actor-based concurrency for the ledger
//!
//! Every mutation runs on one task (the single writer). Each message is
//! executed as one unit of work: read, validate, move money, update the
//! order, commit. Notifications are queued only after the commit succeeds.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │         Ledger facade / sweeper (many tasks)          │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ LedgerHandle (Clone)
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │   Storage::begin() → escrow / dispute / order ops     │
//! │          → StorageTxn::commit() (WriteBatch)          │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ outbox (after commit only)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │      Notification dispatcher → NotificationEmitter    │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::{
    dispute,
    escrow::{EscrowResolver, Resolution},
    metrics::Metrics,
    notify::{Notification, NotificationKind},
    order,
    storage::{StorageTxn, UnitOfWork},
    types::{NewOrder, Order, OrderAction, ResolutionOutcome, Transaction, TransactionKind, UserId},
    wallet::{self, Posting},
    Error, Result, Storage,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Route a resolution request takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvePath {
    /// Administrative decision on a DELIVERED or DISPUTED order
    Direct,
    /// Administrative decision on an open dispute
    Dispute,
    /// Release of a DELIVERED order only (timeouts)
    DeliveredOnly,
    /// Buyer confirms receipt of a DELIVERED order
    BuyerConfirmation,
}

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Credit external funds
    Deposit {
        user_id: UserId,
        amount: u64,
        description: Option<String>,
        response: Reply<Transaction>,
    },

    /// Debit funds paid out
    Withdraw {
        user_id: UserId,
        amount: u64,
        description: Option<String>,
        response: Reply<Transaction>,
    },

    /// Create an order and hold its total
    Hold {
        request: NewOrder,
        response: Reply<(Order, Transaction)>,
    },

    /// Fulfillment transition without money movement
    Advance {
        order_id: Uuid,
        action: OrderAction,
        actor: UserId,
        response: Reply<Order>,
    },

    /// Open a dispute
    OpenDispute {
        order_id: Uuid,
        reason: String,
        opened_by: UserId,
        response: Reply<Order>,
    },

    /// Release or refund an escrow
    Resolve {
        order_id: Uuid,
        outcome: ResolutionOutcome,
        actor: UserId,
        notes: Option<String>,
        path: ResolvePath,
        response: Reply<Resolution>,
    },

    /// Cancel a PENDING order
    Cancel {
        order_id: Uuid,
        actor: UserId,
        reason: Option<String>,
        response: Reply<Resolution>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger messages
pub struct LedgerActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Escrow policy and money movements
    resolver: EscrowResolver,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,

    /// Committed notifications awaiting delivery
    outbox: mpsc::UnboundedSender<Notification>,

    metrics: Metrics,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        storage: Arc<Storage>,
        resolver: EscrowResolver,
        mailbox: mpsc::Receiver<LedgerMessage>,
        outbox: mpsc::UnboundedSender<Notification>,
        metrics: Metrics,
    ) -> Self {
        Self {
            storage,
            resolver,
            mailbox,
            outbox,
            metrics,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let LedgerMessage::Shutdown = msg {
                break;
            }
            self.handle_message(msg);
        }
        tracing::info!("Ledger actor stopped");
    }

    /// Handle a single message
    fn handle_message(&self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::Deposit {
                user_id,
                amount,
                description,
                response,
            } => {
                let result = self.execute(|uow, now| {
                    let mut posting = Posting::new(user_id, TransactionKind::Deposit, amount);
                    posting.description = description;
                    wallet::credit(uow, posting, now)
                });
                let _ = response.send(result);
            }

            LedgerMessage::Withdraw {
                user_id,
                amount,
                description,
                response,
            } => {
                let result = self.execute(|uow, now| {
                    let mut posting = Posting::new(user_id, TransactionKind::Withdrawal, amount);
                    posting.description = description;
                    wallet::debit(uow, posting, now)
                });
                let _ = response.send(result);
            }

            LedgerMessage::Hold { request, response } => {
                let result = self.execute(|uow, now| self.resolver.hold(uow, &request, now));
                if let Ok((order, _)) = &result {
                    self.metrics.holds_total.inc();
                    self.notify(Notification::new(
                        order,
                        NotificationKind::OrderPlaced {
                            total_amount: order.total_amount,
                        },
                        &order.buyer_id,
                        order.created_at,
                    ));
                }
                let _ = response.send(result);
            }

            LedgerMessage::Advance {
                order_id,
                action,
                actor,
                response,
            } => {
                let result =
                    self.execute(|uow, now| order::advance(uow, order_id, action, &actor, now));
                if let Ok(order) = &result {
                    self.notify(Notification::new(
                        order,
                        NotificationKind::StatusChanged {
                            status: order.status,
                        },
                        &actor,
                        order.updated_at,
                    ));
                }
                let _ = response.send(result);
            }

            LedgerMessage::OpenDispute {
                order_id,
                reason,
                opened_by,
                response,
            } => {
                let result = self
                    .execute(|uow, now| dispute::open(uow, order_id, &reason, &opened_by, now));
                if let Ok(order) = &result {
                    self.metrics.disputes_opened_total.inc();
                    self.notify(Notification::new(
                        order,
                        NotificationKind::DisputeOpened {
                            reason: order.dispute_reason.clone().unwrap_or_default(),
                        },
                        &opened_by,
                        order.updated_at,
                    ));
                }
                let _ = response.send(result);
            }

            LedgerMessage::Resolve {
                order_id,
                outcome,
                actor,
                notes,
                path,
                response,
            } => {
                let started = Instant::now();
                let result = self.execute(|uow, now| match path {
                    ResolvePath::Direct => {
                        self.resolver.resolve(uow, order_id, outcome, &actor, notes, now)
                    }
                    ResolvePath::Dispute => dispute::resolve(
                        uow,
                        &self.resolver,
                        order_id,
                        outcome,
                        &actor,
                        notes,
                        now,
                    ),
                    ResolvePath::DeliveredOnly => {
                        self.resolver.complete_delivered(uow, order_id, &actor, notes, now)
                    }
                    ResolvePath::BuyerConfirmation => {
                        self.resolver.confirm_receipt(uow, order_id, &actor, now)
                    }
                });
                if let Ok(resolution) = &result {
                    self.metrics
                        .record_resolve_duration(started.elapsed().as_secs_f64());
                    match resolution.outcome {
                        ResolutionOutcome::ReleaseToSeller => self.metrics.releases_total.inc(),
                        ResolutionOutcome::RefundToBuyer => self.metrics.refunds_total.inc(),
                    }
                    self.notify(Notification::new(
                        &resolution.order,
                        NotificationKind::EscrowResolved {
                            outcome: resolution.outcome,
                        },
                        &actor,
                        resolution.order.updated_at,
                    ));
                }
                let _ = response.send(result);
            }

            LedgerMessage::Cancel {
                order_id,
                actor,
                reason,
                response,
            } => {
                let result = self
                    .execute(|uow, now| self.resolver.cancel(uow, order_id, &actor, reason, now));
                if let Ok(resolution) = &result {
                    self.metrics.cancellations_total.inc();
                    self.metrics.refunds_total.inc();
                    self.notify(Notification::new(
                        &resolution.order,
                        NotificationKind::OrderCancelled,
                        &actor,
                        resolution.order.updated_at,
                    ));
                }
                let _ = response.send(result);
            }

            LedgerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    /// Run `op` in a fresh unit of work and commit it
    ///
    /// On error the unit is dropped uncommitted.
    fn execute<T>(
        &self,
        op: impl FnOnce(&mut StorageTxn<'_>, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let result = self.storage.begin().and_then(|mut uow| {
            let value = op(&mut uow, Utc::now())?;
            uow.commit()?;
            Ok(value)
        });
        if let Err(e) = &result {
            self.observe_failure(e);
        }
        result
    }

    fn observe_failure(&self, error: &Error) {
        match error {
            Error::AlreadyResolved(order_id) => {
                self.metrics.already_resolved_total.inc();
                tracing::info!(order_id = %order_id, "Duplicate resolution rejected");
            }
            e if e.is_integrity() => {
                self.metrics.integrity_alarms_total.inc();
                tracing::error!(error = %e, alarm = "integrity", "Ledger integrity alarm");
            }
            e => {
                tracing::debug!(error = %e, category = ?e.category(), "Ledger operation rejected");
            }
        }
    }

    fn notify(&self, notification: Notification) {
        if self.outbox.send(notification).is_err() {
            tracing::warn!("Notification dispatcher gone; dropping notification");
        }
    }
}

impl std::fmt::Debug for LedgerActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerActor")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> LedgerMessage) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Credit external funds
    pub async fn deposit(
        &self,
        user_id: UserId,
        amount: u64,
        description: Option<String>,
    ) -> Result<Transaction> {
        self.request(|response| LedgerMessage::Deposit {
            user_id,
            amount,
            description,
            response,
        })
        .await
    }

    /// Debit funds paid out
    pub async fn withdraw(
        &self,
        user_id: UserId,
        amount: u64,
        description: Option<String>,
    ) -> Result<Transaction> {
        self.request(|response| LedgerMessage::Withdraw {
            user_id,
            amount,
            description,
            response,
        })
        .await
    }

    /// Create an order and hold its total
    pub async fn hold(&self, request: NewOrder) -> Result<(Order, Transaction)> {
        self.request(|response| LedgerMessage::Hold { request, response })
            .await
    }

    /// Apply a fulfillment action
    pub async fn advance(
        &self,
        order_id: Uuid,
        action: OrderAction,
        actor: UserId,
    ) -> Result<Order> {
        self.request(|response| LedgerMessage::Advance {
            order_id,
            action,
            actor,
            response,
        })
        .await
    }

    /// Open a dispute
    pub async fn open_dispute(
        &self,
        order_id: Uuid,
        reason: String,
        opened_by: UserId,
    ) -> Result<Order> {
        self.request(|response| LedgerMessage::OpenDispute {
            order_id,
            reason,
            opened_by,
            response,
        })
        .await
    }

    /// Release or refund an escrow
    pub async fn resolve(
        &self,
        order_id: Uuid,
        outcome: ResolutionOutcome,
        actor: UserId,
        notes: Option<String>,
        path: ResolvePath,
    ) -> Result<Resolution> {
        self.request(|response| LedgerMessage::Resolve {
            order_id,
            outcome,
            actor,
            notes,
            path,
            response,
        })
        .await
    }

    /// Cancel a PENDING order
    pub async fn cancel(
        &self,
        order_id: Uuid,
        actor: UserId,
        reason: Option<String>,
    ) -> Result<Resolution> {
        self.request(|response| LedgerMessage::Cancel {
            order_id,
            actor,
            reason,
            response,
        })
        .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    storage: Arc<Storage>,
    resolver: EscrowResolver,
    outbox: mpsc::UnboundedSender<Notification>,
    metrics: Metrics,
    mailbox_capacity: usize,
) -> (LedgerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_capacity);
    let actor = LedgerActor::new(storage, resolver, rx, outbox, metrics);

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    (LedgerHandle::new(tx), task)
}
