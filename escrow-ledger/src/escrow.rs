//! Escrow resolver
//!
//! Every money movement tied to an order happens here, inside one
//! [`UnitOfWork`]: the escrow hold at placement, the release or refund that
//! ends it, and the refund of a cancelled order.
//!
//! # Resolution
//!
//! 1. Re-read the order; anything but HELD is [`Error::AlreadyResolved`].
//! 2. Check the status admits the outcome, else [`Error::IllegalState`].
//! 3. Move the money:
//!    - release: buyer pending −total, seller available +(total − fee)
//!      (`ESCROW_RELEASE`), platform available +fee (`COMMISSION`)
//!    - refund: buyer pending −total, buyer available +total (`REFUND`)
//! 4. Write the terminal order status and escrow status.
//!
//! Any error leaves the unit uncommitted, so nothing is visible. The caller
//! commits and only then emits notifications.

use crate::{
    config::EscrowConfig,
    order::{self, EscrowEffect},
    storage::UnitOfWork,
    types::{
        DisputeStatus, EscrowStatus, NewOrder, Order, OrderAction, OrderStatus, ResolutionOutcome,
        Transaction, TransactionKind, UserId,
    },
    wallet::{self, PendingExit, Posting},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of ending an escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Order after the transition
    pub order: Order,
    /// Which way the money went
    pub outcome: ResolutionOutcome,
    /// Whether the order was DISPUTED when resolved
    pub via_dispute: bool,
    /// Entries appended by the resolution
    pub transactions: Vec<Transaction>,
}

/// Executes escrow holds, releases and refunds against a unit of work
#[derive(Debug, Clone)]
pub struct EscrowResolver {
    platform_user: UserId,
    max_order_amount: u64,
}

impl EscrowResolver {
    /// Create from escrow policy
    pub fn new(config: &EscrowConfig) -> Self {
        Self {
            platform_user: config.platform_user(),
            max_order_amount: config.max_order_amount,
        }
    }

    /// Fee account owner
    pub fn platform_user(&self) -> &UserId {
        &self.platform_user
    }

    /// Create an order and hold its total from the buyer's available balance
    pub fn hold<U: UnitOfWork>(
        &self,
        uow: &mut U,
        request: &NewOrder,
        now: DateTime<Utc>,
    ) -> Result<(Order, Transaction)> {
        self.validate(request)?;

        if uow.order(request.order_id)?.is_some() {
            return Err(Error::DuplicateOrder(request.order_id));
        }

        let entry = wallet::debit(
            uow,
            Posting::new(
                request.buyer_id.clone(),
                TransactionKind::EscrowHold,
                request.total_amount,
            )
            .for_order(request.order_id),
            now,
        )?;

        let order = order::new_order(request, now);
        uow.put_order(order.clone())?;

        tracing::info!(
            order_id = %order.order_id,
            buyer_id = %order.buyer_id,
            seller_id = %order.seller_id,
            total_amount = order.total_amount,
            service_fee = order.service_fee,
            "Escrow held"
        );

        Ok((order, entry))
    }

    /// Release or refund the escrow of a DELIVERED or DISPUTED order
    pub fn resolve<U: UnitOfWork>(
        &self,
        uow: &mut U,
        order_id: Uuid,
        outcome: ResolutionOutcome,
        actor: &UserId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let order = order::load(uow, order_id)?;
        ensure_held(&order)?;

        let action = match outcome {
            ResolutionOutcome::ReleaseToSeller => OrderAction::Release,
            ResolutionOutcome::RefundToBuyer => OrderAction::Refund,
        };
        if order::step(order.status, action).is_none() {
            return Err(Error::IllegalState {
                order_id,
                status: order.status,
            });
        }

        self.settle(uow, order, action, actor, notes, now)
    }

    /// Release a DELIVERED order to its seller (buyer confirmation or timeout)
    ///
    /// Unlike [`resolve`](Self::resolve) this refuses DISPUTED orders, so a
    /// timeout racing a freshly opened dispute cannot pay the seller.
    pub fn complete_delivered<U: UnitOfWork>(
        &self,
        uow: &mut U,
        order_id: Uuid,
        actor: &UserId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let order = order::load(uow, order_id)?;
        ensure_held(&order)?;
        if order.status != OrderStatus::Delivered {
            return Err(Error::IllegalState {
                order_id,
                status: order.status,
            });
        }
        self.settle(uow, order, OrderAction::Release, actor, notes, now)
    }

    /// Buyer confirms receipt of a DELIVERED order
    pub fn confirm_receipt<U: UnitOfWork>(
        &self,
        uow: &mut U,
        order_id: Uuid,
        buyer: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let order = order::load(uow, order_id)?;
        if &order.buyer_id != buyer {
            return Err(Error::NotAParty {
                order_id,
                actor: buyer.clone(),
            });
        }
        self.complete_delivered(uow, order_id, buyer, Some("buyer confirmed receipt".to_string()), now)
    }

    /// Cancel a PENDING order and return the held funds to the buyer
    pub fn cancel<U: UnitOfWork>(
        &self,
        uow: &mut U,
        order_id: Uuid,
        actor: &UserId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let order = order::load(uow, order_id)?;
        order::check(&order, OrderAction::Cancel)?;
        if order.escrow_status != EscrowStatus::Held {
            // A PENDING order always carries its hold
            tracing::error!(order_id = %order_id, escrow = ?order.escrow_status, "PENDING order without held escrow");
            return Err(Error::IntegrityViolation(format!(
                "PENDING order {} has escrow {:?}",
                order_id, order.escrow_status
            )));
        }
        self.settle(uow, order, OrderAction::Cancel, actor, reason, now)
    }

    fn settle<U: UnitOfWork>(
        &self,
        uow: &mut U,
        mut order: Order,
        action: OrderAction,
        actor: &UserId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let step = order::check(&order, action)?;
        let via_dispute = order.status == OrderStatus::Disputed;

        let moved = match step.effect {
            EscrowEffect::Release => self.release_funds(uow, &order, now),
            EscrowEffect::Refund => refund_funds(uow, &order, now),
            EscrowEffect::None => Err(Error::Validation(format!(
                "{:?} does not end an escrow",
                action
            ))),
        };
        let transactions = moved.map_err(|err| {
            if err.is_integrity() {
                tracing::error!(
                    order_id = %order.order_id,
                    error = %err,
                    alarm = "integrity",
                    "Escrow funds missing during resolution"
                );
            }
            err
        })?;

        let outcome = match step.effect {
            EscrowEffect::Release => ResolutionOutcome::ReleaseToSeller,
            _ => ResolutionOutcome::RefundToBuyer,
        };

        let from = order.status;
        order.status = step.to;
        order.escrow_status = match outcome {
            ResolutionOutcome::ReleaseToSeller => EscrowStatus::Released,
            ResolutionOutcome::RefundToBuyer => EscrowStatus::Refunded,
        };
        if via_dispute {
            order.dispute_status = DisputeStatus::Resolved;
            order.dispute_resolution = Some(outcome);
        }
        order.resolution_notes = notes;
        order.dispute_resolved_by = Some(actor.clone());
        order.escrow_released_at = Some(now);
        order.updated_at = now;
        uow.put_order(order.clone())?;

        tracing::info!(
            order_id = %order.order_id,
            actor = %actor,
            outcome = %outcome,
            from = ?from,
            to = ?order.status,
            via_dispute,
            "Escrow resolved"
        );

        Ok(Resolution {
            order,
            outcome,
            via_dispute,
            transactions,
        })
    }

    fn release_funds<U: UnitOfWork>(
        &self,
        uow: &mut U,
        order: &Order,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let payout = order
            .total_amount
            .checked_sub(order.service_fee)
            .ok_or_else(|| {
                Error::IntegrityViolation(format!(
                    "Order {} fee {} exceeds total {}",
                    order.order_id, order.service_fee, order.total_amount
                ))
            })?;

        wallet::debit_pending(
            uow,
            &order.buyer_id,
            order.total_amount,
            PendingExit::Released,
            now,
        )?;

        let mut entries = Vec::with_capacity(2);
        entries.push(wallet::credit(
            uow,
            Posting::new(order.seller_id.clone(), TransactionKind::EscrowRelease, payout)
                .for_order(order.order_id)
                .with_fee(order.service_fee),
            now,
        )?);
        if order.service_fee > 0 {
            entries.push(wallet::credit(
                uow,
                Posting::new(
                    self.platform_user.clone(),
                    TransactionKind::Commission,
                    order.service_fee,
                )
                .for_order(order.order_id)
                .with_description(format!("service fee for order {}", order.order_id)),
                now,
            )?);
        }
        Ok(entries)
    }

    fn validate(&self, request: &NewOrder) -> Result<()> {
        if request.total_amount == 0 {
            return Err(Error::Validation("Order total must be positive".to_string()));
        }
        if request.total_amount > self.max_order_amount {
            return Err(Error::Validation(format!(
                "Order total {} exceeds maximum {}",
                request.total_amount, self.max_order_amount
            )));
        }
        if request.service_fee >= request.total_amount {
            return Err(Error::Validation(format!(
                "Service fee {} must be below order total {}",
                request.service_fee, request.total_amount
            )));
        }
        if request.buyer_id.as_str().is_empty() || request.seller_id.as_str().is_empty() {
            return Err(Error::Validation("Buyer and seller are required".to_string()));
        }
        if request.buyer_id == request.seller_id {
            return Err(Error::Validation("Buyer and seller must differ".to_string()));
        }
        if request.seller_id == self.platform_user || request.buyer_id == self.platform_user {
            return Err(Error::Validation(
                "The platform fee account cannot trade".to_string(),
            ));
        }
        Ok(())
    }
}

fn ensure_held(order: &Order) -> Result<()> {
    if order.escrow_status != EscrowStatus::Held {
        tracing::debug!(order_id = %order.order_id, escrow = ?order.escrow_status, "Escrow already resolved");
        return Err(Error::AlreadyResolved(order.order_id));
    }
    Ok(())
}

fn refund_funds<U: UnitOfWork>(
    uow: &mut U,
    order: &Order,
    now: DateTime<Utc>,
) -> Result<Vec<Transaction>> {
    wallet::debit_pending(
        uow,
        &order.buyer_id,
        order.total_amount,
        PendingExit::Refunded,
        now,
    )?;
    let entry = wallet::credit(
        uow,
        Posting::new(order.buyer_id.clone(), TransactionKind::Refund, order.total_amount)
            .for_order(order.order_id),
        now,
    )?;
    Ok(vec![entry])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{tests::test_storage, Storage, StorageTxn};
    use crate::types::Bucket;

    struct Fixture {
        storage: Storage,
        _temp: tempfile::TempDir,
        resolver: EscrowResolver,
        buyer: UserId,
        seller: UserId,
        admin: UserId,
    }

    fn fixture() -> Fixture {
        let (storage, temp) = test_storage();
        Fixture {
            storage,
            _temp: temp,
            resolver: EscrowResolver::new(&EscrowConfig::default()),
            buyer: UserId::new("buyer"),
            seller: UserId::new("seller"),
            admin: UserId::new("admin"),
        }
    }

    impl Fixture {
        fn fund(&self, amount: u64) {
            let mut uow = self.storage.begin().unwrap();
            wallet::credit(
                &mut uow,
                Posting::new(self.buyer.clone(), TransactionKind::Deposit, amount),
                Utc::now(),
            )
            .unwrap();
            uow.commit().unwrap();
        }

        fn place(&self, total: u64, fee: u64) -> Uuid {
            let request = NewOrder {
                order_id: Uuid::now_v7(),
                buyer_id: self.buyer.clone(),
                seller_id: self.seller.clone(),
                total_amount: total,
                service_fee: fee,
            };
            let mut uow = self.storage.begin().unwrap();
            self.resolver.hold(&mut uow, &request, Utc::now()).unwrap();
            uow.commit().unwrap();
            request.order_id
        }

        fn drive(&self, order_id: Uuid, actions: &[OrderAction]) {
            let mut uow = self.storage.begin().unwrap();
            for action in actions {
                if *action == OrderAction::OpenDispute {
                    let mut order = uow.order(order_id).unwrap().unwrap();
                    order.status = order::check(&order, *action).unwrap().to;
                    order.dispute_status = DisputeStatus::Open;
                    uow.put_order(order).unwrap();
                } else {
                    order::advance(&mut uow, order_id, *action, &self.seller, Utc::now()).unwrap();
                }
            }
            uow.commit().unwrap();
        }

        fn begin(&self) -> StorageTxn<'_> {
            self.storage.begin().unwrap()
        }
    }

    /// Unit of work whose commit fails after every write was staged
    struct FailingCommit<'a>(StorageTxn<'a>);

    impl UnitOfWork for FailingCommit<'_> {
        fn wallet(&mut self, user_id: &UserId) -> Result<Option<crate::types::Wallet>> {
            self.0.wallet(user_id)
        }
        fn put_wallet(&mut self, wallet: crate::types::Wallet) {
            self.0.put_wallet(wallet)
        }
        fn order(&mut self, order_id: Uuid) -> Result<Option<Order>> {
            self.0.order(order_id)
        }
        fn put_order(&mut self, order: Order) -> Result<()> {
            self.0.put_order(order)
        }
        fn allocate_sequence(&mut self) -> Result<u64> {
            self.0.allocate_sequence()
        }
        fn append_transaction(&mut self, entry: Transaction) {
            self.0.append_transaction(entry)
        }
        fn commit(self) -> Result<Vec<Transaction>> {
            Err(Error::Storage("disk full".to_string()))
        }
    }

    #[test]
    fn test_hold_creates_pending_order() {
        let f = fixture();
        f.fund(50_000);
        let order_id = f.place(45_000, 2_250);

        let order = f.storage.get_order(order_id).unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.escrow_status, EscrowStatus::Held);

        let wallet = f.storage.get_wallet(&f.buyer).unwrap().unwrap();
        assert_eq!(wallet.balance, 5_000);
        assert_eq!(wallet.pending_balance, 45_000);
    }

    #[test]
    fn test_hold_insufficient_funds_creates_nothing() {
        let f = fixture();
        f.fund(10_000);
        let request = NewOrder {
            order_id: Uuid::now_v7(),
            buyer_id: f.buyer.clone(),
            seller_id: f.seller.clone(),
            total_amount: 15_000,
            service_fee: 750,
        };

        let mut uow = f.begin();
        let result = f.resolver.hold(&mut uow, &request, Utc::now());
        assert!(matches!(
            result,
            Err(Error::InsufficientFunds { bucket: Bucket::Available, required: 15_000, available: 10_000, .. })
        ));
        drop(uow);

        assert_eq!(f.storage.get_order(request.order_id).unwrap(), None);
        let wallet = f.storage.get_wallet(&f.buyer).unwrap().unwrap();
        assert_eq!(wallet.balance, 10_000);
        assert_eq!(wallet.pending_balance, 0);
    }

    #[test]
    fn test_hold_rejects_duplicate_and_bad_input() {
        let f = fixture();
        f.fund(100_000);
        let order_id = f.place(1_000, 50);

        let mut request = NewOrder {
            order_id,
            buyer_id: f.buyer.clone(),
            seller_id: f.seller.clone(),
            total_amount: 1_000,
            service_fee: 50,
        };
        let mut uow = f.begin();
        assert!(matches!(
            f.resolver.hold(&mut uow, &request, Utc::now()),
            Err(Error::DuplicateOrder(_))
        ));

        request.order_id = Uuid::now_v7();
        request.service_fee = 1_000;
        assert!(matches!(
            f.resolver.hold(&mut uow, &request, Utc::now()),
            Err(Error::Validation(_))
        ));

        request.service_fee = 0;
        request.seller_id = f.buyer.clone();
        assert!(matches!(
            f.resolver.hold(&mut uow, &request, Utc::now()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_release_from_dispute() {
        let f = fixture();
        f.fund(45_000);
        let order_id = f.place(45_000, 2_250);
        f.drive(order_id, &[OrderAction::ConfirmPayment, OrderAction::OpenDispute]);

        let mut uow = f.begin();
        let resolution = f
            .resolver
            .resolve(&mut uow, order_id, ResolutionOutcome::ReleaseToSeller, &f.admin, None, Utc::now())
            .unwrap();
        uow.commit().unwrap();

        assert!(resolution.via_dispute);
        assert_eq!(resolution.order.status, OrderStatus::Completed);
        assert_eq!(resolution.order.escrow_status, EscrowStatus::Released);
        assert_eq!(resolution.order.dispute_status, DisputeStatus::Resolved);
        assert_eq!(resolution.order.dispute_resolved_by, Some(f.admin.clone()));
        assert_eq!(resolution.transactions.len(), 2);
        assert_eq!(resolution.transactions[0].kind, TransactionKind::EscrowRelease);
        assert_eq!(resolution.transactions[0].amount, 42_750);
        assert_eq!(resolution.transactions[1].kind, TransactionKind::Commission);
        assert_eq!(resolution.transactions[1].amount, 2_250);

        let seller = f.storage.get_wallet(&f.seller).unwrap().unwrap();
        assert_eq!(seller.balance, 42_750);
        assert_eq!(seller.total_earned, 42_750);
        let buyer = f.storage.get_wallet(&f.buyer).unwrap().unwrap();
        assert_eq!(buyer.pending_balance, 0);
        assert_eq!(buyer.total_spent, 45_000);
        let platform = f.storage.get_wallet(f.resolver.platform_user()).unwrap().unwrap();
        assert_eq!(platform.balance, 2_250);
    }

    #[test]
    fn test_refund_from_dispute_leaves_seller_untouched() {
        let f = fixture();
        f.fund(45_000);
        let order_id = f.place(45_000, 2_250);
        f.drive(order_id, &[OrderAction::ConfirmPayment, OrderAction::Ship, OrderAction::OpenDispute]);

        let mut uow = f.begin();
        let resolution = f
            .resolver
            .resolve(&mut uow, order_id, ResolutionOutcome::RefundToBuyer, &f.admin, None, Utc::now())
            .unwrap();
        uow.commit().unwrap();

        assert_eq!(resolution.order.status, OrderStatus::Refunded);
        assert_eq!(resolution.order.escrow_status, EscrowStatus::Refunded);
        assert_eq!(resolution.transactions.len(), 1);
        assert_eq!(resolution.transactions[0].kind, TransactionKind::Refund);
        assert_eq!(resolution.transactions[0].amount, 45_000);

        let buyer = f.storage.get_wallet(&f.buyer).unwrap().unwrap();
        assert_eq!(buyer.balance, 45_000);
        assert_eq!(buyer.pending_balance, 0);
        assert_eq!(f.storage.get_wallet(&f.seller).unwrap(), None);
    }

    #[test]
    fn test_second_resolve_is_already_resolved() {
        let f = fixture();
        f.fund(45_000);
        let order_id = f.place(45_000, 2_250);
        f.drive(order_id, &[OrderAction::ConfirmPayment, OrderAction::OpenDispute]);

        let mut uow = f.begin();
        f.resolver
            .resolve(&mut uow, order_id, ResolutionOutcome::RefundToBuyer, &f.admin, None, Utc::now())
            .unwrap();
        uow.commit().unwrap();
        let buyer_before = f.storage.get_wallet(&f.buyer).unwrap();

        for outcome in [ResolutionOutcome::RefundToBuyer, ResolutionOutcome::ReleaseToSeller] {
            let mut uow = f.begin();
            let result = f
                .resolver
                .resolve(&mut uow, order_id, outcome, &f.admin, None, Utc::now());
            assert!(matches!(result, Err(Error::AlreadyResolved(id)) if id == order_id));
        }

        assert_eq!(f.storage.get_wallet(&f.buyer).unwrap(), buyer_before);
        assert_eq!(f.storage.get_wallet(&f.seller).unwrap(), None);
    }

    #[test]
    fn test_resolve_requires_resolvable_status() {
        let f = fixture();
        f.fund(10_000);
        let order_id = f.place(10_000, 500);
        f.drive(order_id, &[OrderAction::ConfirmPayment, OrderAction::Ship]);

        let mut uow = f.begin();
        let result = f.resolver.resolve(
            &mut uow,
            order_id,
            ResolutionOutcome::ReleaseToSeller,
            &f.admin,
            None,
            Utc::now(),
        );
        assert!(matches!(
            result,
            Err(Error::IllegalState { status: OrderStatus::Shipped, .. })
        ));
        drop(uow);

        // Undisputed DELIVERED orders can only be released
        f.drive(order_id, &[OrderAction::MarkDelivered]);
        let mut uow = f.begin();
        let result = f.resolver.resolve(
            &mut uow,
            order_id,
            ResolutionOutcome::RefundToBuyer,
            &f.admin,
            None,
            Utc::now(),
        );
        assert!(matches!(
            result,
            Err(Error::IllegalState { status: OrderStatus::Delivered, .. })
        ));
    }

    #[test]
    fn test_resolve_missing_order() {
        let f = fixture();
        let mut uow = f.begin();
        let result = f.resolver.resolve(
            &mut uow,
            Uuid::now_v7(),
            ResolutionOutcome::ReleaseToSeller,
            &f.admin,
            None,
            Utc::now(),
        );
        assert!(matches!(result, Err(Error::OrderNotFound(_))));
    }

    #[test]
    fn test_complete_delivered_refuses_dispute() {
        let f = fixture();
        f.fund(10_000);
        let order_id = f.place(10_000, 500);
        f.drive(
            order_id,
            &[
                OrderAction::ConfirmPayment,
                OrderAction::Ship,
                OrderAction::MarkDelivered,
                OrderAction::OpenDispute,
            ],
        );

        let mut uow = f.begin();
        let result = f
            .resolver
            .complete_delivered(&mut uow, order_id, &UserId::new("system"), None, Utc::now());
        assert!(matches!(
            result,
            Err(Error::IllegalState { status: OrderStatus::Disputed, .. })
        ));
    }

    #[test]
    fn test_confirm_receipt_only_by_buyer() {
        let f = fixture();
        f.fund(10_000);
        let order_id = f.place(10_000, 500);
        f.drive(
            order_id,
            &[OrderAction::ConfirmPayment, OrderAction::StartWork, OrderAction::MarkDelivered],
        );

        let mut uow = f.begin();
        let result = f.resolver.confirm_receipt(&mut uow, order_id, &f.seller, Utc::now());
        assert!(matches!(result, Err(Error::NotAParty { .. })));

        let resolution = f
            .resolver
            .confirm_receipt(&mut uow, order_id, &f.buyer, Utc::now())
            .unwrap();
        uow.commit().unwrap();
        assert_eq!(resolution.order.status, OrderStatus::Completed);
        assert!(!resolution.via_dispute);
        assert_eq!(resolution.order.dispute_status, DisputeStatus::None);
        assert_eq!(f.storage.get_wallet(&f.seller).unwrap().unwrap().balance, 9_500);
    }

    #[test]
    fn test_cancel_pending_refunds() {
        let f = fixture();
        f.fund(10_000);
        let order_id = f.place(4_000, 200);

        let mut uow = f.begin();
        let resolution = f
            .resolver
            .cancel(&mut uow, order_id, &f.buyer, Some("changed my mind".to_string()), Utc::now())
            .unwrap();
        uow.commit().unwrap();

        assert_eq!(resolution.order.status, OrderStatus::Cancelled);
        assert_eq!(resolution.order.escrow_status, EscrowStatus::Refunded);
        let buyer = f.storage.get_wallet(&f.buyer).unwrap().unwrap();
        assert_eq!(buyer.balance, 10_000);
        assert_eq!(buyer.pending_balance, 0);

        let mut uow = f.begin();
        let result = f.resolver.cancel(&mut uow, order_id, &f.buyer, None, Utc::now());
        assert!(matches!(result, Err(Error::IllegalTransition { from: OrderStatus::Cancelled, .. })));
    }

    #[test]
    fn test_pending_shortfall_aborts_whole_resolution() {
        let f = fixture();
        f.fund(10_000);
        let order_id = f.place(10_000, 500);
        f.drive(order_id, &[OrderAction::ConfirmPayment, OrderAction::OpenDispute]);

        // Simulate upstream corruption of the buyer's pending balance
        let mut buyer = f.storage.get_wallet(&f.buyer).unwrap().unwrap();
        buyer.pending_balance = 1_000;
        f.storage.overwrite_wallet_for_test(&buyer).unwrap();
        let order_before = f.storage.get_order(order_id).unwrap();

        let mut uow = f.begin();
        let result = f.resolver.resolve(
            &mut uow,
            order_id,
            ResolutionOutcome::ReleaseToSeller,
            &f.admin,
            None,
            Utc::now(),
        );
        let err = result.unwrap_err();
        assert!(err.is_integrity());
        drop(uow);

        assert_eq!(f.storage.get_order(order_id).unwrap(), order_before);
        assert_eq!(f.storage.get_wallet(&f.seller).unwrap(), None);
        assert_eq!(f.storage.get_wallet(&f.buyer).unwrap(), Some(buyer));
    }

    #[test]
    fn test_failed_commit_leaves_nothing_visible() {
        let f = fixture();
        f.fund(45_000);
        let order_id = f.place(45_000, 2_250);
        f.drive(order_id, &[OrderAction::ConfirmPayment, OrderAction::OpenDispute]);
        let buyer_before = f.storage.get_wallet(&f.buyer).unwrap();
        let order_before = f.storage.get_order(order_id).unwrap();
        let entries_before = f.storage.all_transactions().unwrap().len();

        let mut uow = FailingCommit(f.begin());
        let resolution = f
            .resolver
            .resolve(&mut uow, order_id, ResolutionOutcome::ReleaseToSeller, &f.admin, None, Utc::now())
            .unwrap();
        assert_eq!(resolution.transactions.len(), 2);
        assert!(matches!(uow.commit(), Err(Error::Storage(_))));

        assert_eq!(f.storage.get_wallet(&f.buyer).unwrap(), buyer_before);
        assert_eq!(f.storage.get_order(order_id).unwrap(), order_before);
        assert_eq!(f.storage.get_wallet(&f.seller).unwrap(), None);
        assert_eq!(f.storage.all_transactions().unwrap().len(), entries_before);
    }
}
