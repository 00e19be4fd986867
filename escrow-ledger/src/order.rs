//! Order state machine
//!
//! [`step`] is the single source of truth for legal transitions:
//!
//! | From | Action | To | Escrow effect |
//! |---|---|---|---|
//! | PENDING | ConfirmPayment | PAID | none |
//! | PAID | StartWork | IN_PROGRESS | none |
//! | PAID | Ship | SHIPPED | none |
//! | IN_PROGRESS, SHIPPED | MarkDelivered | DELIVERED | none |
//! | DELIVERED | Release | COMPLETED | release |
//! | PAID, IN_PROGRESS, SHIPPED, DELIVERED | OpenDispute | DISPUTED | none |
//! | DISPUTED | Release | COMPLETED | release |
//! | DISPUTED | Refund | REFUNDED | refund |
//! | PENDING | Cancel | CANCELLED | refund |
//!
//! Anything else is [`Error::IllegalTransition`].

use crate::{
    storage::UnitOfWork,
    types::{DisputeStatus, EscrowStatus, NewOrder, Order, OrderAction, OrderStatus, UserId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Escrow movement a transition requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowEffect {
    /// No money moves
    None,
    /// Pay the seller
    Release,
    /// Return funds to the buyer
    Refund,
}

/// A legal transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Status after the transition
    pub to: OrderStatus,
    /// Money movement it requires
    pub effect: EscrowEffect,
}

/// Look up a transition in the state table
pub fn step(from: OrderStatus, action: OrderAction) -> Option<Step> {
    use OrderAction as A;
    use OrderStatus as S;

    let (to, effect) = match (from, action) {
        (S::Pending, A::ConfirmPayment) => (S::Paid, EscrowEffect::None),
        (S::Paid, A::StartWork) => (S::InProgress, EscrowEffect::None),
        (S::Paid, A::Ship) => (S::Shipped, EscrowEffect::None),
        (S::InProgress | S::Shipped, A::MarkDelivered) => (S::Delivered, EscrowEffect::None),
        (S::Delivered, A::Release) => (S::Completed, EscrowEffect::Release),
        (S::Paid | S::InProgress | S::Shipped | S::Delivered, A::OpenDispute) => {
            (S::Disputed, EscrowEffect::None)
        }
        (S::Disputed, A::Release) => (S::Completed, EscrowEffect::Release),
        (S::Disputed, A::Refund) => (S::Refunded, EscrowEffect::Refund),
        (S::Pending, A::Cancel) => (S::Cancelled, EscrowEffect::Refund),
        _ => return None,
    };
    Some(Step { to, effect })
}

/// Check an action against an order's current status
pub fn check(order: &Order, action: OrderAction) -> Result<Step> {
    step(order.status, action).ok_or(Error::IllegalTransition {
        order_id: order.order_id,
        from: order.status,
        action,
    })
}

/// Build the PENDING order created alongside an escrow hold
pub fn new_order(request: &NewOrder, now: DateTime<Utc>) -> Order {
    Order {
        order_id: request.order_id,
        buyer_id: request.buyer_id.clone(),
        seller_id: request.seller_id.clone(),
        total_amount: request.total_amount,
        service_fee: request.service_fee,
        status: OrderStatus::Pending,
        escrow_status: EscrowStatus::Held,
        dispute_status: DisputeStatus::None,
        dispute_reason: None,
        dispute_opened_by: None,
        dispute_resolution: None,
        resolution_notes: None,
        dispute_resolved_by: None,
        escrow_released_at: None,
        delivered_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Load an order inside a unit of work
pub fn load<U: UnitOfWork>(uow: &mut U, order_id: Uuid) -> Result<Order> {
    uow.order(order_id)?.ok_or(Error::OrderNotFound(order_id))
}

/// Apply a fulfillment action (one with no escrow effect)
///
/// Disputes go through the dispute coordinator and money-moving actions
/// through the escrow resolver; both are rejected here.
pub fn advance<U: UnitOfWork>(
    uow: &mut U,
    order_id: Uuid,
    action: OrderAction,
    actor: &UserId,
    now: DateTime<Utc>,
) -> Result<Order> {
    if !is_fulfillment(action) {
        return Err(Error::Validation(format!(
            "{:?} is not a fulfillment action",
            action
        )));
    }

    let mut order = load(uow, order_id)?;
    let step = check(&order, action)?;

    let from = order.status;
    order.status = step.to;
    order.updated_at = now;
    if step.to == OrderStatus::Delivered {
        order.delivered_at = Some(now);
    }
    uow.put_order(order.clone())?;

    tracing::info!(
        order_id = %order_id,
        actor = %actor,
        from = ?from,
        to = ?order.status,
        "Order advanced"
    );

    Ok(order)
}

fn is_fulfillment(action: OrderAction) -> bool {
    matches!(
        action,
        OrderAction::ConfirmPayment
            | OrderAction::StartWork
            | OrderAction::Ship
            | OrderAction::MarkDelivered
    )
}
