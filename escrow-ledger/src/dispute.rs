//! Dispute coordinator
//!
//! Opening a dispute freezes the order in DISPUTED; only an administrative
//! resolution moves it on, through the escrow resolver.

use crate::{
    escrow::{EscrowResolver, Resolution},
    order,
    storage::UnitOfWork,
    types::{DisputeStatus, Order, OrderAction, ResolutionOutcome, UserId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Open a dispute on behalf of the buyer or the seller
pub fn open<U: UnitOfWork>(
    uow: &mut U,
    order_id: Uuid,
    reason: &str,
    opened_by: &UserId,
    now: DateTime<Utc>,
) -> Result<Order> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(Error::Validation("Dispute reason is required".to_string()));
    }

    let mut order = order::load(uow, order_id)?;
    if &order.buyer_id != opened_by && &order.seller_id != opened_by {
        return Err(Error::NotAParty {
            order_id,
            actor: opened_by.clone(),
        });
    }
    let step = order::check(&order, OrderAction::OpenDispute)?;

    let from = order.status;
    order.status = step.to;
    order.dispute_status = DisputeStatus::Open;
    order.dispute_reason = Some(reason.to_string());
    order.dispute_opened_by = Some(opened_by.clone());
    order.updated_at = now;
    uow.put_order(order.clone())?;

    tracing::info!(
        order_id = %order_id,
        opened_by = %opened_by,
        from = ?from,
        "Dispute opened"
    );

    Ok(order)
}

/// Resolve an open dispute with an administrative decision
pub fn resolve<U: UnitOfWork>(
    uow: &mut U,
    resolver: &EscrowResolver,
    order_id: Uuid,
    outcome: ResolutionOutcome,
    admin: &UserId,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> Result<Resolution> {
    let order = order::load(uow, order_id)?;
    match order.dispute_status {
        DisputeStatus::Open => {}
        DisputeStatus::Resolved => return Err(Error::AlreadyResolved(order_id)),
        DisputeStatus::None => {
            return Err(Error::IllegalState {
                order_id,
                status: order.status,
            })
        }
    }

    resolver.resolve(uow, order_id, outcome, admin, notes, now)
}
