//! Notifications emitted after a committed state change
//!
//! The actor pushes a [`Notification`] onto an outbox only once the unit of
//! work has committed. A dispatcher task drains the outbox into a
//! [`NotificationEmitter`]; delivery failures are logged and counted but
//! never undo the committed change.

use crate::{
    metrics::Metrics,
    types::{OrderStatus, ResolutionOutcome, UserId},
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What happened to an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    /// Order created and escrow held
    OrderPlaced {
        /// Held amount
        total_amount: u64,
    },
    /// Fulfillment status moved
    StatusChanged {
        /// New fulfillment status
        status: OrderStatus,
    },
    /// Buyer or seller opened a dispute
    DisputeOpened {
        /// Stated reason
        reason: String,
    },
    /// Escrow released or refunded
    EscrowResolved {
        /// Direction of the money
        outcome: ResolutionOutcome,
    },
    /// PENDING order cancelled and refunded
    OrderCancelled,
}

/// Event for both parties of an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification ID
    pub notification_id: Uuid,
    /// Order concerned
    pub order_id: Uuid,
    /// Buyer to notify
    pub buyer_id: UserId,
    /// Seller to notify
    pub seller_id: UserId,
    /// Event
    pub kind: NotificationKind,
    /// Who caused it
    pub actor: UserId,
    /// When it was committed
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    /// New notification for an order's parties
    pub fn new(
        order: &crate::types::Order,
        kind: NotificationKind,
        actor: &UserId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: Uuid::now_v7(),
            order_id: order.order_id,
            buyer_id: order.buyer_id.clone(),
            seller_id: order.seller_id.clone(),
            kind,
            actor: actor.clone(),
            occurred_at,
        }
    }
}

/// Delivers notifications to users
#[async_trait]
pub trait NotificationEmitter: Send + Sync {
    /// Deliver one notification
    async fn emit(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

#[async_trait]
impl NotificationEmitter for TracingEmitter {
    async fn emit(&self, notification: &Notification) -> Result<()> {
        let payload = serde_json::to_string(notification)
            .map_err(|e| Error::Notification(e.to_string()))?;
        tracing::info!(
            target: "escrow_ledger::notifications",
            order_id = %notification.order_id,
            payload = %payload,
            "Notification"
        );
        Ok(())
    }
}

/// Forwards notifications to a channel, for embedding and tests
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelEmitter {
    /// Create an emitter and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationEmitter for ChannelEmitter {
    async fn emit(&self, notification: &Notification) -> Result<()> {
        self.sender
            .send(notification.clone())
            .map_err(|_| Error::Notification("Notification receiver dropped".to_string()))
    }
}

/// Spawn the task draining the outbox into `emitter`
///
/// The task ends once every outbox sender is dropped.
pub fn spawn_dispatcher(
    emitter: Arc<dyn NotificationEmitter>,
    metrics: Metrics,
) -> (mpsc::UnboundedSender<Notification>, JoinHandle<()>) {
    let (outbox, mut pending) = mpsc::unbounded_channel::<Notification>();

    let task = tokio::spawn(async move {
        while let Some(notification) = pending.recv().await {
            if let Err(e) = emitter.emit(&notification).await {
                metrics.notification_failures_total.inc();
                tracing::warn!(
                    order_id = %notification.order_id,
                    notification_id = %notification.notification_id,
                    error = %e,
                    "Notification delivery failed"
                );
            }
        }
        tracing::debug!("Notification dispatcher stopped");
    });

    (outbox, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::new_order;
    use crate::types::NewOrder;

    struct FailingEmitter;

    #[async_trait]
    impl NotificationEmitter for FailingEmitter {
        async fn emit(&self, _notification: &Notification) -> Result<()> {
            Err(Error::Notification("offline".to_string()))
        }
    }

    fn sample() -> Notification {
        let order = new_order(
            &NewOrder {
                order_id: Uuid::now_v7(),
                buyer_id: UserId::new("buyer"),
                seller_id: UserId::new("seller"),
                total_amount: 100,
                service_fee: 5,
            },
            Utc::now(),
        );
        Notification::new(
            &order,
            NotificationKind::EscrowResolved {
                outcome: ResolutionOutcome::ReleaseToSeller,
            },
            &UserId::new("admin"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_dispatcher_forwards() {
        let (emitter, mut received) = ChannelEmitter::new();
        let (outbox, task) = spawn_dispatcher(Arc::new(emitter), Metrics::new().unwrap());

        let notification = sample();
        outbox.send(notification.clone()).unwrap();
        assert_eq!(received.recv().await, Some(notification));

        drop(outbox);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_counts_failures() {
        let metrics = Metrics::new().unwrap();
        let (outbox, task) = spawn_dispatcher(Arc::new(FailingEmitter), metrics.clone());

        outbox.send(sample()).unwrap();
        outbox.send(sample()).unwrap();
        drop(outbox);
        task.await.unwrap();

        assert_eq!(metrics.notification_failures_total.get(), 2);
    }

    #[tokio::test]
    async fn test_tracing_emitter() {
        TracingEmitter.emit(&sample()).await.unwrap();
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["kind"]["type"], "escrow_resolved");
        assert_eq!(json["buyer_id"], "buyer");
    }

    #[test]
    fn test_status_change_carries_typed_status() {
        let mut notification = sample();
        notification.kind = NotificationKind::StatusChanged {
            status: OrderStatus::InProgress,
        };

        let json = serde_json::to_string(&notification).unwrap();
        let decoded: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(
            decoded.kind,
            NotificationKind::StatusChanged {
                status: OrderStatus::InProgress
            }
        );
        assert_eq!(
            serde_json::to_value(&notification).unwrap()["kind"]["status"],
            "InProgress"
        );
    }
}
