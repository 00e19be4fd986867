//! Main ledger orchestration layer
//!
//! Ties storage, the single-writer actor and the notification dispatcher into
//! one cloneable API. Mutations go through the actor; reads go straight to
//! storage.
//!
//! # Example
//!
//! ```no_run
//! use escrow_ledger::{Config, Ledger, ResolutionOutcome, UserId};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> escrow_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let buyer = UserId::new("buyer");
//!     ledger.deposit(buyer.clone(), 50_000, None).await?;
//!
//!     let order_id = Uuid::now_v7();
//!     ledger.place_order(order_id, buyer.clone(), UserId::new("seller"), 45_000).await?;
//!     ledger.confirm_payment(order_id, buyer.clone()).await?;
//!     ledger.open_dispute(order_id, buyer, "not as described").await?;
//!     ledger
//!         .resolve_dispute(order_id, ResolutionOutcome::RefundToBuyer, UserId::new("admin"), None)
//!         .await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle, ResolvePath},
    escrow::{EscrowResolver, Resolution},
    journal::{self, ReconciliationReport},
    metrics::Metrics,
    notify::{spawn_dispatcher, NotificationEmitter, TracingEmitter},
    storage::StorageStats,
    types::{
        NewOrder, Order, OrderAction, OrderStatus, ResolutionOutcome, Transaction,
        TransactionKind, UserId, Wallet,
    },
    Config, Error, Result, Storage,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Main ledger interface
#[derive(Clone, Debug)]
pub struct Ledger {
    /// Actor handle for mutations
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Configuration
    config: Arc<Config>,

    metrics: Metrics,

    /// Actor and dispatcher tasks, taken on shutdown
    tasks: Arc<Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>>,
}

impl Ledger {
    /// Open ledger with configuration, logging notifications
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with_emitter(config, Arc::new(TracingEmitter)).await
    }

    /// Open ledger delivering notifications to `emitter`
    pub async fn open_with_emitter(
        config: Config,
        emitter: Arc<dyn NotificationEmitter>,
    ) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("Metrics registry: {}", e)))?;

        let (outbox, dispatcher) = spawn_dispatcher(emitter, metrics.clone());
        let (handle, actor) = spawn_ledger_actor(
            storage.clone(),
            EscrowResolver::new(&config.escrow),
            outbox,
            metrics.clone(),
            config.mailbox_capacity,
        );

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = %config.data_dir.display(),
            "Escrow ledger opened"
        );

        Ok(Self {
            handle,
            storage,
            config: Arc::new(config),
            metrics,
            tasks: Arc::new(Mutex::new(Some((actor, dispatcher)))),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Credit external funds to a wallet
    pub async fn deposit(
        &self,
        user_id: UserId,
        amount: u64,
        reference: Option<String>,
    ) -> Result<Transaction> {
        self.handle.deposit(user_id, amount, reference).await
    }

    /// Pay funds out of a wallet
    pub async fn withdraw(
        &self,
        user_id: UserId,
        amount: u64,
        reference: Option<String>,
    ) -> Result<Transaction> {
        self.handle.withdraw(user_id, amount, reference).await
    }

    /// Create an order with an explicit fee and hold its total
    pub async fn hold(&self, request: NewOrder) -> Result<(Order, Transaction)> {
        self.handle.hold(request).await
    }

    /// Create an order charged the configured service fee
    pub async fn place_order(
        &self,
        order_id: Uuid,
        buyer_id: UserId,
        seller_id: UserId,
        total_amount: u64,
    ) -> Result<(Order, Transaction)> {
        let service_fee = self.config.escrow.service_fee_for(total_amount);
        self.hold(NewOrder {
            order_id,
            buyer_id,
            seller_id,
            total_amount,
            service_fee,
        })
        .await
    }

    /// PENDING → PAID
    pub async fn confirm_payment(&self, order_id: Uuid, actor: UserId) -> Result<Order> {
        self.handle
            .advance(order_id, OrderAction::ConfirmPayment, actor)
            .await
    }

    /// PAID → IN_PROGRESS
    pub async fn start_work(&self, order_id: Uuid, actor: UserId) -> Result<Order> {
        self.handle
            .advance(order_id, OrderAction::StartWork, actor)
            .await
    }

    /// PAID → SHIPPED
    pub async fn ship(&self, order_id: Uuid, actor: UserId) -> Result<Order> {
        self.handle.advance(order_id, OrderAction::Ship, actor).await
    }

    /// IN_PROGRESS / SHIPPED → DELIVERED
    pub async fn mark_delivered(&self, order_id: Uuid, actor: UserId) -> Result<Order> {
        self.handle
            .advance(order_id, OrderAction::MarkDelivered, actor)
            .await
    }

    /// Buyer confirms a DELIVERED order, releasing escrow to the seller
    pub async fn confirm_receipt(&self, order_id: Uuid, buyer: UserId) -> Result<Resolution> {
        self.handle
            .resolve(
                order_id,
                ResolutionOutcome::ReleaseToSeller,
                buyer,
                None,
                ResolvePath::BuyerConfirmation,
            )
            .await
    }

    /// Cancel a PENDING order and refund the hold
    pub async fn cancel(
        &self,
        order_id: Uuid,
        actor: UserId,
        reason: Option<String>,
    ) -> Result<Resolution> {
        self.handle.cancel(order_id, actor, reason).await
    }

    /// Open a dispute as the buyer or seller
    pub async fn open_dispute(
        &self,
        order_id: Uuid,
        opened_by: UserId,
        reason: impl Into<String>,
    ) -> Result<Order> {
        self.handle
            .open_dispute(order_id, reason.into(), opened_by)
            .await
    }

    /// Release or refund the escrow of a DELIVERED or DISPUTED order
    ///
    /// Safe to retry: a second call fails with [`Error::AlreadyResolved`]
    /// and changes nothing.
    pub async fn resolve(
        &self,
        order_id: Uuid,
        outcome: ResolutionOutcome,
        actor: UserId,
        notes: Option<String>,
    ) -> Result<Resolution> {
        self.handle
            .resolve(order_id, outcome, actor, notes, ResolvePath::Direct)
            .await
    }

    /// Resolve an open dispute
    pub async fn resolve_dispute(
        &self,
        order_id: Uuid,
        outcome: ResolutionOutcome,
        admin: UserId,
        notes: Option<String>,
    ) -> Result<Resolution> {
        self.handle
            .resolve(order_id, outcome, admin, notes, ResolvePath::Dispute)
            .await
    }

    /// Release a DELIVERED order; refuses anything else, including DISPUTED
    pub async fn complete_delivered(
        &self,
        order_id: Uuid,
        actor: UserId,
        notes: Option<String>,
    ) -> Result<Resolution> {
        self.handle
            .resolve(
                order_id,
                ResolutionOutcome::ReleaseToSeller,
                actor,
                notes,
                ResolvePath::DeliveredOnly,
            )
            .await
    }

    /// Get a wallet
    pub fn wallet(&self, user_id: &UserId) -> Result<Wallet> {
        self.storage
            .get_wallet(user_id)?
            .ok_or_else(|| Error::WalletNotFound(user_id.clone()))
    }

    /// Get an order
    pub fn order(&self, order_id: Uuid) -> Result<Order> {
        self.storage
            .get_order(order_id)?
            .ok_or(Error::OrderNotFound(order_id))
    }

    /// Ledger entries of a wallet in insertion order
    pub fn wallet_transactions(&self, user_id: &UserId) -> Result<Vec<Transaction>> {
        let wallet = self.wallet(user_id)?;
        self.storage.wallet_transactions(wallet.wallet_id)
    }

    /// Ledger entries referencing an order in insertion order
    pub fn order_transactions(&self, order_id: Uuid) -> Result<Vec<Transaction>> {
        self.storage.order_transactions(order_id)
    }

    /// Orders currently in `status`
    pub fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        self.storage.orders_by_status(status)
    }

    /// Available balance of a wallet as of `at`, from the journal
    pub fn balance_as_of(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<u64> {
        let wallet = self.wallet(user_id)?;
        journal::balance_as_of(&self.storage, wallet.wallet_id, at)
    }

    /// Reconcile one wallet against its journal and HELD orders
    pub fn reconcile_wallet(&self, user_id: &UserId) -> Result<ReconciliationReport> {
        self.alarm_on_integrity(journal::reconcile_wallet(&self.storage, user_id))
    }

    /// Reconcile every wallet
    pub fn reconcile_all(&self) -> Result<Vec<ReconciliationReport>> {
        let reports = self.alarm_on_integrity(journal::reconcile_all(&self.storage))?;
        tracing::info!(wallets = reports.len(), "Reconciliation passed");
        Ok(reports)
    }

    /// Check money conservation across all wallets
    ///
    /// Every unit inside the system entered through a deposit, so the sum of
    /// available and pending balances must equal deposits minus withdrawals.
    pub fn check_money_conservation(&self) -> Result<bool> {
        let writers = self.storage.pause_writers();
        let mut external: i128 = 0;
        for entry in self.storage.all_transactions()? {
            match entry.kind {
                TransactionKind::Deposit => external += entry.amount as i128,
                TransactionKind::Withdrawal => external -= entry.amount as i128,
                _ => {}
            }
        }

        let held: i128 = self
            .storage
            .list_wallets()?
            .iter()
            .map(|w| w.balance as i128 + w.pending_balance as i128)
            .sum();
        drop(writers);

        if held != external {
            self.metrics.integrity_alarms_total.inc();
            tracing::error!(
                held = %held,
                external = %external,
                alarm = "integrity",
                "Money conservation violated"
            );
        }
        Ok(held == external)
    }

    /// Get storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Stop the actor, then let the dispatcher drain queued notifications
    pub async fn shutdown(&self) -> Result<()> {
        let tasks = self.tasks.lock().take();
        let Some((actor, dispatcher)) = tasks else {
            return Ok(());
        };

        self.handle.shutdown().await?;
        actor
            .await
            .map_err(|e| Error::Concurrency(format!("Ledger actor panicked: {}", e)))?;
        // The dispatcher ends once the actor drops the outbox sender
        dispatcher
            .await
            .map_err(|e| Error::Concurrency(format!("Notification dispatcher panicked: {}", e)))?;

        tracing::info!("Escrow ledger shut down");
        Ok(())
    }

    fn alarm_on_integrity<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_integrity() {
                self.metrics.integrity_alarms_total.inc();
                tracing::error!(error = %e, alarm = "integrity", "Reconciliation failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelEmitter, NotificationKind};
    use crate::types::{DisputeStatus, EscrowStatus};

    async fn create_test_ledger() -> (Ledger, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        (Ledger::open(config).await.unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn test_ledger_open() {
        let (ledger, _temp) = create_test_ledger().await;
        ledger.shutdown().await.unwrap();
        // Idempotent
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let (ledger, _temp) = create_test_ledger().await;
        let alice = UserId::new("alice");

        ledger.deposit(alice.clone(), 1_000, Some("card".to_string())).await.unwrap();
        ledger.withdraw(alice.clone(), 300, None).await.unwrap();

        assert_eq!(ledger.wallet(&alice).unwrap().balance, 700);
        assert_eq!(ledger.wallet_transactions(&alice).unwrap().len(), 2);
        assert!(matches!(
            ledger.withdraw(alice.clone(), 701, None).await,
            Err(Error::InsufficientFunds { .. })
        ));
        assert!(ledger.check_money_conservation().unwrap());
    }

    #[tokio::test]
    async fn test_place_order_charges_configured_fee() {
        let (ledger, _temp) = create_test_ledger().await;
        let buyer = UserId::new("buyer");
        let seller = UserId::new("seller");
        ledger.deposit(buyer.clone(), 45_000, None).await.unwrap();

        let order_id = Uuid::now_v7();
        let (order, _) = ledger
            .place_order(order_id, buyer.clone(), seller.clone(), 45_000)
            .await
            .unwrap();
        assert_eq!(order.service_fee, 2_250);

        ledger.confirm_payment(order_id, buyer.clone()).await.unwrap();
        ledger.ship(order_id, seller.clone()).await.unwrap();
        ledger.mark_delivered(order_id, seller.clone()).await.unwrap();
        let resolution = ledger.confirm_receipt(order_id, buyer.clone()).await.unwrap();

        assert_eq!(resolution.order.status, OrderStatus::Completed);
        assert_eq!(ledger.wallet(&seller).unwrap().balance, 42_750);
        assert_eq!(
            ledger.wallet(&UserId::new("platform")).unwrap().balance,
            2_250
        );
        assert_eq!(ledger.order_transactions(order_id).unwrap().len(), 3);
        assert_eq!(ledger.reconcile_all().unwrap().len(), 3);
        assert!(ledger.check_money_conservation().unwrap());
    }

    #[tokio::test]
    async fn test_dispute_blocks_fulfillment() {
        let (ledger, _temp) = create_test_ledger().await;
        let buyer = UserId::new("buyer");
        let seller = UserId::new("seller");
        ledger.deposit(buyer.clone(), 10_000, None).await.unwrap();

        let order_id = Uuid::now_v7();
        ledger
            .place_order(order_id, buyer.clone(), seller.clone(), 10_000)
            .await
            .unwrap();
        ledger.confirm_payment(order_id, buyer.clone()).await.unwrap();
        ledger.open_dispute(order_id, seller.clone(), "buyer unreachable").await.unwrap();

        assert!(matches!(
            ledger.ship(order_id, seller.clone()).await,
            Err(Error::IllegalTransition { from: OrderStatus::Disputed, .. })
        ));
        assert!(matches!(
            ledger.cancel(order_id, buyer.clone(), None).await,
            Err(Error::IllegalTransition { .. })
        ));

        let resolution = ledger
            .resolve_dispute(order_id, ResolutionOutcome::ReleaseToSeller, UserId::new("admin"), None)
            .await
            .unwrap();
        assert_eq!(resolution.order.dispute_status, DisputeStatus::Resolved);
        assert_eq!(ledger.orders_with_status(OrderStatus::Completed).unwrap().len(), 1);
        assert!(ledger.orders_with_status(OrderStatus::Disputed).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notifications_follow_commits() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let (emitter, mut received) = ChannelEmitter::new();
        let ledger = Ledger::open_with_emitter(config, Arc::new(emitter)).await.unwrap();

        let buyer = UserId::new("buyer");
        ledger.deposit(buyer.clone(), 5_000, None).await.unwrap();
        let order_id = Uuid::now_v7();
        ledger
            .place_order(order_id, buyer.clone(), UserId::new("seller"), 5_000)
            .await
            .unwrap();
        let cancelled = ledger.cancel(order_id, buyer.clone(), None).await.unwrap();
        assert_eq!(cancelled.order.escrow_status, EscrowStatus::Refunded);
        ledger.shutdown().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(notification) = received.try_recv() {
            kinds.push(notification.kind);
        }
        assert_eq!(
            kinds,
            vec![
                NotificationKind::OrderPlaced { total_amount: 5_000 },
                NotificationKind::OrderCancelled,
            ]
        );
    }

    #[tokio::test]
    async fn test_reconcile_detects_tampering() {
        let (ledger, _temp) = create_test_ledger().await;
        let alice = UserId::new("alice");
        ledger.deposit(alice.clone(), 100, None).await.unwrap();

        let mut wallet = ledger.wallet(&alice).unwrap();
        wallet.balance = 1_000;
        ledger.storage.overwrite_wallet_for_test(&wallet).unwrap();

        assert!(matches!(
            ledger.reconcile_wallet(&alice),
            Err(Error::IntegrityViolation(_))
        ));
        assert_eq!(ledger.metrics().integrity_alarms_total.get(), 1);
        assert!(!ledger.check_money_conservation().unwrap());
    }
}
