//! Timeout sweeper
//!
//! Periodically releases DELIVERED orders the buyer never confirmed and
//! cancels PENDING orders whose payment never arrived. Each action goes
//! through the actor like any other request, so a sweep racing a dispute or
//! a buyer confirmation simply loses with a state error.

use crate::{
    config::SweeperConfig,
    types::{OrderStatus, UserId},
    Error, Ledger, Result,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Actor recorded for sweeper actions
pub const SWEEPER_ACTOR: &str = "system:sweeper";

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// DELIVERED orders released to the seller
    pub completed: usize,
    /// PENDING orders cancelled and refunded
    pub cancelled: usize,
    /// Orders that changed state before the sweeper reached them
    pub skipped: usize,
    /// Orders the sweeper failed to act on
    pub failed: usize,
}

/// Background timeout sweeper
#[derive(Debug, Clone)]
pub struct Sweeper {
    ledger: Ledger,
    config: SweeperConfig,
    actor: UserId,
}

impl Sweeper {
    /// Create a sweeper over `ledger`
    pub fn new(ledger: Ledger, config: SweeperConfig) -> Self {
        Self {
            ledger,
            config,
            actor: UserId::new(SWEEPER_ACTOR),
        }
    }

    /// Run one sweep as of `now`
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let delivered_cutoff = cutoff(now, self.config.delivered_timeout()?)?;
        for order in self.ledger.orders_with_status(OrderStatus::Delivered)? {
            let delivered_at = order.delivered_at.unwrap_or(order.updated_at);
            if delivered_at > delivered_cutoff {
                continue;
            }
            let result = self
                .ledger
                .complete_delivered(
                    order.order_id,
                    self.actor.clone(),
                    Some("auto-completed after delivery timeout".to_string()),
                )
                .await;
            tally(&mut report, result.map(|_| ()), |r| r.completed += 1)?;
        }

        let pending_cutoff = cutoff(now, self.config.pending_timeout()?)?;
        for order in self.ledger.orders_with_status(OrderStatus::Pending)? {
            if order.created_at > pending_cutoff {
                continue;
            }
            let result = self
                .ledger
                .cancel(
                    order.order_id,
                    self.actor.clone(),
                    Some("payment not confirmed in time".to_string()),
                )
                .await;
            tally(&mut report, result.map(|_| ()), |r| r.cancelled += 1)?;
        }

        if report != SweepReport::default() {
            tracing::info!(
                completed = report.completed,
                cancelled = report.cancelled,
                skipped = report.skipped,
                failed = report.failed,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval_secs` until the ledger shuts down
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match self.sweep_once(Utc::now()).await {
                    Ok(_) => {}
                    Err(Error::Concurrency(_)) => {
                        tracing::info!("Ledger closed; sweeper stopping");
                        break;
                    }
                    Err(e) => tracing::error!(error = %e, "Sweep failed"),
                }
            }
        })
    }
}

fn cutoff(now: DateTime<Utc>, timeout: ChronoDuration) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(timeout)
        .ok_or_else(|| Error::Config(format!("Sweeper timeout {} reaches before {}", timeout, now)))
}

fn tally(
    report: &mut SweepReport,
    result: Result<()>,
    on_success: impl FnOnce(&mut SweepReport),
) -> Result<()> {
    match result {
        Ok(()) => on_success(report),
        Err(Error::Concurrency(msg)) => return Err(Error::Concurrency(msg)),
        Err(Error::AlreadyResolved(_))
        | Err(Error::IllegalState { .. })
        | Err(Error::IllegalTransition { .. }) => report.skipped += 1,
        Err(e) => {
            tracing::warn!(error = %e, "Sweeper action failed");
            report.failed += 1;
        }
    }
    Ok(())
}
