//! Periodic drain of the offline queue.
//!
//! The task is owned by the caller through a [`DrainHandle`]; there is no
//! global timer. Dropping the handle also stops the task, without waiting
//! for it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::service::ComplianceService;

pub struct DrainScheduler;

impl DrainScheduler {
    /// Starts a task that drains the queue every `interval`, reports overdue
    /// entries and prunes completed ones.
    pub fn spawn(service: Arc<ComplianceService>, interval: Duration) -> DrainHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Drain scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => run_once(&service).await,
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Drain scheduler stopped");
        });

        DrainHandle { cancel_tx, task }
    }
}

async fn run_once(service: &ComplianceService) {
    match service.drain_queue().await {
        Ok(report) if report.skipped => debug!("Previous drain still running, tick skipped"),
        Ok(report) => {
            if report.attempted > 0 {
                info!(
                    attempted = report.attempted,
                    completed = report.completed.len(),
                    retry_scheduled = report.retry_scheduled.len(),
                    failed = report.failed.len(),
                    "Queue drain finished"
                );
            }
        }
        Err(e) => error!(error = %e, "Queue drain failed"),
    }

    match service.query_overdue().await {
        Ok(overdue) => {
            metrics::QUEUE_OVERDUE.set(overdue.len() as i64);
            for entry in &overdue {
                warn!(
                    entry_id = %entry.id,
                    uuid = %entry.invoice.uuid(),
                    enqueued_at = %entry.enqueued_at,
                    attempts = entry.attempts,
                    "Invoice past its submission deadline"
                );
            }
        }
        Err(e) => error!(error = %e, "Overdue query failed"),
    }

    if let Err(e) = service.cleanup_queue().await {
        error!(error = %e, "Queue cleanup failed");
    }
}

pub struct DrainHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DrainHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the task after the current tick and waits for it.
    pub async fn cancel(self) {
        let _ = self.cancel_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Drain scheduler task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvoiceKind;
    use crate::service::tests::{input, service};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn drains_queued_invoices_until_cancelled() {
        let service = Arc::new(service(1).await);
        service.issue(input(InvoiceKind::Simplified, dec!(10.00))).await.unwrap();
        assert_eq!(service.queue_stats().await.unwrap().pending, 1);

        let handle = DrainScheduler::spawn(service.clone(), Duration::from_millis(10));

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if service.queue_stats().await.unwrap().completed == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "queue was not drained");

        handle.cancel().await;
    }
}
