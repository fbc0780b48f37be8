//! Durable FIFO of invoices waiting for the tax authority.
//!
//! Entry lifecycle: `pending -> processing -> {completed | pending | failed}`.
//! Only [`OfflineQueue::drain_at`] moves entries through it, and at most one
//! drain runs at a time. Entries are tried strictly in enqueue order; a drain
//! stops at the first entry that is not yet due or that has to be retried,
//! so a later invoice never reaches the authority before an earlier one has
//! an outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::client::{self, ComplianceClient};
use crate::core::config::QueueConfig;
use crate::core::error::{ComplianceError, ComplianceResult, SubmissionError};
use crate::metrics;
use crate::models::{
    FailureKind, Invoice, InvoiceStatus, Operation, QueueEntry, QueueStats, QueueStatus,
};
use crate::storage::Store;

/// What one drain run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Another drain was already running; nothing was touched.
    pub skipped: bool,
    pub attempted: usize,
    pub completed: Vec<Uuid>,
    pub retry_scheduled: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    /// Head entry that stopped the drain, if any.
    pub blocked_by: Option<Uuid>,
}

enum Attempt {
    Completed,
    Retry,
    Failed,
    Vanished,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OfflineQueue {
    store: Store,
    config: QueueConfig,
    draining: AtomicBool,
}

impl OfflineQueue {
    pub fn new(store: Store, config: QueueConfig) -> Self {
        OfflineQueue {
            store,
            config,
            draining: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Puts back entries a crash left in flight. Call once before draining.
    pub async fn recover(&self) -> ComplianceResult<u64> {
        let reset = self.store.reset_in_flight().await?;
        if reset > 0 {
            warn!(count = reset, "Reset in-flight queue entries to pending");
        }
        Ok(reset)
    }

    #[instrument(skip(self, invoice), fields(uuid = %invoice.uuid(), icv = invoice.icv))]
    pub async fn enqueue(
        &self,
        invoice: Invoice,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> ComplianceResult<QueueEntry> {
        let uuid = invoice.uuid();
        let mut entry = QueueEntry::new(invoice, operation, now);
        entry.invoice.status = InvoiceStatus::Queued;

        self.store.insert_entry(&mut entry).await?;
        self.store.update_invoice_status(uuid, InvoiceStatus::Queued).await?;
        metrics::QUEUE_PENDING.inc();

        info!(entry_id = %entry.id, seq = entry.seq, %operation, "Invoice queued for submission");
        Ok(entry)
    }

    pub async fn drain(&self, client: &dyn ComplianceClient) -> ComplianceResult<DrainReport> {
        self.drain_at(client, Utc::now()).await
    }

    /// Processes due entries in FIFO order as of `now`.
    pub async fn drain_at(
        &self,
        client: &dyn ComplianceClient,
        now: DateTime<Utc>,
    ) -> ComplianceResult<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress, skipping");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = DrainGuard(&self.draining);
        metrics::QUEUE_DRAINS.inc();

        let mut report = DrainReport::default();

        for mut entry in self.store.active_entries().await? {
            if entry.status == QueueStatus::Processing || !entry.is_due(now) {
                report.blocked_by = Some(entry.id);
                break;
            }

            report.attempted += 1;
            match self.attempt(client, &mut entry, now).await? {
                Attempt::Completed => report.completed.push(entry.id),
                Attempt::Failed => report.failed.push(entry.id),
                Attempt::Vanished => {}
                Attempt::Retry => {
                    report.retry_scheduled.push(entry.id);
                    report.blocked_by = Some(entry.id);
                    break;
                }
            }
        }

        let pending = self.store.active_entries().await?.len();
        metrics::QUEUE_PENDING.set(pending as i64);

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                completed = report.completed.len(),
                retry = report.retry_scheduled.len(),
                failed = report.failed.len(),
                pending,
                "Queue drain finished"
            );
        }
        Ok(report)
    }

    #[instrument(
        skip(self, client, entry, now),
        fields(entry_id = %entry.id, uuid = %entry.invoice.uuid(), attempt = entry.attempts + 1)
    )]
    async fn attempt(
        &self,
        client: &dyn ComplianceClient,
        entry: &mut QueueEntry,
        now: DateTime<Utc>,
    ) -> ComplianceResult<Attempt> {
        entry.status = QueueStatus::Processing;
        entry.attempts += 1;
        entry.last_attempt_at = Some(now);
        if !self.persist(entry).await? {
            return Ok(Attempt::Vanished);
        }

        let operation = entry.operation.as_str();
        let timer = metrics::SUBMISSION_DURATION
            .with_label_values(&[operation])
            .start_timer();
        let result = client::submit(client, &entry.invoice, entry.operation).await;
        timer.observe_duration();

        let (outcome, invoice_status) = match result {
            Ok(receipt) if receipt.accepted() => {
                metrics::record_submission(operation, "accepted");
                entry.status = QueueStatus::Completed;
                entry.completed_at = Some(now);
                entry.reference = receipt.reference();
                entry.invoice.cleared_xml = receipt.cleared_xml();
                entry.last_error = None;
                info!(attempts = entry.attempts, "Invoice accepted by authority");
                let status = match entry.operation {
                    Operation::Report => InvoiceStatus::Reported,
                    Operation::Clear => InvoiceStatus::Cleared,
                };
                (Attempt::Completed, status)
            }
            Ok(_) => {
                metrics::record_submission(operation, "rejected");
                self.fail(entry, FailureKind::Rejected, "authority did not accept the invoice");
                (Attempt::Failed, InvoiceStatus::Rejected)
            }
            Err(SubmissionError::Rejected(rejection)) => {
                metrics::record_submission(operation, "rejected");
                self.fail(entry, FailureKind::Rejected, &rejection.summary());
                (Attempt::Failed, InvoiceStatus::Rejected)
            }
            Err(SubmissionError::Network(message)) => {
                metrics::record_submission(operation, "network_error");
                if entry.attempts >= self.config.max_attempts {
                    self.fail(entry, FailureKind::RetriesExhausted, &message);
                    (Attempt::Failed, InvoiceStatus::Failed)
                } else {
                    let delay = self.config.backoff.delay(entry.attempts);
                    entry.status = QueueStatus::Pending;
                    entry.next_retry_at = now + delay;
                    entry.last_error = Some(message);
                    warn!(
                        attempts = entry.attempts,
                        next_retry_at = %entry.next_retry_at,
                        "Submission failed, retry scheduled"
                    );
                    (Attempt::Retry, InvoiceStatus::Queued)
                }
            }
        };

        entry.invoice.status = invoice_status;
        if !self.persist(entry).await? {
            return Ok(Attempt::Vanished);
        }
        self.store
            .update_invoice_status(entry.invoice.uuid(), invoice_status)
            .await?;
        if let Some(xml) = &entry.invoice.cleared_xml {
            self.store.set_cleared_xml(entry.invoice.uuid(), xml).await?;
        }

        Ok(outcome)
    }

    fn fail(&self, entry: &mut QueueEntry, kind: FailureKind, reason: &str) {
        entry.status = QueueStatus::Failed;
        entry.failure = Some(kind);
        entry.last_error = Some(reason.to_string());
        error!(attempts = entry.attempts, failure = %kind, %reason, "Queue entry failed");
    }

    /// Writes the entry back; `false` if it was removed meanwhile.
    async fn persist(&self, entry: &QueueEntry) -> ComplianceResult<bool> {
        match self.store.update_entry(entry).await {
            Ok(()) => Ok(true),
            Err(ComplianceError::QueueEntry { id, .. }) => {
                warn!(entry_id = %id, "Queue entry removed during drain");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Non-terminal entries older than the submission deadline at `now`.
    pub async fn overdue(&self, now: DateTime<Utc>) -> ComplianceResult<Vec<QueueEntry>> {
        let deadline = self.config.overdue_after();
        let overdue: Vec<QueueEntry> = self
            .store
            .active_entries()
            .await?
            .into_iter()
            .filter(|entry| entry.is_overdue(now, deadline))
            .collect();

        metrics::QUEUE_OVERDUE.set(overdue.len() as i64);
        if !overdue.is_empty() {
            warn!(count = overdue.len(), "Queue entries past the submission deadline");
        }
        Ok(overdue)
    }

    pub async fn stats(&self) -> ComplianceResult<QueueStats> {
        let entries = self.store.all_entries().await?;
        Ok(QueueStats::from_entries(&entries))
    }

    pub async fn entries(&self) -> ComplianceResult<Vec<QueueEntry>> {
        self.store.all_entries().await
    }

    /// Full queue as pretty JSON, for audit.
    pub async fn export_json(&self) -> ComplianceResult<String> {
        let entries = self.store.all_entries().await?;
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    /// Drops an entry, cancelling any scheduled retry. Refused while the
    /// entry is being submitted.
    pub async fn remove(&self, id: Uuid) -> ComplianceResult<QueueEntry> {
        let entry = self.find(id).await?;
        if entry.status == QueueStatus::Processing {
            return Err(ComplianceError::QueueEntry {
                id,
                message: "cannot remove an entry while it is being submitted".to_string(),
            });
        }

        self.store.delete_entry(id).await?;
        info!(entry_id = %id, uuid = %entry.invoice.uuid(), "Queue entry removed");
        Ok(entry)
    }

    /// Re-arms an entry that gave up after too many network failures.
    /// Rejected entries need a corrected invoice instead.
    pub async fn retry_failed(&self, id: Uuid, now: DateTime<Utc>) -> ComplianceResult<QueueEntry> {
        let mut entry = self.find(id).await?;
        if entry.failure != Some(FailureKind::RetriesExhausted) {
            return Err(ComplianceError::QueueEntry {
                id,
                message: format!("only entries that exhausted their retries can be retried (status {})", entry.status),
            });
        }

        entry.status = QueueStatus::Pending;
        entry.failure = None;
        entry.attempts = 0;
        entry.next_retry_at = now;
        entry.invoice.status = InvoiceStatus::Queued;
        self.store.update_entry(&entry).await?;
        self.store
            .update_invoice_status(entry.invoice.uuid(), InvoiceStatus::Queued)
            .await?;

        info!(entry_id = %id, "Failed entry re-armed for submission");
        Ok(entry)
    }

    /// Deletes completed entries older than the retention window.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> ComplianceResult<u64> {
        let removed = self
            .store
            .delete_completed_before(now - self.config.completed_retention())
            .await?;
        if removed > 0 {
            info!(removed, "Old completed queue entries cleaned up");
        }
        Ok(removed)
    }

    pub async fn find(&self, id: Uuid) -> ComplianceResult<QueueEntry> {
        self.store.get_entry(id).await?.ok_or_else(|| ComplianceError::QueueEntry {
            id,
            message: "not found".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClearanceReceipt, ComplianceCheck, ReportReceipt};
    use crate::core::config::BackoffConfig;
    use crate::core::error::{ReasonCode, Rejection};
    use crate::crypto::SignatureBundle;
    use crate::invoice::{content_hash, InvoiceBuilder};
    use crate::models::{invoice_number, InvoiceHash, InvoiceInput, InvoiceKind, LineItemInput, Seller};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<(), SubmissionError>>>,
        calls: Mutex<Vec<Uuid>>,
    }

    impl ScriptedClient {
        fn with(responses: Vec<Result<(), SubmissionError>>) -> Self {
            ScriptedClient {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Uuid> {
            self.calls.lock().unwrap().clone()
        }

        fn next(&self, invoice: &Invoice) -> Result<(), SubmissionError> {
            self.calls.lock().unwrap().push(invoice.uuid());
            self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    #[async_trait]
    impl ComplianceClient for ScriptedClient {
        async fn check_compliance(&self, _invoice: &Invoice) -> Result<ComplianceCheck, SubmissionError> {
            Ok(ComplianceCheck {
                accepted: true,
                warnings: vec![],
            })
        }

        async fn report_invoice(&self, invoice: &Invoice) -> Result<ReportReceipt, SubmissionError> {
            self.next(invoice).map(|_| ReportReceipt {
                accepted: true,
                reference_id: format!("ref-{}", invoice.icv),
            })
        }

        async fn clear_invoice(&self, invoice: &Invoice) -> Result<ClearanceReceipt, SubmissionError> {
            self.next(invoice).map(|_| ClearanceReceipt {
                accepted: true,
                cleared_invoice_xml: Some(format!("cleared-{}", invoice.icv)),
            })
        }
    }

    fn network() -> Result<(), SubmissionError> {
        Err(SubmissionError::Network("connection reset".to_string()))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn invoice(icv: u64) -> Invoice {
        let canonical = InvoiceBuilder::new()
            .issued_at(t0())
            .build(InvoiceInput {
                kind: InvoiceKind::Simplified,
                seller: Seller {
                    name: "Acme".to_string(),
                    vat_number: "300000000000003".to_string(),
                    registration_number: None,
                    address: None,
                },
                buyer: None,
                items: vec![LineItemInput {
                    description: "Tea".to_string(),
                    quantity: dec!(1),
                    unit_price: dec!(10),
                    vat_rate: dec!(0.15),
                }],
                currency: "SAR".to_string(),
            })
            .unwrap();
        let pih = InvoiceHash::genesis();
        let hash = content_hash(&canonical, icv, &pih).unwrap();

        Invoice {
            id: invoice_number(icv),
            icv,
            pih,
            content_hash: hash,
            canonical,
            signature: SignatureBundle {
                signature: vec![1],
                public_key: vec![2],
                certificate_signature: None,
            },
            qr_payload: String::new(),
            status: InvoiceStatus::Signed,
            cleared_xml: None,
        }
    }

    async fn queue(max_attempts: u32) -> (OfflineQueue, Store) {
        let store = Store::in_memory().await.unwrap();
        let config = QueueConfig {
            max_attempts,
            backoff: BackoffConfig {
                initial_delay_secs: 5,
                multiplier: 2,
                max_delay_secs: 60,
            },
            ..QueueConfig::default()
        };
        (OfflineQueue::new(store.clone(), config), store)
    }

    async fn enqueue(queue: &OfflineQueue, store: &Store, icv: u64) -> QueueEntry {
        let invoice = invoice(icv);
        store.insert_invoice("chain", &invoice).await.unwrap();
        queue.enqueue(invoice, Operation::Report, t0()).await.unwrap()
    }

    async fn entry(store: &Store, id: Uuid) -> QueueEntry {
        store.get_entry(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn three_network_errors_then_success_completes_on_fourth_attempt() {
        let (queue, store) = queue(5).await;
        let queued = enqueue(&queue, &store, 1).await;
        let client = ScriptedClient::with(vec![network(), network(), network(), Ok(())]);

        let mut now = t0();
        for _ in 0..4 {
            queue.drain_at(&client, now).await.unwrap();
            now += Duration::hours(1);
        }

        let done = entry(&store, queued.id).await;
        assert_eq!(done.status, QueueStatus::Completed);
        assert_eq!(done.attempts, 4);
        assert_eq!(done.reference.as_deref(), Some("ref-1"));
        assert!(queue.store.active_entries().await.unwrap().is_empty());

        let invoice = store.get_invoice(queued.invoice.uuid()).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Reported);

        // never retried again
        queue.drain_at(&client, now).await.unwrap();
        assert_eq!(client.calls().len(), 4);
    }

    #[tokio::test]
    async fn rejection_fails_immediately() {
        let (queue, store) = queue(5).await;
        let queued = enqueue(&queue, &store, 1).await;
        let client = ScriptedClient::with(vec![Err(SubmissionError::Rejected(Rejection {
            reasons: vec![ReasonCode::new("BR-KSA-08", "seller id missing")],
        }))]);

        let report = queue.drain_at(&client, t0()).await.unwrap();

        let failed = entry(&store, queued.id).await;
        assert_eq!(report.failed, vec![queued.id]);
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.failure, Some(FailureKind::Rejected));
        assert_eq!(failed.last_error.as_deref(), Some("BR-KSA-08: seller id missing"));

        let invoice = store.get_invoice(queued.invoice.uuid()).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Rejected);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (queue, store) = queue(3).await;
        let queued = enqueue(&queue, &store, 1).await;
        let client = ScriptedClient::with(vec![network(), network(), network(), Ok(())]);

        let mut now = t0();
        for _ in 0..5 {
            queue.drain_at(&client, now).await.unwrap();
            now += Duration::hours(1);
        }

        let failed = entry(&store, queued.id).await;
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert_eq!(failed.failure, Some(FailureKind::RetriesExhausted));
        assert_eq!(client.calls().len(), 3);
    }

    #[tokio::test]
    async fn backoff_schedules_next_retry() {
        let (queue, store) = queue(5).await;
        let queued = enqueue(&queue, &store, 1).await;
        let client = ScriptedClient::with(vec![network(), network()]);

        queue.drain_at(&client, t0()).await.unwrap();
        assert_eq!(entry(&store, queued.id).await.next_retry_at, t0() + Duration::seconds(5));

        // not due yet: nothing happens
        let report = queue.drain_at(&client, t0() + Duration::seconds(4)).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.blocked_by, Some(queued.id));

        let at = t0() + Duration::seconds(5);
        queue.drain_at(&client, at).await.unwrap();
        let retried = entry(&store, queued.id).await;
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.next_retry_at, at + Duration::seconds(10));
        assert_eq!(retried.status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn drains_in_enqueue_order_and_stops_at_retry() {
        let (queue, store) = queue(5).await;
        let a = enqueue(&queue, &store, 1).await;
        let b = enqueue(&queue, &store, 2).await;
        let c = enqueue(&queue, &store, 3).await;
        let client = ScriptedClient::with(vec![Ok(()), network()]);

        let report = queue.drain_at(&client, t0()).await.unwrap();
        assert_eq!(report.completed, vec![a.id]);
        assert_eq!(report.retry_scheduled, vec![b.id]);
        assert_eq!(client.calls(), vec![a.invoice.uuid(), b.invoice.uuid()]);

        queue.drain_at(&client, t0() + Duration::minutes(1)).await.unwrap();
        assert_eq!(
            client.calls(),
            vec![a.invoice.uuid(), b.invoice.uuid(), b.invoice.uuid(), c.invoice.uuid()]
        );
        assert_eq!(entry(&store, c.id).await.status, QueueStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_failure_lets_later_entries_through() {
        let (queue, store) = queue(5).await;
        let a = enqueue(&queue, &store, 1).await;
        let b = enqueue(&queue, &store, 2).await;
        let client = ScriptedClient::with(vec![Err(SubmissionError::Rejected(Rejection { reasons: vec![] }))]);

        let report = queue.drain_at(&client, t0()).await.unwrap();

        assert_eq!(report.failed, vec![a.id]);
        assert_eq!(report.completed, vec![b.id]);
    }

    #[tokio::test]
    async fn overdue_is_reported_after_deadline_only_while_active() {
        let (queue, store) = queue(5).await;
        let a = enqueue(&queue, &store, 1).await;
        let b = enqueue(&queue, &store, 2).await;
        let deadline = queue.config().overdue_after();

        assert!(queue.overdue(t0() + deadline).await.unwrap().is_empty());

        let late = t0() + deadline + Duration::seconds(1);
        let overdue = queue.overdue(late).await.unwrap();
        assert_eq!(overdue.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        // querying changes nothing
        assert_eq!(entry(&store, a.id).await.status, QueueStatus::Pending);

        let client = ScriptedClient::default();
        queue.drain_at(&client, late).await.unwrap();
        assert!(queue.overdue(late).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cannot_remove_entry_in_flight() {
        let (queue, store) = queue(5).await;
        let queued = enqueue(&queue, &store, 1).await;

        let mut busy = entry(&store, queued.id).await;
        busy.status = QueueStatus::Processing;
        store.update_entry(&busy).await.unwrap();

        assert!(matches!(
            queue.remove(queued.id).await,
            Err(ComplianceError::QueueEntry { .. })
        ));

        queue.recover().await.unwrap();
        queue.remove(queued.id).await.unwrap();
        assert!(store.get_entry(queued.id).await.unwrap().is_none());
        assert!(matches!(
            queue.remove(queued.id).await,
            Err(ComplianceError::QueueEntry { .. })
        ));
    }

    #[tokio::test]
    async fn manual_retry_only_for_exhausted_entries() {
        let (queue, store) = queue(1).await;
        let exhausted = enqueue(&queue, &store, 1).await;
        let rejected = enqueue(&queue, &store, 2).await;
        let client = ScriptedClient::with(vec![
            network(),
            Err(SubmissionError::Rejected(Rejection { reasons: vec![] })),
        ]);

        queue.drain_at(&client, t0()).await.unwrap();
        assert_eq!(entry(&store, exhausted.id).await.failure, Some(FailureKind::RetriesExhausted));
        assert_eq!(entry(&store, rejected.id).await.failure, Some(FailureKind::Rejected));

        assert!(queue.retry_failed(rejected.id, t0()).await.is_err());

        let rearmed = queue.retry_failed(exhausted.id, t0()).await.unwrap();
        assert_eq!(rearmed.status, QueueStatus::Pending);
        assert_eq!(rearmed.attempts, 0);

        queue.drain_at(&client, t0()).await.unwrap();
        assert_eq!(entry(&store, exhausted.id).await.status, QueueStatus::Completed);
    }

    #[tokio::test]
    async fn stats_export_and_cleanup() {
        let (queue, store) = queue(5).await;
        let a = enqueue(&queue, &store, 1).await;
        enqueue(&queue, &store, 2).await;
        let client = ScriptedClient::with(vec![Ok(()), network()]);
        queue.drain_at(&client, t0()).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);

        let exported: serde_json::Value = serde_json::from_str(&queue.export_json().await.unwrap()).unwrap();
        assert_eq!(exported.as_array().unwrap().len(), 2);
        assert_eq!(exported[0]["invoice"]["status"], "reported");
        assert_eq!(exported[1]["invoice"]["status"], "queued");

        let retention = queue.config().completed_retention();
        assert_eq!(queue.cleanup(t0() + retention).await.unwrap(), 0);
        assert_eq!(queue.cleanup(t0() + retention + Duration::seconds(1)).await.unwrap(), 1);
        assert!(store.get_entry(a.id).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn cleared_document_is_kept_with_invoice_and_entry() {
        let (queue, store) = queue(5).await;
        let invoice = invoice(1);
        store.insert_invoice("chain", &invoice).await.unwrap();
        let queued = queue.enqueue(invoice, Operation::Clear, t0()).await.unwrap();

        queue.drain_at(&ScriptedClient::default(), t0()).await.unwrap();

        let stored = store.get_invoice(queued.invoice.uuid()).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Cleared);
        assert_eq!(stored.cleared_xml.as_deref(), Some("cleared-1"));

        let done = entry(&store, queued.id).await;
        assert_eq!(done.invoice.status, InvoiceStatus::Cleared);
        assert_eq!(done.invoice.cleared_xml.as_deref(), Some("cleared-1"));
    }

    struct BlockingClient {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ComplianceClient for BlockingClient {
        async fn check_compliance(&self, _invoice: &Invoice) -> Result<ComplianceCheck, SubmissionError> {
            unreachable!()
        }

        async fn report_invoice(&self, invoice: &Invoice) -> Result<ReportReceipt, SubmissionError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(ReportReceipt {
                accepted: true,
                reference_id: invoice.uuid().to_string(),
            })
        }

        async fn clear_invoice(&self, _invoice: &Invoice) -> Result<ClearanceReceipt, SubmissionError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn concurrent_drain_is_skipped() {
        let (queue, store) = queue(5).await;
        let queued = enqueue(&queue, &store, 1).await;
        let queue = Arc::new(queue);
        let client = Arc::new(BlockingClient {
            entered: Notify::new(),
            release: Notify::new(),
        });

        let first = {
            let queue = queue.clone();
            let client = client.clone();
            tokio::spawn(async move { queue.drain_at(client.as_ref(), t0()).await.unwrap() })
        };

        client.entered.notified().await;
        assert!(queue.is_draining());
        assert_eq!(entry(&store, queued.id).await.status, QueueStatus::Processing);

        let second = queue.drain_at(client.as_ref(), t0()).await.unwrap();
        assert!(second.skipped);

        client.release.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.completed, vec![queued.id]);
        assert!(!queue.is_draining());
    }
}
