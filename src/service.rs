//! The compliance engine as one explicitly constructed value.
//!
//! A `ComplianceService` owns its settings, signing key, chain tail, store and
//! queue. Settings never change under a live service; reconfiguring means
//! building a new one, which resumes the chain of its own key (or starts a
//! fresh one for a new key).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::client::{self, ComplianceCheck, ComplianceClient, HttpComplianceClient, SubmissionReceipt};
use crate::core::config::{is_vat_number, ComplianceSettings};
use crate::core::error::{ComplianceError, ComplianceResult, ReasonCode, Rejection, SubmissionError};
use crate::crypto::{verify_signature, InvoiceSigner};
use crate::invoice::{chain_id, content_hash, verify_chain, ChainTail, HashChain, InvoiceBuilder};
use crate::metrics;
use crate::models::{
    invoice_number, Invoice, InvoiceInput, InvoiceKind, InvoiceStatus, Operation, QueueEntry,
    QueueStats,
};
use crate::qr::{render_png, QrPayload};
use crate::queue::{DrainReport, OfflineQueue};
use crate::storage::Store;

const HIGH_VALUE_THRESHOLD: Decimal = Decimal::ONE_THOUSAND;

/// What happened to a freshly issued invoice on its way to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Submitted {
        reference: Option<String>,
        /// Authority-stamped UBL (base64) returned by clearance.
        #[serde(skip_serializing_if = "Option::is_none")]
        cleared_xml: Option<String>,
    },
    /// Waiting in the offline queue; `reason` is empty for deferred submission.
    Queued {
        entry_id: Uuid,
        reason: Option<String>,
    },
    Rejected {
        reasons: Vec<ReasonCode>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedInvoice {
    pub invoice: Invoice,
    pub submission: SubmissionOutcome,
}

/// Local pre-validation result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ComplianceService {
    settings: Arc<ComplianceSettings>,
    signer: InvoiceSigner,
    chain: HashChain,
    store: Store,
    queue: OfflineQueue,
    client: Arc<dyn ComplianceClient>,
    /// One conversation with the authority at a time: immediate submissions
    /// and queue drains take turns here.
    submission: Mutex<()>,
}

impl ComplianceService {
    /// Loads key material, opens the configured database and talks to the
    /// authority over HTTP.
    pub async fn open(settings: ComplianceSettings) -> ComplianceResult<Self> {
        settings.validate()?;
        let signer = InvoiceSigner::from_settings(&settings)?;
        let client = Arc::new(HttpComplianceClient::new(&settings, signer.certificate())?);
        let store = Store::connect(&settings.database_url).await?;

        Self::with_parts(settings, signer, store, client).await
    }

    /// Builds a service from ready components, restoring the chain tail and
    /// queue from `store`.
    #[instrument(skip_all, fields(vat = %settings.csr.vat_number, environment = %settings.environment))]
    pub async fn with_parts(
        settings: ComplianceSettings,
        signer: InvoiceSigner,
        store: Store,
        client: Arc<dyn ComplianceClient>,
    ) -> ComplianceResult<Self> {
        let chain_id = chain_id(&settings.csr.vat_number, signer.public_key_der());
        let stored = store.chain_invoices(&chain_id).await?;

        let (tail, broken) = match verify_chain(&stored) {
            Ok(tail) => (tail, None),
            Err(e) => {
                let tail = stored
                    .last()
                    .map(|last| ChainTail {
                        icv: last.icv,
                        last_hash: last.content_hash,
                    })
                    .unwrap_or_else(ChainTail::genesis);
                (tail, Some(e.to_string()))
            }
        };

        let chain = HashChain::new(chain_id.clone(), tail);
        if let Some(reason) = broken {
            chain.halt(reason).await;
        }
        info!(chain_id = %chain_id, icv = tail.icv, invoices = stored.len(), "Hash chain restored");

        let queue = OfflineQueue::new(store.clone(), settings.queue.clone());
        queue.recover().await?;

        let service = ComplianceService {
            settings: Arc::new(settings),
            signer,
            chain,
            store,
            queue,
            client,
            submission: Mutex::new(()),
        };
        service.requeue_unsubmitted().await?;
        Ok(service)
    }

    // A crash between storing an invoice and handing it on leaves it `signed`.
    async fn requeue_unsubmitted(&self) -> ComplianceResult<()> {
        let orphans = self.store.unsubmitted_invoices(self.chain.chain_id()).await?;
        for invoice in orphans {
            warn!(uuid = %invoice.uuid(), icv = invoice.icv, "Queueing invoice left unsubmitted");
            let operation = invoice.kind().operation();
            self.queue.enqueue(invoice, operation, Utc::now()).await?;
        }
        Ok(())
    }

    pub fn settings(&self) -> &ComplianceSettings {
        &self.settings
    }

    pub fn chain_id(&self) -> &str {
        self.chain.chain_id()
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn chain_tail(&self) -> ChainTail {
        self.chain.tail().await
    }

    pub async fn chain_halted(&self) -> Option<String> {
        self.chain.halted().await
    }

    /// Builds, chains, signs, stores and (if enabled) submits one invoice.
    #[instrument(skip(self, input), fields(kind = %input.kind))]
    pub async fn issue(&self, input: InvoiceInput) -> ComplianceResult<IssuedInvoice> {
        if input.seller.vat_number.trim() != self.settings.csr.vat_number {
            return Err(ComplianceError::validation(
                "seller.vat_number",
                "does not match the configured taxpayer",
            ));
        }

        let canonical = InvoiceBuilder::new().build(input)?;
        let kind = canonical.kind;

        let reservation = self.chain.reserve_wait(&canonical).await?;
        let link = reservation.link();

        let signature = self.signer.sign(link.content_hash.as_bytes(), kind)?;
        let qr = QrPayload::for_invoice(&canonical, &link.content_hash, &signature)?;

        let invoice = Invoice {
            id: invoice_number(link.icv),
            icv: link.icv,
            pih: link.pih,
            content_hash: link.content_hash,
            canonical,
            signature,
            qr_payload: qr.encode(),
            status: InvoiceStatus::Signed,
            cleared_xml: None,
        };

        // The tail moves only once the invoice is on disk.
        match self.store.insert_invoice(self.chain.chain_id(), &invoice).await {
            Ok(()) => {}
            Err(ComplianceError::ChainIntegrity(reason)) => {
                // Another writer already holds this position; the local tail is stale.
                reservation.halt(reason.clone());
                return Err(ComplianceError::ChainIntegrity(reason));
            }
            Err(e) => return Err(e),
        }

        // Taken before the tail moves so hand-offs follow ICV order.
        let turn = if self.settings.auto_submit {
            Some(self.submission.lock().await)
        } else {
            None
        };
        reservation.commit();

        metrics::INVOICES_ISSUED.with_label_values(&[&kind.to_string()]).inc();
        info!(uuid = %invoice.uuid(), icv = invoice.icv, id = %invoice.id, "Invoice issued");

        let submission = self.hand_off(invoice.clone(), turn).await?;
        let invoice = self.store.get_invoice(invoice.uuid()).await?.unwrap_or(invoice);

        Ok(IssuedInvoice { invoice, submission })
    }

    /// `_turn` is the submission lock, held until the invoice has an outcome
    /// or a queue entry.
    async fn hand_off(
        &self,
        invoice: Invoice,
        _turn: Option<MutexGuard<'_, ()>>,
    ) -> ComplianceResult<SubmissionOutcome> {
        let operation = invoice.kind().operation();

        if !self.settings.auto_submit {
            let entry = self.queue.enqueue(invoice, operation, Utc::now()).await?;
            return Ok(SubmissionOutcome::Queued {
                entry_id: entry.id,
                reason: None,
            });
        }

        // Jumping the queue would let this invoice reach the authority
        // before earlier ones.
        if !self.store.active_entries().await?.is_empty() {
            let entry = self.queue.enqueue(invoice, operation, Utc::now()).await?;
            return Ok(SubmissionOutcome::Queued {
                entry_id: entry.id,
                reason: Some("earlier invoices are still queued".to_string()),
            });
        }

        self.submit_now(invoice, operation).await
    }

    async fn submit_now(&self, invoice: Invoice, operation: Operation) -> ComplianceResult<SubmissionOutcome> {
        let uuid = invoice.uuid();
        let label = operation.as_str();

        let timer = metrics::SUBMISSION_DURATION.with_label_values(&[label]).start_timer();
        let result = client::submit(self.client.as_ref(), &invoice, operation).await;
        timer.observe_duration();

        match result {
            Ok(receipt) if receipt.accepted() => {
                metrics::record_submission(label, "accepted");
                let status = match receipt {
                    SubmissionReceipt::Report(_) => InvoiceStatus::Reported,
                    SubmissionReceipt::Clear(_) => InvoiceStatus::Cleared,
                };
                self.store.update_invoice_status(uuid, status).await?;
                let cleared_xml = receipt.cleared_xml();
                if let Some(xml) = &cleared_xml {
                    self.store.set_cleared_xml(uuid, xml).await?;
                }
                info!(%uuid, %status, "Invoice accepted by authority");
                Ok(SubmissionOutcome::Submitted {
                    reference: receipt.reference(),
                    cleared_xml,
                })
            }
            Ok(_) => {
                metrics::record_submission(label, "rejected");
                self.reject(uuid, Rejection {
                    reasons: vec![ReasonCode::new("NOT_ACCEPTED", "authority did not accept the invoice")],
                })
                .await
            }
            Err(SubmissionError::Rejected(rejection)) => {
                metrics::record_submission(label, "rejected");
                self.reject(uuid, rejection).await
            }
            Err(SubmissionError::Network(message)) => {
                metrics::record_submission(label, "network_error");
                warn!(%uuid, error = %message, "Authority unreachable, queueing invoice");
                let entry = self.queue.enqueue(invoice, operation, Utc::now()).await?;
                Ok(SubmissionOutcome::Queued {
                    entry_id: entry.id,
                    reason: Some(message),
                })
            }
        }
    }

    async fn reject(&self, uuid: Uuid, rejection: Rejection) -> ComplianceResult<SubmissionOutcome> {
        self.store.update_invoice_status(uuid, InvoiceStatus::Rejected).await?;
        error!(%uuid, reasons = %rejection.summary(), "Invoice rejected by authority");
        Ok(SubmissionOutcome::Rejected {
            reasons: rejection.reasons,
        })
    }

    pub async fn get_invoice(&self, uuid: Uuid) -> ComplianceResult<Option<Invoice>> {
        self.store.get_invoice(uuid).await
    }

    async fn require_invoice(&self, uuid: Uuid) -> ComplianceResult<Invoice> {
        self.store
            .get_invoice(uuid)
            .await?
            .ok_or_else(|| ComplianceError::validation("uuid", format!("no invoice {}", uuid)))
    }

    /// Sends a stored invoice to the authority's compliance check.
    pub async fn check_compliance(&self, uuid: Uuid) -> ComplianceResult<ComplianceCheck> {
        let invoice = self.require_invoice(uuid).await?;
        let check = self.client.check_compliance(&invoice).await?;
        info!(%uuid, accepted = check.accepted, warnings = check.warnings.len(), "Compliance check done");
        Ok(check)
    }

    pub async fn qr_png(&self, uuid: Uuid) -> ComplianceResult<Vec<u8>> {
        let invoice = self.require_invoice(uuid).await?;
        render_png(&invoice.qr_payload)
    }

    pub fn decode_qr(&self, payload: &str) -> ComplianceResult<QrPayload> {
        QrPayload::decode(payload)
    }

    pub async fn drain_queue(&self) -> ComplianceResult<DrainReport> {
        self.drain_queue_at(Utc::now()).await
    }

    /// Waits for any immediate submission in flight, then drains.
    pub async fn drain_queue_at(&self, now: DateTime<Utc>) -> ComplianceResult<DrainReport> {
        let _turn = self.submission.lock().await;
        self.queue.drain_at(self.client.as_ref(), now).await
    }

    pub async fn query_overdue(&self) -> ComplianceResult<Vec<QueueEntry>> {
        self.queue.overdue(Utc::now()).await
    }

    pub async fn query_overdue_at(&self, now: DateTime<Utc>) -> ComplianceResult<Vec<QueueEntry>> {
        self.queue.overdue(now).await
    }

    pub async fn queue_stats(&self) -> ComplianceResult<QueueStats> {
        self.queue.stats().await
    }

    pub async fn export_queue(&self) -> ComplianceResult<String> {
        self.queue.export_json().await
    }

    pub async fn remove_queue_entry(&self, id: Uuid) -> ComplianceResult<QueueEntry> {
        self.queue.remove(id).await
    }

    pub async fn retry_queue_entry(&self, id: Uuid) -> ComplianceResult<QueueEntry> {
        self.queue.retry_failed(id, Utc::now()).await
    }

    pub async fn cleanup_queue(&self) -> ComplianceResult<u64> {
        self.queue.cleanup(Utc::now()).await
    }

    /// Operator override after a chain integrity failure.
    pub async fn resume_chain(&self) -> ChainTail {
        self.chain.resume().await;
        self.chain.tail().await
    }
}

/// Structural checks on an issued invoice, without contacting the authority.
pub fn validate_invoice(invoice: &Invoice) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let canonical = &invoice.canonical;

    if canonical.uuid.is_nil() {
        errors.push("invoice UUID is missing".to_string());
    }
    if !is_vat_number(&canonical.seller.vat_number) {
        errors.push("seller VAT number must be 15 digits".to_string());
    }
    if canonical.lines.is_empty() {
        errors.push("invoice has no line items".to_string());
    }
    if canonical.kind == InvoiceKind::Standard
        && canonical.buyer.as_ref().and_then(|b| b.vat_number.as_ref()).is_none()
    {
        errors.push("standard invoice requires the buyer VAT number".to_string());
    }

    let subtotal: Decimal = canonical.lines.iter().map(|l| l.net_amount).sum();
    let vat_total: Decimal = canonical.lines.iter().map(|l| l.vat_amount).sum();
    if subtotal != canonical.totals.subtotal
        || vat_total != canonical.totals.vat_total
        || subtotal + vat_total != canonical.totals.grand_total
    {
        errors.push("totals do not add up to the line items".to_string());
    }

    match content_hash(canonical, invoice.icv, &invoice.pih) {
        Ok(hash) if hash == invoice.content_hash => {}
        Ok(_) => errors.push("content hash does not match the invoice".to_string()),
        Err(e) => errors.push(format!("cannot hash invoice: {}", e)),
    }

    if let Err(e) = verify_signature(invoice.content_hash.as_bytes(), &invoice.signature) {
        errors.push(e.to_string());
    }

    if invoice.qr_payload.is_empty() {
        errors.push("QR payload is missing".to_string());
    } else {
        match QrPayload::decode(&invoice.qr_payload) {
            Ok(qr) => {
                if let Err(e) = qr.validate(canonical.kind) {
                    errors.push(e.to_string());
                }
                match qr.summary() {
                    Ok(summary) if summary.invoice_total != canonical.totals.grand_total => {
                        errors.push("QR total does not match the invoice".to_string())
                    }
                    Ok(_) => {}
                    Err(e) => errors.push(e.to_string()),
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    if canonical.totals.grand_total > HIGH_VALUE_THRESHOLD {
        warnings.push(format!(
            "high value invoice ({} {}) may need additional review",
            canonical.totals.grand_total, canonical.currency
        ));
    }
    if canonical.buyer.is_none() {
        warnings.push("no buyer information".to_string());
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}
