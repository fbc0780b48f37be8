//! Boundary to the tax authority. Every call for an invoice is keyed by its
//! UUID, so resubmitting an accepted invoice does not create a duplicate.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::SubmissionError;
use crate::models::{Invoice, Operation};

pub use http::HttpComplianceClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceCheck {
    pub accepted: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportReceipt {
    pub accepted: bool,
    pub reference_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceReceipt {
    pub accepted: bool,
    /// Authority-stamped XML, base64 as returned.
    pub cleared_invoice_xml: Option<String>,
}

/// Result of a report or clearance, whichever the invoice kind needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum SubmissionReceipt {
    Report(ReportReceipt),
    Clear(ClearanceReceipt),
}

impl SubmissionReceipt {
    pub fn accepted(&self) -> bool {
        match self {
            SubmissionReceipt::Report(r) => r.accepted,
            SubmissionReceipt::Clear(c) => c.accepted,
        }
    }

    pub fn reference(&self) -> Option<String> {
        match self {
            SubmissionReceipt::Report(r) => Some(r.reference_id.clone()),
            SubmissionReceipt::Clear(_) => None,
        }
    }

    pub fn cleared_xml(&self) -> Option<String> {
        match self {
            SubmissionReceipt::Report(_) => None,
            SubmissionReceipt::Clear(c) => c.cleared_invoice_xml.clone(),
        }
    }
}

#[async_trait]
pub trait ComplianceClient: Send + Sync {
    async fn check_compliance(&self, invoice: &Invoice) -> Result<ComplianceCheck, SubmissionError>;

    async fn report_invoice(&self, invoice: &Invoice) -> Result<ReportReceipt, SubmissionError>;

    async fn clear_invoice(&self, invoice: &Invoice) -> Result<ClearanceReceipt, SubmissionError>;
}

/// Runs the operation an entry was queued for.
pub async fn submit(
    client: &dyn ComplianceClient,
    invoice: &Invoice,
    operation: Operation,
) -> Result<SubmissionReceipt, SubmissionError> {
    match operation {
        Operation::Report => client.report_invoice(invoice).await.map(SubmissionReceipt::Report),
        Operation::Clear => client.clear_invoice(invoice).await.map(SubmissionReceipt::Clear),
    }
}
