pub mod api;
pub mod client;
pub mod core;
pub mod crypto;
pub mod invoice;
pub mod metrics;
pub mod models;
pub mod qr;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use self::core::{ComplianceError, ComplianceResult, ComplianceSettings, Environment, QueueConfig};
pub use models::{
    Invoice, InvoiceInput, InvoiceKind, InvoiceStatus,
    LineItemInput, QueueEntry, QueueStats, QueueStatus,
};

pub use client::{ComplianceClient, HttpComplianceClient};
pub use crypto::{InvoiceSigner, SigningCertificate};
pub use invoice::{HashChain, InvoiceBuilder};
pub use qr::QrPayload;
pub use queue::{DrainReport, OfflineQueue};
pub use scheduler::{DrainHandle, DrainScheduler};
pub use service::{validate_invoice, ComplianceService, IssuedInvoice, SubmissionOutcome, ValidationReport};
pub use storage::Store;
