#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k256::pkcs8::LineEnding;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

use einvoice_engine::client::{ClearanceReceipt, ComplianceCheck, ReportReceipt};
use einvoice_engine::core::config::CsrIdentity;
use einvoice_engine::core::error::{ReasonCode, Rejection, SubmissionError};
use einvoice_engine::models::{Buyer, Seller};
use einvoice_engine::{
    ComplianceClient, ComplianceService, ComplianceSettings, Environment, Invoice, InvoiceInput,
    InvoiceKind, InvoiceSigner, LineItemInput, Store,
};

pub const SELLER_VAT: &str = "399999999900003";
pub const SELLER_NAME: &str = "Maximum Speed Tech Supply LTD";

/// Scripted authority: pops one outcome per report/clear call, accepting
/// once the script runs out.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<(), SubmissionError>>>,
    calls: Mutex<Vec<Uuid>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<(), SubmissionError>>) -> Arc<Self> {
        Arc::new(ScriptedClient {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn push(&self, outcome: Result<(), SubmissionError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Invoice UUIDs in the order the authority saw them.
    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, invoice: &Invoice) -> Result<(), SubmissionError> {
        self.calls.lock().unwrap().push(invoice.uuid());
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl ComplianceClient for ScriptedClient {
    async fn check_compliance(&self, _invoice: &Invoice) -> Result<ComplianceCheck, SubmissionError> {
        Ok(ComplianceCheck {
            accepted: true,
            warnings: Vec::new(),
        })
    }

    async fn report_invoice(&self, invoice: &Invoice) -> Result<ReportReceipt, SubmissionError> {
        self.next(invoice).map(|_| ReportReceipt {
            accepted: true,
            reference_id: format!("REF-{}", invoice.id),
        })
    }

    async fn clear_invoice(&self, invoice: &Invoice) -> Result<ClearanceReceipt, SubmissionError> {
        self.next(invoice).map(|_| ClearanceReceipt {
            accepted: true,
            cleared_invoice_xml: Some(STANDARD.encode(format!("<Invoice>{}</Invoice>", invoice.uuid()))),
        })
    }
}

pub fn network_error() -> Result<(), SubmissionError> {
    Err(SubmissionError::Network("connection reset".to_string()))
}

pub fn rejection(code: &str) -> Result<(), SubmissionError> {
    Err(SubmissionError::Rejected(Rejection {
        reasons: vec![ReasonCode::new(code, "rejected by scripted authority")],
    }))
}

/// Key, certificate and database living in one temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub settings: ComplianceSettings,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path(), "key.pem");
        write_key(&settings.private_key_path);
        std::fs::write(&settings.certificate_path, certificate_pem(&[0x42; 71])).unwrap();
        Fixture { dir, settings }
    }

    /// Same database and certificate, freshly generated signing key.
    pub fn with_new_key(&self) -> ComplianceSettings {
        let settings = settings_in(self.dir.path(), "rotated-key.pem");
        write_key(&settings.private_key_path);
        settings
    }

    pub async fn open(&self, client: Arc<dyn ComplianceClient>) -> ComplianceService {
        open_service(self.settings.clone(), client).await
    }
}

pub async fn open_service(settings: ComplianceSettings, client: Arc<dyn ComplianceClient>) -> ComplianceService {
    let signer = InvoiceSigner::from_settings(&settings).unwrap();
    let store = Store::connect(&settings.database_url).await.unwrap();
    ComplianceService::with_parts(settings, signer, store, client)
        .await
        .unwrap()
}

fn settings_in(dir: &Path, key_file: &str) -> ComplianceSettings {
    let mut settings = ComplianceSettings::new(
        Environment::Sandbox,
        dir.join("cert.pem"),
        dir.join(key_file),
        CsrIdentity {
            common_name: "TST-886431145-399999999900003".to_string(),
            legal_name: SELLER_NAME.to_string(),
            vat_number: SELLER_VAT.to_string(),
            registration_number: "1010010000".to_string(),
            address: "RRRD2929".to_string(),
            organization_unit: Some("Riyadh Branch".to_string()),
            country: "SA".to_string(),
            invoice_type: "1100".to_string(),
            industry: Some("Supplies".to_string()),
        },
    );
    settings.database_url = format!("sqlite://{}", dir.join("einvoice.db").display());
    settings.queue.max_attempts = 5;
    settings
}

fn write_key(path: &Path) {
    let secret = k256::SecretKey::random(&mut rand::thread_rng());
    let pem = secret.to_sec1_pem(LineEnding::LF).unwrap();
    std::fs::write(path, pem.as_bytes()).unwrap();
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    if content.len() < 0x80 {
        out.push(content.len() as u8);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(content);
    out
}

/// Certificate-shaped PEM whose signatureValue is `signature`.
pub fn certificate_pem(signature: &[u8]) -> String {
    let tbs = der(0x30, &der(0x02, &[0x01]));
    let algorithm = der(0x30, &der(0x06, &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02]));
    let mut bits = vec![0u8];
    bits.extend_from_slice(signature);

    let mut body = tbs;
    body.extend(algorithm);
    body.extend(der(0x03, &bits));
    let encoded = STANDARD.encode(der(0x30, &body));

    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(line).unwrap());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

pub fn seller() -> Seller {
    Seller {
        name: SELLER_NAME.to_string(),
        vat_number: SELLER_VAT.to_string(),
        registration_number: Some("1010010000".to_string()),
        address: None,
    }
}

pub fn simplified(quantity: Decimal, unit_price: Decimal) -> InvoiceInput {
    InvoiceInput {
        kind: InvoiceKind::Simplified,
        seller: seller(),
        buyer: None,
        items: vec![LineItemInput {
            description: "Printer paper A4".to_string(),
            quantity,
            unit_price,
            vat_rate: dec!(0.15),
        }],
        currency: "SAR".to_string(),
    }
}

pub fn standard(unit_price: Decimal) -> InvoiceInput {
    InvoiceInput {
        kind: InvoiceKind::Standard,
        buyer: Some(Buyer {
            name: "Fatoora Samples LTD".to_string(),
            vat_number: Some("399999999800003".to_string()),
            address: None,
        }),
        ..simplified(dec!(1), unit_price)
    }
}
