use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use super::common::{Buyer, InvoiceKind, Seller};
use crate::crypto::SignatureBundle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Fraction, e.g. `0.15` for 15%.
    pub vat_rate: Decimal,
}

/// Raw invoice as it comes from the surrounding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceInput {
    #[serde(default)]
    pub kind: InvoiceKind,
    pub seller: Seller,
    #[serde(default)]
    pub buyer: Option<Buyer>,
    pub items: Vec<LineItemInput>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "SAR".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub line_number: u32,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub vat_rate: Decimal,
    pub net_amount: Decimal,
    pub vat_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub vat_total: Decimal,
    pub grand_total: Decimal,
}

/// Validated, normalized invoice. Field order here is the hashing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalInvoice {
    pub uuid: Uuid,
    pub kind: InvoiceKind,
    pub issued_at: DateTime<Utc>,
    pub currency: String,
    pub seller: Seller,
    pub buyer: Option<Buyer>,
    pub lines: Vec<InvoiceLine>,
    pub totals: InvoiceTotals,
}

impl CanonicalInvoice {
    /// ISO 8601 timestamp with second precision, as printed in the QR code.
    pub fn timestamp(&self) -> String {
        self.issued_at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

/// 256-bit SHA-256 digest of an invoice.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvoiceHash([u8; 32]);

impl InvoiceHash {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        InvoiceHash(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(InvoiceHash(array))
    }

    pub fn digest(data: &[u8]) -> Self {
        InvoiceHash(Sha256::digest(data).into())
    }

    /// PIH of the first invoice of every chain: SHA-256 of `"0"`.
    pub fn genesis() -> Self {
        Self::digest(b"0")
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let bytes = hex::decode(value).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Text form used in the PIH document reference: base64 of the hex digest.
    pub fn to_pih_text(&self) -> String {
        STANDARD.encode(self.to_hex())
    }
}

impl fmt::Debug for InvoiceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvoiceHash({})", self.to_hex())
    }
}

impl fmt::Display for InvoiceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for InvoiceHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InvoiceHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        InvoiceHash::from_hex(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid invoice hash `{}`", text)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Signed,
    Queued,
    Reported,
    Cleared,
    Rejected,
    Failed,
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvoiceStatus::Signed => "signed",
            InvoiceStatus::Queued => "queued",
            InvoiceStatus::Reported => "reported",
            InvoiceStatus::Cleared => "cleared",
            InvoiceStatus::Rejected => "rejected",
            InvoiceStatus::Failed => "failed",
        };
        write!(f, "{}", text)
    }
}

/// A chained, signed invoice. Everything except `status` and the cleared
/// document is fixed at issue time; corrections are new invoices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub icv: u64,
    pub pih: InvoiceHash,
    pub content_hash: InvoiceHash,
    pub canonical: CanonicalInvoice,
    pub signature: SignatureBundle,
    pub qr_payload: String,
    pub status: InvoiceStatus,
    /// Authority-stamped UBL (base64) once a standard invoice is cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleared_xml: Option<String>,
}

impl Invoice {
    pub fn uuid(&self) -> Uuid {
        self.canonical.uuid
    }

    pub fn kind(&self) -> InvoiceKind {
        self.canonical.kind
    }

    pub fn totals(&self) -> &InvoiceTotals {
        &self.canonical.totals
    }
}

pub fn invoice_number(icv: u64) -> String {
    format!("INV-{:06}", icv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_hash_matches_published_constant() {
        let genesis = InvoiceHash::genesis();

        assert_eq!(
            genesis.to_hex(),
            "5feceb66ffc86f38d952786c6d696c79c2dbc239dd4e91b46729d73a27fb57e9"
        );
        assert_eq!(
            genesis.to_pih_text(),
            "NWZlY2ViNjZmZmM4NmYzOGQ5NTI3ODZjNmQ2OTZjNzljMmRiYzIzOWRkNGU5MWI0NjcyOWQ3M2EyN2ZiNTdlOQ=="
        );
    }

    #[test]
    fn hash_serializes_as_hex() {
        let hash = InvoiceHash::digest(b"invoice");
        let json = serde_json::to_string(&hash).unwrap();

        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        assert_eq!(serde_json::from_str::<InvoiceHash>(&json).unwrap(), hash);
        assert!(serde_json::from_str::<InvoiceHash>("\"abcd\"").is_err());
    }

    #[test]
    fn invoice_numbers_are_zero_padded() {
        assert_eq!(invoice_number(1), "INV-000001");
        assert_eq!(invoice_number(1234567), "INV-1234567");
    }
}
