use serde::{Deserialize, Serialize};
use std::fmt;

use super::queue::Operation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    #[serde(default)]
    pub building_number: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    pub city: String,
    #[serde(default)]
    pub postal_zone: Option<String>,
    #[serde(default = "default_country_code")]
    pub country_code: String,
}

fn default_country_code() -> String {
    "SA".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seller {
    pub name: String,
    pub vat_number: String,
    #[serde(default)]
    pub registration_number: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
}

/// Buyer identity; optional for simplified (B2C) invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buyer {
    pub name: String,
    #[serde(default)]
    pub vat_number: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    /// B2C, reported after issuance.
    #[default]
    Simplified,
    /// B2B, cleared before it is final.
    Standard,
}

impl InvoiceKind {
    pub fn type_code(&self) -> &'static str {
        "388"
    }

    /// Value of the `name` attribute on `InvoiceTypeCode`.
    pub fn subtype(&self) -> &'static str {
        match self {
            InvoiceKind::Simplified => "0200000",
            InvoiceKind::Standard => "0100000",
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            InvoiceKind::Simplified => Operation::Report,
            InvoiceKind::Standard => Operation::Clear,
        }
    }

    /// Simplified invoices embed the certificate signature in the QR code.
    pub fn embeds_certificate_signature(&self) -> bool {
        matches!(self, InvoiceKind::Simplified)
    }
}

impl fmt::Display for InvoiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvoiceKind::Simplified => write!(f, "simplified"),
            InvoiceKind::Standard => write!(f, "standard"),
        }
    }
}
