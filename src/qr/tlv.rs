//! TLV framing for the invoice QR code: `tag (1 byte) | length (1 byte) | value`,
//! tags ascending, whole stream base64-encoded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::core::error::{ComplianceError, ComplianceResult};
use crate::core::money::format_money;
use crate::crypto::SignatureBundle;
use crate::models::{CanonicalInvoice, InvoiceHash, InvoiceKind};

pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QrTag {
    SellerName = 1,
    VatNumber = 2,
    Timestamp = 3,
    InvoiceTotal = 4,
    VatTotal = 5,
    InvoiceHash = 6,
    Signature = 7,
    PublicKey = 8,
    CertificateSignature = 9,
}

impl QrTag {
    pub const ALL: [QrTag; 9] = [
        QrTag::SellerName,
        QrTag::VatNumber,
        QrTag::Timestamp,
        QrTag::InvoiceTotal,
        QrTag::VatTotal,
        QrTag::InvoiceHash,
        QrTag::Signature,
        QrTag::PublicKey,
        QrTag::CertificateSignature,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(usize::from(byte).checked_sub(1)?).copied()
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Tags a complete payload for `kind` must carry.
    pub fn required_for(kind: InvoiceKind) -> &'static [QrTag] {
        match kind {
            InvoiceKind::Simplified => &Self::ALL,
            InvoiceKind::Standard => &Self::ALL[..8],
        }
    }
}

/// Ordered tag map of a QR payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QrPayload {
    fields: BTreeMap<QrTag, Vec<u8>>,
}

impl QrPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one tag. Values longer than 255 bytes cannot be framed.
    pub fn insert(&mut self, tag: QrTag, value: impl Into<Vec<u8>>) -> ComplianceResult<()> {
        let value = value.into();
        if value.len() > MAX_VALUE_LEN {
            return Err(ComplianceError::validation(
                format!("qr.tag{}", tag.as_byte()),
                format!("value is {} bytes, limit is {}", value.len(), MAX_VALUE_LEN),
            ));
        }
        self.fields.insert(tag, value);
        Ok(())
    }

    pub fn get(&self, tag: QrTag) -> Option<&[u8]> {
        self.fields.get(&tag).map(Vec::as_slice)
    }

    pub fn get_str(&self, tag: QrTag) -> ComplianceResult<Option<&str>> {
        self.get(tag)
            .map(|bytes| {
                std::str::from_utf8(bytes).map_err(|_| {
                    ComplianceError::MalformedPayload(format!("tag {} is not UTF-8", tag.as_byte()))
                })
            })
            .transpose()
    }

    pub fn tags(&self) -> impl Iterator<Item = QrTag> + '_ {
        self.fields.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.fields.values().map(|v| v.len() + 2).sum());
        for (tag, value) in &self.fields {
            out.push(tag.as_byte());
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        }
        out
    }

    pub fn from_bytes(mut input: &[u8]) -> ComplianceResult<Self> {
        let mut payload = QrPayload::new();

        while let Some((&tag_byte, rest)) = input.split_first() {
            let tag = QrTag::from_byte(tag_byte)
                .ok_or_else(|| ComplianceError::MalformedPayload(format!("unknown tag {}", tag_byte)))?;
            let (&len, rest) = rest.split_first().ok_or_else(|| {
                ComplianceError::MalformedPayload(format!("tag {} has no length byte", tag_byte))
            })?;
            let len = usize::from(len);
            if rest.len() < len {
                return Err(ComplianceError::MalformedPayload(format!(
                    "tag {} declares {} bytes but only {} remain",
                    tag_byte,
                    len,
                    rest.len()
                )));
            }
            if payload.fields.contains_key(&tag) {
                return Err(ComplianceError::MalformedPayload(format!("duplicate tag {}", tag_byte)));
            }

            payload.fields.insert(tag, rest[..len].to_vec());
            input = &rest[len..];
        }

        Ok(payload)
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn decode(text: &str) -> ComplianceResult<Self> {
        let bytes = STANDARD
            .decode(text.trim().as_bytes())
            .map_err(|e| ComplianceError::MalformedPayload(format!("invalid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Builds the payload for a signed invoice.
    pub fn for_invoice(
        invoice: &CanonicalInvoice,
        content_hash: &InvoiceHash,
        signature: &SignatureBundle,
    ) -> ComplianceResult<Self> {
        let mut payload = QrPayload::new();
        payload.insert(QrTag::SellerName, invoice.seller.name.as_bytes())?;
        payload.insert(QrTag::VatNumber, invoice.seller.vat_number.as_bytes())?;
        payload.insert(QrTag::Timestamp, invoice.timestamp().into_bytes())?;
        payload.insert(QrTag::InvoiceTotal, format_money(invoice.totals.grand_total).into_bytes())?;
        payload.insert(QrTag::VatTotal, format_money(invoice.totals.vat_total).into_bytes())?;
        payload.insert(QrTag::InvoiceHash, content_hash.as_bytes().to_vec())?;
        payload.insert(QrTag::Signature, signature.signature.clone())?;
        payload.insert(QrTag::PublicKey, signature.public_key.clone())?;
        if let Some(certificate_signature) = &signature.certificate_signature {
            payload.insert(QrTag::CertificateSignature, certificate_signature.clone())?;
        }
        Ok(payload)
    }

    pub fn missing_tags(&self, kind: InvoiceKind) -> Vec<QrTag> {
        QrTag::required_for(kind)
            .iter()
            .copied()
            .filter(|tag| !self.fields.contains_key(tag))
            .collect()
    }

    /// Completeness check, kept apart from encoding.
    pub fn validate(&self, kind: InvoiceKind) -> ComplianceResult<()> {
        let missing = self.missing_tags(kind);
        if missing.is_empty() {
            return Ok(());
        }
        let list = missing
            .iter()
            .map(|t| t.as_byte().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ComplianceError::validation(
            "qr",
            format!("{} invoice payload is missing tags {}", kind, list),
        ))
    }

    /// Typed view of the human-readable tags.
    pub fn summary(&self) -> ComplianceResult<QrSummary> {
        let required = |tag: QrTag| -> ComplianceResult<String> {
            self.get_str(tag)?.map(str::to_string).ok_or_else(|| {
                ComplianceError::MalformedPayload(format!("tag {} is missing", tag.as_byte()))
            })
        };
        let amount = |tag: QrTag| -> ComplianceResult<Decimal> {
            let text = required(tag)?;
            Decimal::from_str(&text).map_err(|_| {
                ComplianceError::MalformedPayload(format!("tag {} is not an amount: `{}`", tag.as_byte(), text))
            })
        };

        Ok(QrSummary {
            seller_name: required(QrTag::SellerName)?,
            vat_number: required(QrTag::VatNumber)?,
            timestamp: required(QrTag::Timestamp)?,
            invoice_total: amount(QrTag::InvoiceTotal)?,
            vat_total: amount(QrTag::VatTotal)?,
            invoice_hash: self.get(QrTag::InvoiceHash).and_then(InvoiceHash::from_slice),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrSummary {
    pub seller_name: String,
    pub vat_number: String,
    pub timestamp: String,
    pub invoice_total: Decimal,
    pub vat_total: Decimal,
    pub invoice_hash: Option<InvoiceHash>,
}
