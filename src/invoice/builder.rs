use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::core::config::is_vat_number;
use crate::core::error::{ComplianceError, ComplianceResult};
use crate::core::money::money;
use crate::models::{
    Buyer, CanonicalInvoice, InvoiceInput, InvoiceKind, InvoiceLine, InvoiceTotals, LineItemInput,
    Seller,
};

/// Turns raw input into a `CanonicalInvoice`. Pure: no chain state, no keys.
///
/// ```ignore
/// let invoice = InvoiceBuilder::new().issued_at(now).build(input)?;
/// ```
#[derive(Debug, Default)]
pub struct InvoiceBuilder {
    issued_at: Option<DateTime<Utc>>,
    uuid: Option<Uuid>,
}

impl InvoiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = Some(issued_at);
        self
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn build(self, input: InvoiceInput) -> ComplianceResult<CanonicalInvoice> {
        let currency = input.currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(ComplianceError::validation(
                "currency",
                format!("expected a 3-letter ISO 4217 code, got `{}`", input.currency),
            ));
        }

        let seller = normalize_seller(input.seller)?;
        let buyer = input.buyer.map(normalize_buyer).transpose()?;

        if input.kind == InvoiceKind::Standard {
            match &buyer {
                None => {
                    return Err(ComplianceError::validation(
                        "buyer",
                        "standard invoices require a buyer",
                    ))
                }
                Some(b) if b.vat_number.is_none() => {
                    return Err(ComplianceError::validation(
                        "buyer.vat_number",
                        "standard invoices require the buyer VAT number",
                    ))
                }
                Some(_) => {}
            }
        }

        if input.items.is_empty() {
            return Err(ComplianceError::validation("items", "at least one line item is required"));
        }

        let lines = input
            .items
            .into_iter()
            .enumerate()
            .map(|(index, item)| build_line(index, item))
            .collect::<ComplianceResult<Vec<_>>>()?;

        let totals = compute_totals(&lines)?;
        let issued_at = self.issued_at.unwrap_or_else(Utc::now).trunc_subsecs(0);

        Ok(CanonicalInvoice {
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            kind: input.kind,
            issued_at,
            currency,
            seller,
            buyer,
            lines,
            totals,
        })
    }
}

fn normalize_seller(seller: Seller) -> ComplianceResult<Seller> {
    let name = seller.name.trim().to_string();
    if name.is_empty() {
        return Err(ComplianceError::validation("seller.name", "must not be empty"));
    }
    let vat_number = seller.vat_number.trim().to_string();
    if !is_vat_number(&vat_number) {
        return Err(ComplianceError::validation("seller.vat_number", "must be 15 digits"));
    }

    Ok(Seller {
        name,
        vat_number,
        registration_number: seller.registration_number.map(|r| r.trim().to_string()),
        address: seller.address,
    })
}

fn normalize_buyer(buyer: Buyer) -> ComplianceResult<Buyer> {
    let name = buyer.name.trim().to_string();
    if name.is_empty() {
        return Err(ComplianceError::validation("buyer.name", "must not be empty"));
    }
    let vat_number = buyer
        .vat_number
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    if let Some(vat) = &vat_number {
        if !is_vat_number(vat) {
            return Err(ComplianceError::validation("buyer.vat_number", "must be 15 digits"));
        }
    }

    Ok(Buyer {
        name,
        vat_number,
        address: buyer.address,
    })
}

fn build_line(index: usize, item: LineItemInput) -> ComplianceResult<InvoiceLine> {
    let field = |name: &str| format!("items[{}].{}", index, name);

    let description = item.description.trim().to_string();
    if description.is_empty() {
        return Err(ComplianceError::validation(field("description"), "must not be empty"));
    }
    if item.quantity <= Decimal::ZERO {
        return Err(ComplianceError::validation(field("quantity"), "must be greater than zero"));
    }
    if item.unit_price < Decimal::ZERO {
        return Err(ComplianceError::validation(field("unit_price"), "must not be negative"));
    }
    if item.vat_rate < Decimal::ZERO || item.vat_rate > Decimal::ONE {
        return Err(ComplianceError::validation(field("vat_rate"), "must be within [0, 1]"));
    }

    let net_amount = item
        .quantity
        .checked_mul(item.unit_price)
        .map(money)
        .ok_or_else(|| ComplianceError::validation(field("unit_price"), "line amount overflows"))?;
    let vat_amount = net_amount
        .checked_mul(item.vat_rate)
        .map(money)
        .ok_or_else(|| ComplianceError::validation(field("vat_rate"), "VAT amount overflows"))?;

    Ok(InvoiceLine {
        line_number: index as u32 + 1,
        description,
        quantity: item.quantity.normalize(),
        unit_price: item.unit_price.normalize(),
        vat_rate: item.vat_rate.normalize(),
        net_amount,
        vat_amount,
    })
}

fn compute_totals(lines: &[InvoiceLine]) -> ComplianceResult<InvoiceTotals> {
    let overflow = || ComplianceError::validation("items", "invoice total overflows");

    let mut subtotal = Decimal::ZERO;
    let mut vat_total = Decimal::ZERO;
    for line in lines {
        subtotal = subtotal.checked_add(line.net_amount).ok_or_else(overflow)?;
        vat_total = vat_total.checked_add(line.vat_amount).ok_or_else(overflow)?;
    }
    let grand_total = subtotal.checked_add(vat_total).ok_or_else(overflow)?;

    Ok(InvoiceTotals {
        subtotal: money(subtotal),
        vat_total: money(vat_total),
        grand_total: money(grand_total),
    })
}
