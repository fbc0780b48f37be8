//! UBL 2.1 rendering of a signed invoice. This is the document body sent to
//! the authority for reporting and clearance.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::core::money::format_money;
use crate::models::{invoice_number, Address, Invoice, InvoiceKind};

const NS_INVOICE: &str = "urn:oasis:names:specification:ubl:schema:xsd:Invoice-2";
const NS_CAC: &str = "urn:oasis:names:specification:ubl:schema:xsd:CommonAggregateComponents-2";
const NS_CBC: &str = "urn:oasis:names:specification:ubl:schema:xsd:CommonBasicComponents-2";
const NS_EXT: &str = "urn:oasis:names:specification:ubl:schema:xsd:CommonExtensionComponents-2";

struct XmlWriter {
    out: String,
    depth: usize,
}

impl XmlWriter {
    fn new() -> Self {
        XmlWriter {
            out: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"),
            depth: 0,
        }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
    }

    fn open(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.indent();
        self.out.push('<');
        self.out.push_str(tag);
        for (name, value) in attrs {
            self.out.push_str(&format!(" {}=\"{}\"", name, escape(value)));
        }
        self.out.push_str(">\n");
        self.depth += 1;
    }

    fn close(&mut self, tag: &str) {
        self.depth -= 1;
        self.indent();
        self.out.push_str(&format!("</{}>\n", tag));
    }

    fn leaf(&mut self, tag: &str, attrs: &[(&str, &str)], text: &str) {
        self.indent();
        self.out.push('<');
        self.out.push_str(tag);
        for (name, value) in attrs {
            self.out.push_str(&format!(" {}=\"{}\"", name, escape(value)));
        }
        self.out.push_str(&format!(">{}</{}>\n", escape(text), tag));
    }

    fn finish(self) -> String {
        self.out
    }
}

pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

pub fn render_ubl(invoice: &Invoice) -> String {
    let canonical = &invoice.canonical;
    let currency = canonical.currency.as_str();
    let mut xml = XmlWriter::new();

    xml.open(
        "Invoice",
        &[
            ("xmlns", NS_INVOICE),
            ("xmlns:cac", NS_CAC),
            ("xmlns:cbc", NS_CBC),
            ("xmlns:ext", NS_EXT),
        ],
    );

    write_signature_extension(&mut xml, invoice);

    let profile = match canonical.kind {
        InvoiceKind::Simplified => "reporting:1.0",
        InvoiceKind::Standard => "clearance:1.0",
    };
    xml.leaf("cbc:UBLVersionID", &[], "2.1");
    xml.leaf("cbc:ProfileID", &[], profile);
    xml.leaf("cbc:ID", &[], &invoice_number(invoice.icv));
    xml.leaf("cbc:UUID", &[], &canonical.uuid.to_string());
    xml.leaf("cbc:IssueDate", &[], &canonical.issued_at.format("%Y-%m-%d").to_string());
    xml.leaf("cbc:IssueTime", &[], &canonical.issued_at.format("%H:%M:%S").to_string());
    xml.leaf(
        "cbc:InvoiceTypeCode",
        &[("name", canonical.kind.subtype())],
        canonical.kind.type_code(),
    );
    xml.leaf("cbc:DocumentCurrencyCode", &[], currency);
    xml.leaf("cbc:TaxCurrencyCode", &[], currency);

    xml.open("cac:AdditionalDocumentReference", &[]);
    xml.leaf("cbc:ID", &[], "ICV");
    xml.leaf("cbc:UUID", &[], &invoice.icv.to_string());
    xml.close("cac:AdditionalDocumentReference");

    xml.open("cac:AdditionalDocumentReference", &[]);
    xml.leaf("cbc:ID", &[], "PIH");
    xml.open("cac:Attachment", &[]);
    xml.leaf(
        "cbc:EmbeddedDocumentBinaryObject",
        &[("mimeCode", "text/plain")],
        &invoice.pih.to_pih_text(),
    );
    xml.close("cac:Attachment");
    xml.close("cac:AdditionalDocumentReference");

    xml.open("cac:AdditionalDocumentReference", &[]);
    xml.leaf("cbc:ID", &[], "QR");
    xml.open("cac:Attachment", &[]);
    xml.leaf(
        "cbc:EmbeddedDocumentBinaryObject",
        &[("mimeCode", "text/plain")],
        &invoice.qr_payload,
    );
    xml.close("cac:Attachment");
    xml.close("cac:AdditionalDocumentReference");

    let seller = &canonical.seller;
    xml.open("cac:AccountingSupplierParty", &[]);
    xml.open("cac:Party", &[]);
    if let Some(registration) = &seller.registration_number {
        xml.open("cac:PartyIdentification", &[]);
        xml.leaf("cbc:ID", &[("schemeID", "CRN")], registration);
        xml.close("cac:PartyIdentification");
    }
    if let Some(address) = &seller.address {
        write_address(&mut xml, address);
    }
    write_tax_scheme(&mut xml, &seller.vat_number);
    xml.open("cac:PartyLegalEntity", &[]);
    xml.leaf("cbc:RegistrationName", &[], &seller.name);
    xml.close("cac:PartyLegalEntity");
    xml.close("cac:Party");
    xml.close("cac:AccountingSupplierParty");

    if let Some(buyer) = &canonical.buyer {
        xml.open("cac:AccountingCustomerParty", &[]);
        xml.open("cac:Party", &[]);
        if let Some(address) = &buyer.address {
            write_address(&mut xml, address);
        }
        if let Some(vat) = &buyer.vat_number {
            write_tax_scheme(&mut xml, vat);
        }
        xml.open("cac:PartyLegalEntity", &[]);
        xml.leaf("cbc:RegistrationName", &[], &buyer.name);
        xml.close("cac:PartyLegalEntity");
        xml.close("cac:Party");
        xml.close("cac:AccountingCustomerParty");
    }

    let issue_date = canonical.issued_at.format("%Y-%m-%d").to_string();
    xml.open("cac:Delivery", &[]);
    xml.leaf("cbc:ActualDeliveryDate", &[], &issue_date);
    xml.close("cac:Delivery");

    // Subtotals per VAT rate
    let mut by_rate: BTreeMap<Decimal, (Decimal, Decimal)> = BTreeMap::new();
    for line in &canonical.lines {
        let entry = by_rate.entry(line.vat_rate).or_default();
        entry.0 += line.net_amount;
        entry.1 += line.vat_amount;
    }

    let amount_attr = [("currencyID", currency)];
    xml.open("cac:TaxTotal", &[]);
    xml.leaf("cbc:TaxAmount", &amount_attr, &format_money(canonical.totals.vat_total));
    for (rate, (taxable, tax)) in &by_rate {
        xml.open("cac:TaxSubtotal", &[]);
        xml.leaf("cbc:TaxableAmount", &amount_attr, &format_money(*taxable));
        xml.leaf("cbc:TaxAmount", &amount_attr, &format_money(*tax));
        write_tax_category(&mut xml, *rate);
        xml.close("cac:TaxSubtotal");
    }
    xml.close("cac:TaxTotal");

    xml.open("cac:LegalMonetaryTotal", &[]);
    xml.leaf("cbc:LineExtensionAmount", &amount_attr, &format_money(canonical.totals.subtotal));
    xml.leaf("cbc:TaxExclusiveAmount", &amount_attr, &format_money(canonical.totals.subtotal));
    xml.leaf("cbc:TaxInclusiveAmount", &amount_attr, &format_money(canonical.totals.grand_total));
    xml.leaf("cbc:PayableAmount", &amount_attr, &format_money(canonical.totals.grand_total));
    xml.close("cac:LegalMonetaryTotal");

    for line in &canonical.lines {
        xml.open("cac:InvoiceLine", &[]);
        xml.leaf("cbc:ID", &[], &line.line_number.to_string());
        xml.leaf("cbc:InvoicedQuantity", &[("unitCode", "PCE")], &line.quantity.to_string());
        xml.leaf("cbc:LineExtensionAmount", &amount_attr, &format_money(line.net_amount));
        xml.open("cac:TaxTotal", &[]);
        xml.leaf("cbc:TaxAmount", &amount_attr, &format_money(line.vat_amount));
        xml.leaf(
            "cbc:RoundingAmount",
            &amount_attr,
            &format_money(line.net_amount + line.vat_amount),
        );
        xml.close("cac:TaxTotal");
        xml.open("cac:Item", &[]);
        xml.leaf("cbc:Name", &[], &line.description);
        xml.open("cac:ClassifiedTaxCategory", &[]);
        xml.leaf("cbc:ID", &[], tax_category_code(line.vat_rate));
        xml.leaf("cbc:Percent", &[], &percent(line.vat_rate));
        xml.open("cac:TaxScheme", &[]);
        xml.leaf("cbc:ID", &[], "VAT");
        xml.close("cac:TaxScheme");
        xml.close("cac:ClassifiedTaxCategory");
        xml.close("cac:Item");
        xml.open("cac:Price", &[]);
        xml.leaf("cbc:PriceAmount", &amount_attr, &line.unit_price.to_string());
        xml.close("cac:Price");
        xml.close("cac:InvoiceLine");
    }

    xml.close("Invoice");
    xml.finish()
}

/// Base64 of the UBL document, as carried in submission requests.
pub fn ubl_base64(invoice: &Invoice) -> String {
    STANDARD.encode(render_ubl(invoice))
}

fn write_signature_extension(xml: &mut XmlWriter, invoice: &Invoice) {
    xml.open("ext:UBLExtensions", &[]);
    xml.open("ext:UBLExtension", &[]);
    xml.leaf(
        "ext:ExtensionURI",
        &[],
        "urn:oasis:names:specification:ubl:dsig:enveloped:xades",
    );
    xml.open("ext:ExtensionContent", &[]);
    xml.open(
        "ds:Signature",
        &[("xmlns:ds", "http://www.w3.org/2000/09/xmldsig#"), ("Id", "signature")],
    );
    xml.open("ds:SignedInfo", &[]);
    xml.leaf(
        "ds:SignatureMethod",
        &[("Algorithm", "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256")],
        "",
    );
    xml.open("ds:Reference", &[("Id", "invoiceSignedData"), ("URI", "")]);
    xml.leaf(
        "ds:DigestMethod",
        &[("Algorithm", "http://www.w3.org/2001/04/xmlenc#sha256")],
        "",
    );
    xml.leaf("ds:DigestValue", &[], &STANDARD.encode(invoice.content_hash.as_bytes()));
    xml.close("ds:Reference");
    xml.close("ds:SignedInfo");
    xml.leaf("ds:SignatureValue", &[], &STANDARD.encode(&invoice.signature.signature));
    xml.open("ds:KeyInfo", &[]);
    xml.leaf("ds:KeyValue", &[], &STANDARD.encode(&invoice.signature.public_key));
    xml.close("ds:KeyInfo");
    xml.close("ds:Signature");
    xml.close("ext:ExtensionContent");
    xml.close("ext:UBLExtension");
    xml.close("ext:UBLExtensions");
}

fn write_address(xml: &mut XmlWriter, address: &Address) {
    xml.open("cac:PostalAddress", &[]);
    xml.leaf("cbc:StreetName", &[], &address.street);
    if let Some(building) = &address.building_number {
        xml.leaf("cbc:BuildingNumber", &[], building);
    }
    if let Some(district) = &address.district {
        xml.leaf("cbc:CitySubdivisionName", &[], district);
    }
    xml.leaf("cbc:CityName", &[], &address.city);
    if let Some(postal) = &address.postal_zone {
        xml.leaf("cbc:PostalZone", &[], postal);
    }
    xml.open("cac:Country", &[]);
    xml.leaf("cbc:IdentificationCode", &[], &address.country_code);
    xml.close("cac:Country");
    xml.close("cac:PostalAddress");
}

fn write_tax_scheme(xml: &mut XmlWriter, vat_number: &str) {
    xml.open("cac:PartyTaxScheme", &[]);
    xml.leaf("cbc:CompanyID", &[], vat_number);
    xml.open("cac:TaxScheme", &[]);
    xml.leaf("cbc:ID", &[], "VAT");
    xml.close("cac:TaxScheme");
    xml.close("cac:PartyTaxScheme");
}

fn write_tax_category(xml: &mut XmlWriter, rate: Decimal) {
    xml.open("cac:TaxCategory", &[]);
    xml.leaf("cbc:ID", &[], tax_category_code(rate));
    xml.leaf("cbc:Percent", &[], &percent(rate));
    xml.open("cac:TaxScheme", &[]);
    xml.leaf("cbc:ID", &[], "VAT");
    xml.close("cac:TaxScheme");
    xml.close("cac:TaxCategory");
}

fn tax_category_code(rate: Decimal) -> &'static str {
    if rate.is_zero() {
        "Z"
    } else {
        "S"
    }
}

fn percent(rate: Decimal) -> String {
    format_money(rate * Decimal::ONE_HUNDRED)
}
