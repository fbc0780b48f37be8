//! Hash chain over issued invoices.
//!
//! Every invoice carries its counter value (ICV) and the content hash of its
//! predecessor (PIH). The chain tail is single-writer: an append takes a
//! [`ChainReservation`] and the tail only moves when the caller commits it,
//! which it does after the invoice is durably stored. Dropping a reservation
//! leaves the tail untouched.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::core::error::{ComplianceError, ComplianceResult};
use crate::models::{
    Buyer, CanonicalInvoice, Invoice, InvoiceHash, InvoiceKind, InvoiceLine, InvoiceTotals, Seller,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTail {
    pub icv: u64,
    pub last_hash: InvoiceHash,
}

impl ChainTail {
    pub fn genesis() -> Self {
        ChainTail {
            icv: 0,
            last_hash: InvoiceHash::genesis(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.icv == 0
    }
}

/// Chain position assigned to one invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    pub icv: u64,
    pub pih: InvoiceHash,
    pub content_hash: InvoiceHash,
}

#[derive(Debug)]
struct ChainState {
    tail: ChainTail,
    halted: Option<String>,
}

/// Tail state of one seller's chain.
#[derive(Debug, Clone)]
pub struct HashChain {
    chain_id: String,
    state: Arc<Mutex<ChainState>>,
}

impl HashChain {
    pub fn new(chain_id: impl Into<String>, tail: ChainTail) -> Self {
        HashChain {
            chain_id: chain_id.into(),
            state: Arc::new(Mutex::new(ChainState { tail, halted: None })),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Waits for any in-flight append before reading.
    pub async fn tail(&self) -> ChainTail {
        self.state.lock().await.tail
    }

    pub async fn halted(&self) -> Option<String> {
        self.state.lock().await.halted.clone()
    }

    /// Stops issuance until an operator calls [`HashChain::resume`].
    pub async fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(chain_id = %self.chain_id, %reason, "Hash chain halted");
        self.state.lock().await.halted = Some(reason);
    }

    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        if state.halted.take().is_some() {
            tracing::warn!(chain_id = %self.chain_id, icv = state.tail.icv, "Hash chain resumed by operator");
        }
    }

    /// Reserves the next link, failing if another append is unresolved.
    pub fn reserve(&self, invoice: &CanonicalInvoice) -> ComplianceResult<ChainReservation> {
        let guard = self.state.clone().try_lock_owned().map_err(|_| {
            ComplianceError::ChainIntegrity(format!(
                "append to chain {} while a previous append is unresolved",
                self.chain_id
            ))
        })?;
        ChainReservation::open(guard, &self.chain_id, invoice)
    }

    /// Like [`HashChain::reserve`] but queues behind the current writer.
    pub async fn reserve_wait(&self, invoice: &CanonicalInvoice) -> ComplianceResult<ChainReservation> {
        let guard = self.state.clone().lock_owned().await;
        ChainReservation::open(guard, &self.chain_id, invoice)
    }
}

/// Exclusive hold on the chain tail for one append.
pub struct ChainReservation {
    guard: OwnedMutexGuard<ChainState>,
    link: ChainLink,
}

impl ChainReservation {
    fn open(
        guard: OwnedMutexGuard<ChainState>,
        chain_id: &str,
        invoice: &CanonicalInvoice,
    ) -> ComplianceResult<Self> {
        if let Some(reason) = &guard.halted {
            return Err(ComplianceError::ChainIntegrity(format!(
                "chain {} is halted: {}",
                chain_id, reason
            )));
        }

        let icv = guard.tail.icv.checked_add(1).ok_or_else(|| {
            ComplianceError::ChainIntegrity(format!("chain {} counter exhausted", chain_id))
        })?;
        let pih = guard.tail.last_hash;
        let content_hash = content_hash(invoice, icv, &pih)?;

        Ok(ChainReservation {
            guard,
            link: ChainLink {
                icv,
                pih,
                content_hash,
            },
        })
    }

    pub fn link(&self) -> ChainLink {
        self.link
    }

    /// Advances the tail. Call only once the invoice is durably recorded.
    pub fn commit(mut self) -> ChainTail {
        self.guard.tail = ChainTail {
            icv: self.link.icv,
            last_hash: self.link.content_hash,
        };
        self.guard.tail
    }

    /// Abandons the append and halts the chain, e.g. when the store already
    /// holds this ICV from another writer.
    pub fn halt(mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(icv = self.link.icv, %reason, "Hash chain halted");
        self.guard.halted = Some(reason);
    }
}

#[derive(Serialize)]
struct HashedInvoice<'a> {
    uuid: &'a Uuid,
    icv: u64,
    kind: InvoiceKind,
    issued_at: &'a chrono::DateTime<chrono::Utc>,
    currency: &'a str,
    seller: &'a Seller,
    buyer: &'a Option<Buyer>,
    lines: &'a [InvoiceLine],
    totals: &'a InvoiceTotals,
}

/// Deterministic byte form of an invoice without QR or signature.
pub fn canonical_bytes(invoice: &CanonicalInvoice, icv: u64) -> ComplianceResult<Vec<u8>> {
    let view = HashedInvoice {
        uuid: &invoice.uuid,
        icv,
        kind: invoice.kind,
        issued_at: &invoice.issued_at,
        currency: &invoice.currency,
        seller: &invoice.seller,
        buyer: &invoice.buyer,
        lines: &invoice.lines,
        totals: &invoice.totals,
    };
    Ok(serde_json::to_vec(&view)?)
}

/// SHA-256 over the canonical bytes followed by the PIH.
pub fn content_hash(invoice: &CanonicalInvoice, icv: u64, pih: &InvoiceHash) -> ComplianceResult<InvoiceHash> {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(invoice, icv)?);
    hasher.update(pih.as_bytes());
    Ok(InvoiceHash::from_bytes(hasher.finalize().into()))
}

/// Identifies a chain by seller and signing key, so a new key never
/// continues another key's counter.
pub fn chain_id(vat_number: &str, public_key_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vat_number.as_bytes());
    hasher.update(public_key_der);
    hex::encode(hasher.finalize())
}

/// Re-checks stored invoices (ordered by ICV) and returns the tail they imply.
pub fn verify_chain(invoices: &[Invoice]) -> ComplianceResult<ChainTail> {
    let mut tail = ChainTail::genesis();

    for invoice in invoices {
        let expected_icv = tail.icv + 1;
        if invoice.icv != expected_icv {
            return Err(ComplianceError::ChainIntegrity(format!(
                "expected ICV {} but found {} ({})",
                expected_icv,
                invoice.icv,
                invoice.uuid()
            )));
        }
        if invoice.pih != tail.last_hash {
            return Err(ComplianceError::ChainIntegrity(format!(
                "invoice ICV {} does not link to its predecessor",
                invoice.icv
            )));
        }
        let recomputed = content_hash(&invoice.canonical, invoice.icv, &invoice.pih)?;
        if recomputed != invoice.content_hash {
            return Err(ComplianceError::ChainIntegrity(format!(
                "content hash of invoice ICV {} does not match its contents",
                invoice.icv
            )));
        }

        tail = ChainTail {
            icv: invoice.icv,
            last_hash: invoice.content_hash,
        };
    }

    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::InvoiceBuilder;
    use crate::models::{InvoiceInput, LineItemInput};
    use rust_decimal_macros::dec;

    fn canonical() -> CanonicalInvoice {
        InvoiceBuilder::new()
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
                    description: "Coffee".to_string(),
                    quantity: dec!(1),
                    unit_price: dec!(12.50),
                    vat_rate: dec!(0.15),
                }],
                currency: "SAR".to_string(),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn first_link_uses_genesis() {
        let chain = HashChain::new("test", ChainTail::genesis());
        let reservation = chain.reserve(&canonical()).unwrap();
        let link = reservation.link();

        assert_eq!(link.icv, 1);
        assert_eq!(link.pih, InvoiceHash::genesis());

        reservation.commit();
        assert_eq!(chain.tail().await.last_hash, link.content_hash);
    }

    #[tokio::test]
    async fn links_thread_previous_hash() {
        let chain = HashChain::new("test", ChainTail::genesis());
        let mut links = Vec::new();
        for _ in 0..4 {
            let reservation = chain.reserve(&canonical()).unwrap();
            links.push(reservation.link());
            reservation.commit();
        }

        for pair in links.windows(2) {
            assert_eq!(pair[1].icv, pair[0].icv + 1);
            assert_eq!(pair[1].pih, pair[0].content_hash);
        }
    }

    #[tokio::test]
    async fn concurrent_append_is_rejected() {
        let chain = HashChain::new("test", ChainTail::genesis());
        let first = chain.reserve(&canonical()).unwrap();

        let second = chain.reserve(&canonical());
        assert!(matches!(second, Err(ComplianceError::ChainIntegrity(_))));

        first.commit();
        assert!(chain.reserve(&canonical()).is_ok());
    }

    #[tokio::test]
    async fn dropped_reservation_does_not_advance() {
        let chain = HashChain::new("test", ChainTail::genesis());
        {
            let reservation = chain.reserve(&canonical()).unwrap();
            assert_eq!(reservation.link().icv, 1);
        }

        assert_eq!(chain.tail().await, ChainTail::genesis());
        assert_eq!(chain.reserve(&canonical()).unwrap().link().icv, 1);
    }

    #[tokio::test]
    async fn halted_chain_refuses_appends_until_resumed() {
        let chain = HashChain::new("test", ChainTail::genesis());
        chain.halt("stored chain is broken").await;

        assert!(matches!(
            chain.reserve_wait(&canonical()).await,
            Err(ComplianceError::ChainIntegrity(_))
        ));

        chain.resume().await;
        assert!(chain.reserve_wait(&canonical()).await.is_ok());
    }

    #[tokio::test]
    async fn reservation_can_halt_the_chain() {
        let chain = HashChain::new("test", ChainTail::genesis());
        let reservation = chain.reserve_wait(&canonical()).await.unwrap();

        reservation.halt("ICV 1 is already recorded");

        assert_eq!(chain.halted().await.as_deref(), Some("ICV 1 is already recorded"));
        assert_eq!(chain.tail().await, ChainTail::genesis());
        assert!(chain.reserve(&canonical()).is_err());
    }

    #[tokio::test]
    async fn waiting_reservations_serialize() {
        let chain = HashChain::new("test", ChainTail::genesis());
        let invoice = canonical();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let chain = chain.clone();
            let invoice = invoice.clone();
            handles.push(tokio::spawn(async move {
                let reservation = chain.reserve_wait(&invoice).await.unwrap();
                tokio::task::yield_now().await;
                reservation.commit().icv
            }));
        }

        let mut icvs = Vec::new();
        for handle in handles {
            icvs.push(handle.await.unwrap());
        }
        icvs.sort_unstable();

        assert_eq!(icvs, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn content_hash_depends_on_pih_and_icv() {
        let invoice = canonical();
        let genesis = InvoiceHash::genesis();
        let other = InvoiceHash::digest(b"other");

        let base = content_hash(&invoice, 1, &genesis).unwrap();
        assert_eq!(base, content_hash(&invoice, 1, &genesis).unwrap());
        assert_ne!(base, content_hash(&invoice, 2, &genesis).unwrap());
        assert_ne!(base, content_hash(&invoice, 1, &other).unwrap());
    }

    #[test]
    fn chain_id_changes_with_key() {
        assert_ne!(chain_id("300000000000003", b"key-a"), chain_id("300000000000003", b"key-b"));
        assert_eq!(chain_id("300000000000003", b"key-a"), chain_id("300000000000003", b"key-a"));
    }
}
