pub mod builder;
pub mod chain;
pub mod ubl;

pub use builder::InvoiceBuilder;
pub use chain::{
    canonical_bytes, chain_id, content_hash, verify_chain, ChainLink, ChainReservation, ChainTail,
    HashChain,
};
pub use ubl::{render_ubl, ubl_base64};
