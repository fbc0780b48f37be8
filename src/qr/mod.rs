pub mod render;
pub mod tlv;

pub use render::render_png;
pub use tlv::{QrPayload, QrSummary, QrTag};
