use actix_web::middleware::{Compress, Condition};

pub type Compression = Condition<Compress>;

/// Gzip/brotli for JSON exports; PNGs pass through the encoder unchanged.
pub fn create_compression_middleware(enabled: bool) -> Compression {
    Condition::new(enabled, Compress::default())
}
