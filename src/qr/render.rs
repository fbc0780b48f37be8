use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
use qrcode::{Color, QrCode};
use std::io::Cursor;

use crate::core::error::{ComplianceError, ComplianceResult};

const MODULE_SCALE: usize = 5;
const QUIET_ZONE: usize = 4;

/// Renders the base64 QR payload as a PNG.
pub fn render_png(payload: &str) -> ComplianceResult<Vec<u8>> {
    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| ComplianceError::validation("qr_payload", format!("cannot build QR code: {}", e)))?;
    let width = code.width();
    let img_size = (width + 2 * QUIET_ZONE) * MODULE_SCALE;

    let mut image = ImageBuffer::from_pixel(img_size as u32, img_size as u32, Rgb([255u8, 255, 255]));

    for y in 0..width {
        for x in 0..width {
            if let Color::Light = code[(x, y)] {
                continue;
            }
            for dy in 0..MODULE_SCALE {
                for dx in 0..MODULE_SCALE {
                    let px = ((x + QUIET_ZONE) * MODULE_SCALE + dx) as u32;
                    let py = ((y + QUIET_ZONE) * MODULE_SCALE + dy) as u32;
                    image.put_pixel(px, py, Rgb([0, 0, 0]));
                }
            }
        }
    }

    let mut png = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
        .map_err(|e| ComplianceError::Storage(format!("cannot encode PNG: {}", e)))?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_png_bytes() {
        let png = render_png("AQxGaXJveiBBc2hyYWYCCjEyMzQ1Njc4OTE=").unwrap();

        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn oversized_payload_is_refused() {
        let payload = "A".repeat(8000);
        assert!(matches!(render_png(&payload), Err(ComplianceError::Validation { .. })));
    }
}
