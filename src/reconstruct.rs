use image::RgbaImage;
use thiserror::Error;

/// Decoded textures are RGBA with 8 bits per channel.
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconstructError {
    #[error("Decoded data holds {actual} bytes but a {width}x{height} image needs {expected}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("Image dimensions {width}x{height} are too large")]
    TooLarge { width: u32, height: u32 },
}

/// Builds a top-down image from decoded texture data.
///
/// Texture rows are stored bottom-up, `4 * width` bytes each. The color channels are already
/// premultiplied and are passed through as they are. Bytes beyond the last row are ignored.
pub fn reconstruct(data: &[u8], width: u32, height: u32) -> Result<RgbaImage, ReconstructError> {
    let too_large = || ReconstructError::TooLarge { width, height };

    let row_len = usize::try_from(width)
        .ok()
        .and_then(|width| width.checked_mul(BYTES_PER_PIXEL))
        .ok_or_else(too_large)?;
    let rows = usize::try_from(height).map_err(|_| too_large())?;
    let expected = row_len.checked_mul(rows).ok_or_else(too_large)?;

    if data.len() < expected {
        return Err(ReconstructError::SizeMismatch {
            width,
            height,
            expected,
            actual: data.len(),
        });
    }

    let mut pixels = Vec::with_capacity(expected);
    if row_len > 0 {
        for row in data[..expected].chunks_exact(row_len).rev() {
            pixels.extend_from_slice(row);
        }
    }

    RgbaImage::from_raw(width, height, pixels).ok_or_else(too_large)
}

/// Converts premultiplied pixels to straight alpha, which is what PNG stores.
pub fn unpremultiply(image: &mut RgbaImage) {
    for pixel in image.pixels_mut() {
        let [r, g, b, a] = pixel.0;
        if a == 0 || a == u8::MAX {
            continue;
        }

        let alpha = u16::from(a);
        let scale = |channel: u8| {
            let straight = (u16::from(channel) * 255 + alpha / 2) / alpha;
            straight.min(255) as u8
        };

        pixel.0 = [scale(r), scale(g), scale(b), a];
    }
}
