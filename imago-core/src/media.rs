//! Pure image operations: header-only probing, derivative rendering, and
//! data-URL encoding. Everything here is synchronous CPU/IO work; callers
//! run it on blocking threads.

use std::io::Cursor;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader};

use imago_model::ImageFormatTag;

use crate::error::{ImagoError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbedImage {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormatTag,
}

fn tag_for(format: ImageFormat) -> Option<ImageFormatTag> {
    match format {
        ImageFormat::Jpeg => Some(ImageFormatTag::Jpeg),
        ImageFormat::Png => Some(ImageFormatTag::Png),
        ImageFormat::Gif => Some(ImageFormatTag::Gif),
        ImageFormat::Bmp => Some(ImageFormatTag::Bmp),
        ImageFormat::WebP => Some(ImageFormatTag::Webp),
        _ => None,
    }
}

/// Reads just enough of an in-memory file to learn `(width, height,
/// format)`.
pub fn probe_bytes(bytes: &[u8]) -> Result<ProbedImage> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImagoError::DataCorruption(format!("unrecognizable image data: {e}")))?;
    let format = reader
        .format()
        .and_then(tag_for)
        .ok_or_else(|| ImagoError::DataCorruption("unsupported image format".into()))?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| ImagoError::DataCorruption(format!("failed to read image header: {e}")))?;
    Ok(ProbedImage {
        width,
        height,
        format,
    })
}

/// Header-only probe straight from disk.
pub fn probe_file(path: &Path) -> Result<ProbedImage> {
    let reader = ImageReader::open(path)?
        .with_guessed_format()
        .map_err(|e| ImagoError::DataCorruption(format!("unrecognizable image data: {e}")))?;
    let format = reader
        .format()
        .and_then(tag_for)
        .ok_or_else(|| ImagoError::DataCorruption("unsupported image format".into()))?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| ImagoError::DataCorruption(format!("failed to read image header: {e}")))?;
    Ok(ProbedImage {
        width,
        height,
        format,
    })
}

#[derive(Clone, Debug)]
pub struct RenderedDerivative {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decodes `bytes` and renders a JPEG derivative fitting the target box,
/// preserving aspect ratio. Images already inside the box are re-encoded
/// without resampling.
pub fn render_jpeg(bytes: &[u8], max_width: u32, max_height: u32, quality: u8) -> Result<RenderedDerivative> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ImagoError::DataCorruption(format!("failed to decode image: {e}")))?;
    let resized = if decoded.width() <= max_width && decoded.height() <= max_height {
        decoded
    } else {
        decoded.thumbnail(max_width, max_height)
    };
    let (width, height) = (resized.width(), resized.height());

    // JPEG carries no alpha channel.
    let rgb = resized.into_rgb8();
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode_image(&rgb)
        .map_err(|e| ImagoError::Internal(format!("jpeg encode failed: {e}")))?;

    Ok(RenderedDerivative {
        bytes: out,
        width,
        height,
    })
}

/// Pre-encoded data-URL used when inlining a thumbnail into a summary.
pub fn data_url(format: ImageFormatTag, bytes: &[u8]) -> String {
    let mut url = String::with_capacity(format.data_url_prefix().len() + bytes.len() * 4 / 3 + 4);
    url.push_str(format.data_url_prefix());
    BASE64.encode_string(bytes, &mut url);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    pub(crate) fn jpeg_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128u8])
        });
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, 90);
        encoder.encode_image(&img).unwrap();
        out
    }

    pub(crate) fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_pixel(width, height, Rgb([10, 20, 30]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn probe_reads_dimensions_and_format() {
        let probed = probe_bytes(&jpeg_fixture(500, 300)).unwrap();
        assert_eq!((probed.width, probed.height), (500, 300));
        assert_eq!(probed.format, ImageFormatTag::Jpeg);

        let probed = probe_bytes(&png_fixture(400, 400)).unwrap();
        assert_eq!(probed.format, ImageFormatTag::Png);
    }

    #[test]
    fn probe_rejects_garbage() {
        let err = probe_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ImagoError::DataCorruption(_)));
    }

    #[test]
    fn render_fits_the_target_box() {
        let rendered = render_jpeg(&jpeg_fixture(500, 300), 300, 300, 85).unwrap();
        assert!(rendered.width <= 300 && rendered.height <= 300);
        // Aspect ratio survives within rounding.
        assert_eq!(rendered.width, 300);
        assert_eq!(rendered.height, 180);
        assert!(!rendered.bytes.is_empty());
        assert_eq!(probe_bytes(&rendered.bytes).unwrap().format, ImageFormatTag::Jpeg);
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let rendered = render_jpeg(&jpeg_fixture(100, 80), 300, 300, 85).unwrap();
        assert_eq!((rendered.width, rendered.height), (100, 80));
    }

    #[test]
    fn data_url_carries_content_type_prefix() {
        let url = data_url(ImageFormatTag::Jpeg, b"abc");
        assert!(url.starts_with("data:image/jpeg;base64,"));
        let url = data_url(ImageFormatTag::Gif, b"abc");
        assert!(url.starts_with("data:image/gif;base64,"));
    }
}
