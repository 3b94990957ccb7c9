//! Content validation for image bytes.
//!
//! Declared content types are adversarial input on both intake paths: a
//! browser can label an upload however it likes, and a remote server can lie
//! in its response headers. Classification therefore looks only at leading
//! magic bytes, against a closed whitelist of three formats.

const PNG_MAGIC: [u8; 4] = [0x89, 0x50, 0x4E, 0x47];
const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
// "RIFF" container prefix, used by WebP.
const RIFF_MAGIC: [u8; 4] = [0x52, 0x49, 0x46, 0x46];

/// Image formats this service will accept or proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }
}

/// Classify a byte buffer by its leading signature.
///
/// Anything that does not open with a PNG, JPEG, or RIFF/WebP signature is
/// `None`, regardless of what any transport metadata claimed.
pub fn classify_image(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(&PNG_MAGIC) {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(&JPEG_MAGIC) {
        Some(ImageFormat::Jpeg)
    } else if bytes.starts_with(&RIFF_MAGIC) {
        Some(ImageFormat::Webp)
    } else {
        None
    }
}

/// Size gate, applied before and after any decoding step.
pub fn within_size_limit(len: usize, limit: usize) -> bool {
    len <= limit
}

/// Upper bound on the encoded length of a base64 payload whose decoded size
/// fits `limit`. Base64 expands 3 bytes to 4 characters; the slack covers a
/// data-URL prefix and stray whitespace.
pub fn max_encoded_len(limit: usize) -> usize {
    (limit / 3 + 1) * 4 + 64
}
