//! Conversion between embedded-text image payloads and raster images.

use crate::error::{DecodeError, EncodeError};
use crate::raster::RasterImage;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};

/// MIME type of the payloads produced by [`encode`].
pub const RESPONSE_MIME: &str = "image/jpeg";

/// An image carried as printable text, e.g. `data:image/jpeg;base64,/9j/4AAQ...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImagePayload(String);

impl ImagePayload {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The encoded part of the payload, without any `data:...,` prefix.
    pub fn data(&self) -> &str {
        let text = self.0.trim();
        match text.strip_prefix("data:") {
            Some(rest) => rest.split_once(',').map_or("", |(_, data)| data.trim()),
            None => text,
        }
    }

    /// The MIME type declared by the prefix, if any.
    pub fn mime(&self) -> Option<&str> {
        let rest = self.0.trim().strip_prefix("data:")?;
        let (meta, _) = rest.split_once(',')?;
        meta.split(';').next().filter(|mime| !mime.is_empty())
    }

    /// Raw image bytes carried by the payload.
    ///
    /// Whitespace inside the base64 text (line wrapping) is ignored.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        let data: Vec<u8> = self
            .data()
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        if data.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        Ok(STANDARD.decode(data)?)
    }
}

impl From<String> for ImagePayload {
    fn from(text: String) -> Self {
        Self(text)
    }
}

/// Decodes a payload into a 3-channel RGB raster.
///
/// The format is sniffed from the bytes. Alpha is discarded and grayscale expanded.
pub fn decode(payload: &ImagePayload) -> Result<RasterImage, DecodeError> {
    let bytes = payload.to_bytes()?;
    let image = image::load_from_memory(&bytes)?;
    Ok(image.to_rgb8())
}

/// Encodes a raster as a JPEG data payload with the given quality (1-100).
pub fn encode(image: &RasterImage, quality: u8) -> Result<ImagePayload, EncodeError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    image.write_with_encoder(encoder)?;
    Ok(encode_bytes_with_mime(&buffer, RESPONSE_MIME))
}

/// Wraps already-encoded image bytes into a payload without re-encoding them.
pub fn encode_bytes_with_mime(bytes: &[u8], mime: &str) -> ImagePayload {
    ImagePayload(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
}
