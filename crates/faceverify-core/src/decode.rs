//! Image payload decoding.
//!
//! Clients submit images as base64 text, usually straight out of a browser
//! canvas as a data URI (`data:image/png;base64,iVBOR...`). Decoding runs in
//! two stages: text to bytes, then bytes to an RGB bitmap.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use image::RgbImage;
use thiserror::Error;

/// In-memory color bitmap handed to the verifier (height × width × RGB).
pub type DecodedImage = RgbImage;

/// Standard alphabet, padding optional on decode.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64 image payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("payload is not a decodable image: {0}")]
    InvalidImage(#[from] image::ImageError),
}

/// Drop a data-URI style header: everything up to and including the first comma.
///
/// The header is not inspected; a payload without a comma is returned as-is.
pub fn strip_data_uri_header(payload: &str) -> &str {
    payload
        .split_once(',')
        .map_or(payload, |(_header, content)| content)
}

/// Decode a client image payload into an RGB bitmap.
pub fn decode_image(payload: &str) -> Result<DecodedImage, DecodeError> {
    let bytes = decode_payload_bytes(payload)?;
    let image = image::load_from_memory(&bytes)?;

    tracing::trace!(
        bytes = bytes.len(),
        width = image.width(),
        height = image.height(),
        color = ?image.color(),
        "decoded image payload"
    );

    Ok(image.to_rgb8())
}

/// First stage only: strip the header and base64-decode the remainder.
pub fn decode_payload_bytes(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let content = strip_data_uri_header(payload);

    // Line-wrapped base64 (MIME style) is common in pasted payloads.
    let bytes = if content.bytes().any(|b| b.is_ascii_whitespace()) {
        let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        PAYLOAD_ENGINE.decode(compact)?
    } else {
        PAYLOAD_ENGINE.decode(content)?
    };

    Ok(bytes)
}

/// Build a `data:<mime>;base64,<content>` payload from raw image bytes.
pub fn encode_data_uri(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", PAYLOAD_ENGINE.encode(bytes))
}
