//! Base64 image decoding for camera check-in payloads.
//!
//! Browsers submit stills as data URIs (`data:image/jpeg;base64,...`); the
//! header up to the first comma is stripped before decoding.

use base64::Engine;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("not a decodable image: {0}")]
    Image(#[from] image::ImageError),
    #[error("decoded frame is empty")]
    EmptyFrame,
}

/// Decode a base64-encoded still (optionally a data URI) into an RGB frame.
pub fn decode_base64_image(payload: &str) -> Result<RgbImage, DecodeError> {
    let encoded = match payload.split_once(',') {
        Some((_header, rest)) => rest,
        None => payload,
    };

    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    let frame = image::load_from_memory(&bytes)?.to_rgb8();

    if frame.width() == 0 || frame.height() == 0 {
        return Err(DecodeError::EmptyFrame);
    }

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_test_png(width: u32, height: u32) -> String {
        let img = RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        base64::engine::general_purpose::STANDARD.encode(buf.into_inner())
    }

    #[test]
    fn test_decode_plain_base64() {
        let payload = encode_test_png(8, 6);
        let frame = decode_base64_image(&payload).unwrap();
        assert_eq!(frame.width(), 8);
        assert_eq!(frame.height(), 6);
        assert_eq!(frame.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_decode_data_uri_prefix() {
        let payload = format!("data:image/png;base64,{}", encode_test_png(4, 4));
        let frame = decode_base64_image(&payload).unwrap();
        assert_eq!(frame.dimensions(), (4, 4));
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(matches!(
            decode_base64_image("!!not base64!!"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn test_decode_not_an_image() {
        let payload = base64::engine::general_purpose::STANDARD.encode(b"hello world");
        assert!(matches!(
            decode_base64_image(&payload),
            Err(DecodeError::Image(_))
        ));
    }
}
