use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use crate::error::TryOnError;

/// Strips an optional `data:...,` prefix. Only the first comma counts.
fn strip_data_url(base64_string: &str) -> &str {
    match base64_string.split_once(',') {
        Some((_, payload)) => payload,
        None => base64_string,
    }
}

pub fn base64_to_image(base64_string: &str) -> Result<DynamicImage, TryOnError> {
    // Wrapped output from `base64` on the command line is still accepted.
    let payload: String = strip_data_url(base64_string)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    let decoded_data = general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| TryOnError::Decode(format!("base64 decode failed: {}", e)))?;

    let img = image::load_from_memory(&decoded_data)
        .map_err(|e| TryOnError::Decode(format!("image load failed: {}", e)))?;

    Ok(img)
}

pub fn image_to_png(img: &DynamicImage) -> Result<Vec<u8>, TryOnError> {
    let mut image_data = Vec::new();
    img.write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)
        .map_err(|e| TryOnError::Internal(format!("image encode failed: {}", e)))?;
    Ok(image_data)
}

/// PNG, base64, and no data-URL prefix on the way out.
pub fn image_to_base64(img: &DynamicImage) -> Result<String, TryOnError> {
    let image_data = image_to_png(img)?;
    Ok(general_purpose::STANDARD.encode(image_data))
}
