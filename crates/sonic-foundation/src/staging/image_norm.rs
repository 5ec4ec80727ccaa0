//! Still image decoding and normalization.
//!
//! Policy: center-crop to a square, then Lanczos3 resize to the target edge
//! length. Output is interleaved RGB `f32` in `[0, 1]`.

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgb32FImage};
use sonic_kernel::error::{StagingError, ValidationError};
use sonic_kernel::media::{ImageTensor, Region};

const ACCEPTED: [ImageFormat; 4] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::WebP,
    ImageFormat::Bmp,
];

/// Decoded source image plus its normalized tensor.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub source_width: u32,
    pub source_height: u32,
    pub tensor: ImageTensor,
}

fn unsupported(reason: impl Into<String>) -> ValidationError {
    ValidationError::Unsupported {
        what: "image",
        reason: reason.into(),
    }
}

/// Unrecognized or non-accepted containers are validation failures; bytes
/// that claim an accepted format but do not decode are decode failures.
pub fn decode_and_normalize(
    bytes: &[u8],
    resolution: u32,
) -> Result<NormalizedImage, StagingError> {
    let format = image::guess_format(bytes)
        .map_err(|_| unsupported("unrecognized image container"))?;
    if !ACCEPTED.contains(&format) {
        return Err(unsupported(format!("{format:?} is not accepted")).into());
    }

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| StagingError::decode("image", format!("corrupt {format:?}: {e}")))?;
    let (source_width, source_height) = (decoded.width(), decoded.height());
    if source_width == 0 || source_height == 0 {
        return Err(StagingError::decode("image", "image has zero size"));
    }

    Ok(NormalizedImage {
        source_width,
        source_height,
        tensor: normalize(&decoded, resolution),
    })
}

fn normalize(decoded: &DynamicImage, resolution: u32) -> ImageTensor {
    let (w, h) = (decoded.width(), decoded.height());
    let side = w.min(h);
    let square = decoded.crop_imm((w - side) / 2, (h - side) / 2, side, side);
    let resized = square.resize_exact(resolution, resolution, FilterType::Lanczos3);
    let rgb = resized.to_rgb8();

    let data = rgb.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
    ImageTensor::new(resolution, resolution, data)
}

/// Cut `region` out of an already normalized tensor and bring it back to
/// `resolution` x `resolution`. The region is widened to a square first.
/// Returns `None` if the tensor data does not match its dimensions.
pub fn crop_resize(
    tensor: &ImageTensor,
    region: &Region,
    resolution: u32,
) -> Option<ImageTensor> {
    let buffer = Rgb32FImage::from_raw(tensor.width, tensor.height, tensor.data.clone())?;

    let side = region.width.max(region.height).min(tensor.width).min(tensor.height).max(1);
    let cx = region.x + region.width / 2;
    let cy = region.y + region.height / 2;
    let x = cx.saturating_sub(side / 2).min(tensor.width - side);
    let y = cy.saturating_sub(side / 2).min(tensor.height - side);

    let cropped = imageops::crop_imm(&buffer, x, y, side, side).to_image();
    let resized = imageops::resize(&cropped, resolution, resolution, FilterType::Lanczos3);
    let data = resized.into_raw().into_iter().map(|v| v.clamp(0.0, 1.0)).collect();
    Some(ImageTensor::new(resolution, resolution, data))
}
