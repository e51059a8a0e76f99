//! Frame validation utilities for test pattern verification.
//!
//! This module provides functions to validate that converted greyscale frames
//! contain expected test patterns. Useful for integration testing with
//! virtual cameras.

use crate::convert::GreyscaleImage;
use crate::frame::RawFrame;
use crate::traits::{CameraError, Result};

/// Luma drop required between neighbouring color bars.
const MIN_BAR_STEP: u8 = 5;

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// The eight bars (White, Yellow, Cyan, Green, Magenta, Red, Blue, Black) get
/// strictly darker from left to right once reduced to luma. The center of
/// each bar is sampled on the middle row.
///
/// # Errors
///
/// Returns `StreamError` if:
/// - A sample lies outside the image
/// - The first bar is not bright or the last bar is not dark
/// - Any bar is not darker than its left neighbour
pub fn validate_color_bars(image: &GreyscaleImage) -> Result<()> {
    let (width, height) = image.dimensions();
    let bar_width = width / 8;
    let center_y = height / 2;

    let mut previous: Option<u8> = None;
    for bar in 0..8u32 {
        let sample_x = bar * bar_width + bar_width / 2;
        let luma = sample(image, sample_x, center_y)?;

        if let Some(prev) = previous {
            if luma.saturating_add(MIN_BAR_STEP) > prev {
                return Err(CameraError::StreamError(format!(
                    "Color bar {bar} at x={sample_x} is not darker than its neighbour: \
                     {luma} vs {prev}"
                )));
            }
        }
        previous = Some(luma);
    }

    let first = sample(image, bar_width / 2, center_y)?;
    let last = previous.unwrap_or(u8::MAX);
    if first < 200 || last > 40 {
        return Err(CameraError::StreamError(format!(
            "Color bars out of range: white bar {first}, black bar {last}"
        )));
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Samples the middle row every 10 pixels and verifies that luma increases
/// monotonically from left to right by at least 50 overall.
///
/// # Errors
///
/// Returns `StreamError` if:
/// - The luminance doesn't increase monotonically
/// - The total luminance change is too small (solid color)
pub fn validate_gradient(image: &GreyscaleImage) -> Result<()> {
    let (width, height) = image.dimensions();
    let center_y = height / 2;

    let mut first_luminance: Option<u8> = None;
    let mut prev_luminance: Option<u8> = None;

    for x in (0..width).step_by(10) {
        let luminance = sample(image, x, center_y)?;
        first_luminance.get_or_insert(luminance);

        if let Some(prev) = prev_luminance {
            // Allow small decreases due to rounding
            if luminance.saturating_add(1) < prev {
                return Err(CameraError::StreamError(format!(
                    "Gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }
        prev_luminance = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first_luminance, prev_luminance) {
        let luminance_change = last.saturating_sub(first);
        if luminance_change < 50 {
            return Err(CameraError::StreamError(format!(
                "Insufficient luminance change for gradient: {luminance_change} \
                 (expected at least 50)"
            )));
        }
    }

    Ok(())
}

/// Validates that every pixel is within `tolerance` of `expected`.
///
/// # Errors
///
/// Returns `StreamError` naming the first pixel out of range.
pub fn validate_uniform(image: &GreyscaleImage, expected: u8, tolerance: u8) -> Result<()> {
    match image
        .enumerate_pixels()
        .find(|(_, _, pixel)| pixel.0[0].abs_diff(expected) > tolerance)
    {
        Some((x, y, pixel)) => Err(CameraError::StreamError(format!(
            "Pixel ({x}, {y}) is {}, expected {expected} ± {tolerance}",
            pixel.0[0]
        ))),
        None => Ok(()),
    }
}

/// Validates that consecutive frames were all freshly completed.
///
/// Every frame must be fresh, timestamps must not go backwards, and no two
/// neighbouring frames may come from the same buffer.
///
/// # Errors
///
/// Returns `StreamError` if:
/// - The frames slice is empty
/// - A frame is a repeat of an earlier one
/// - Timestamps decrease
pub fn validate_frame_sequence(frames: &[RawFrame<'_>]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::StreamError(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    if let Some(index) = frames.iter().position(|frame| !frame.fresh) {
        return Err(CameraError::StreamError(format!(
            "Frame at index {index} is a repeat"
        )));
    }

    for (index, pair) in frames.windows(2).enumerate() {
        let [prev, curr] = pair else {
            continue;
        };
        if curr.memory == prev.memory {
            return Err(CameraError::StreamError(format!(
                "Frames {index} and {} share slot {}",
                index + 1,
                curr.slot
            )));
        }
        if curr.timestamp < prev.timestamp {
            return Err(CameraError::StreamError(format!(
                "Timestamp went backwards at index {}: {} < {}",
                index + 1,
                curr.timestamp,
                prev.timestamp
            )));
        }
    }

    Ok(())
}

fn sample(image: &GreyscaleImage, x: u32, y: u32) -> Result<u8> {
    image
        .get_pixel_checked(x, y)
        .map(|pixel| pixel.0[0])
        .ok_or_else(|| CameraError::StreamError(format!("Failed to get pixel at ({x}, {y})")))
}
