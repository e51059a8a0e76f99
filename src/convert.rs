//! Greyscale conversion engine.
//!
//! Every routine allocates a `width * height` single-channel image and never
//! resizes. None of them checks that the frame's bytes really have the layout
//! its format tag claims: a wrong tag yields wrong pixel values, not an error.
//! Only a buffer shorter than the geometry requires is rejected.

use image::{GrayImage, RgbImage};

use crate::frame::RawFrame;
use crate::traits::{CameraError, ColorFormat, Result};

/// 8-bit single-channel image owned by the caller.
pub type GreyscaleImage = GrayImage;

/// Source layout handled by the accelerated path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionCode {
    /// Packed UYVY 4:2:2.
    UyvyToGrey,
    /// Packed YUYV 4:2:2.
    YuyvToGrey,
    /// Packed RGB24.
    RgbToGrey,
    /// Packed BGR24.
    BgrToGrey,
    /// 8-bit Bayer RGGB.
    BayerRggbToGrey,
}

impl ConversionCode {
    /// Code for a multi-channel format. Single-channel formats have none.
    #[must_use]
    pub const fn for_format(format: ColorFormat) -> Option<Self> {
        match format {
            ColorFormat::Uyvy => Some(Self::UyvyToGrey),
            ColorFormat::Yuyv => Some(Self::YuyvToGrey),
            ColorFormat::Rgb8 => Some(Self::RgbToGrey),
            ColorFormat::Bgr8 => Some(Self::BgrToGrey),
            ColorFormat::BayerRggb8 => Some(Self::BayerRggbToGrey),
            ColorFormat::Grey8 | ColorFormat::Grey16 => None,
        }
    }

    /// Layout this code reads.
    #[must_use]
    pub const fn source_format(self) -> ColorFormat {
        match self {
            Self::UyvyToGrey => ColorFormat::Uyvy,
            Self::YuyvToGrey => ColorFormat::Yuyv,
            Self::RgbToGrey => ColorFormat::Rgb8,
            Self::BgrToGrey => ColorFormat::Bgr8,
            Self::BayerRggbToGrey => ColorFormat::BayerRggb8,
        }
    }
}

/// Speed versus fidelity preference for [`to_greyscale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fidelity {
    /// Take luma samples as they are where the layout allows it.
    Fast,
    /// Full colour conversion before computing luma.
    #[default]
    Accurate,
}

/// Conversion algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionMethod {
    /// Verbatim copy of an 8-bit single-channel buffer.
    DirectCopy,
    /// Colour conversion followed by luma computation.
    Accelerated(ConversionCode),
    /// Luma extraction from packed UYVY.
    Manual,
    /// 16-bit to 8-bit reduction keeping the high byte.
    BitDepthReduction,
}

impl ConversionMethod {
    /// Pick the algorithm for a source format.
    #[must_use]
    pub const fn select(format: ColorFormat, fidelity: Fidelity) -> Self {
        match (format, fidelity) {
            (ColorFormat::Grey8, _) => Self::DirectCopy,
            (ColorFormat::Grey16, _) => Self::BitDepthReduction,
            (ColorFormat::Uyvy, Fidelity::Fast) => Self::Manual,
            (ColorFormat::Uyvy, Fidelity::Accurate) => Self::Accelerated(ConversionCode::UyvyToGrey),
            (ColorFormat::Yuyv, _) => Self::Accelerated(ConversionCode::YuyvToGrey),
            (ColorFormat::Rgb8, _) => Self::Accelerated(ConversionCode::RgbToGrey),
            (ColorFormat::Bgr8, _) => Self::Accelerated(ConversionCode::BgrToGrey),
            (ColorFormat::BayerRggb8, _) => Self::Accelerated(ConversionCode::BayerRggbToGrey),
        }
    }
}

/// Convert a frame with the algorithm suited to its format.
pub fn to_greyscale(frame: &RawFrame<'_>, fidelity: Fidelity) -> Result<GreyscaleImage> {
    convert(frame, ConversionMethod::select(frame.format, fidelity))
}

/// Convert a frame with an explicit algorithm.
pub fn convert(frame: &RawFrame<'_>, method: ConversionMethod) -> Result<GreyscaleImage> {
    match method {
        ConversionMethod::DirectCopy => copy_data(frame),
        ConversionMethod::Accelerated(code) => convert_with_code(frame, code),
        ConversionMethod::Manual => convert_manual(frame),
        ConversionMethod::BitDepthReduction => reduce_bit_depth(frame),
    }
}

/// Copy an 8-bit single-channel frame verbatim.
pub fn copy_data(frame: &RawFrame<'_>) -> Result<GreyscaleImage> {
    let data = frame.pixels(1)?;
    grey_image(frame, data.to_vec())
}

/// Keep the high byte of each 16-bit little-endian sample.
pub fn reduce_bit_depth(frame: &RawFrame<'_>) -> Result<GreyscaleImage> {
    let data = frame.pixels(2)?;
    grey_image(frame, data.iter().skip(1).step_by(2).copied().collect())
}

/// Take the luma bytes of a packed UYVY frame, ignoring chroma.
pub fn convert_manual(frame: &RawFrame<'_>) -> Result<GreyscaleImage> {
    let data = frame.pixels(2)?;
    grey_image(frame, data.iter().skip(1).step_by(2).copied().collect())
}

/// Accelerated conversion using the code implied by the frame's format.
pub fn convert_accelerated(frame: &RawFrame<'_>) -> Result<GreyscaleImage> {
    let code =
        ConversionCode::for_format(frame.format).ok_or(CameraError::NoConversion(frame.format))?;
    convert_with_code(frame, code)
}

/// Convert to RGB according to `code`, then compute luma with `image`.
pub fn convert_with_code(frame: &RawFrame<'_>, code: ConversionCode) -> Result<GreyscaleImage> {
    let data = frame.pixels(code.source_format().bytes_per_pixel())?;
    let rgb = match code {
        ConversionCode::UyvyToGrey => packed_yuv_to_rgb(data, YuvOrder::Uyvy),
        ConversionCode::YuyvToGrey => packed_yuv_to_rgb(data, YuvOrder::Yuyv),
        ConversionCode::RgbToGrey => data.to_vec(),
        ConversionCode::BgrToGrey => data
            .chunks_exact(3)
            .flat_map(|bgr| bgr.iter().rev().copied())
            .collect(),
        ConversionCode::BayerRggbToGrey => demosaic_rggb(data, frame.width, frame.height),
    };
    let rgb = RgbImage::from_raw(frame.width, frame.height, rgb).ok_or(
        CameraError::BufferTooSmall {
            expected: code.source_format().buffer_size(frame.width, frame.height),
            actual: data.len(),
        },
    )?;
    Ok(image::imageops::grayscale(&rgb))
}

fn grey_image(frame: &RawFrame<'_>, luma: Vec<u8>) -> Result<GreyscaleImage> {
    let actual = luma.len();
    GrayImage::from_raw(frame.width, frame.height, luma).ok_or(CameraError::BufferTooSmall {
        expected: frame.width as usize * frame.height as usize,
        actual,
    })
}

#[derive(Clone, Copy)]
enum YuvOrder {
    Uyvy,
    Yuyv,
}

fn packed_yuv_to_rgb(data: &[u8], order: YuvOrder) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    let pairs = data.chunks_exact(4);
    let tail = pairs.remainder();

    for pair in pairs {
        let Ok(bytes) = <[u8; 4]>::try_from(pair) else {
            continue;
        };
        let (y0, u, y1, v) = match order {
            YuvOrder::Uyvy => (bytes[1], bytes[0], bytes[3], bytes[2]),
            YuvOrder::Yuyv => (bytes[0], bytes[1], bytes[2], bytes[3]),
        };
        for y in [y0, y1] {
            let (r, g, b) = yuv_to_rgb(y, u, v);
            rgb.extend([r, g, b]);
        }
    }

    // odd pixel count: the last pixel has no chroma partner
    if let Ok([first, second]) = <[u8; 2]>::try_from(tail) {
        let (y, u) = match order {
            YuvOrder::Uyvy => (second, first),
            YuvOrder::Yuyv => (first, second),
        };
        let (r, g, b) = yuv_to_rgb(y, u, 128);
        rgb.extend([r, g, b]);
    }

    rgb
}

/// Nearest-neighbour demosaic: each 2x2 RGGB cell becomes one colour.
fn demosaic_rggb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (width, height) = (width as usize, height as usize);
    let mut rgb = Vec::with_capacity(width * height * 3);
    let sample = |x: usize, y: usize| {
        let x = x.min(width.saturating_sub(1));
        let y = y.min(height.saturating_sub(1));
        data.get(y * width + x).copied().map_or(0, u16::from)
    };

    for y in 0..height {
        for x in 0..width {
            let (cell_x, cell_y) = (x & !1, y & !1);
            let red = sample(cell_x, cell_y);
            let green = (sample(cell_x + 1, cell_y) + sample(cell_x, cell_y + 1)) / 2;
            let blue = sample(cell_x + 1, cell_y + 1);
            rgb.extend([red, green, blue].map(|channel| u8::try_from(channel).unwrap_or(u8::MAX)));
        }
    }

    rgb
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
///
/// # Arguments
///
/// * `y` - Luminance value (16-235 for studio range)
/// * `u` - Blue-difference chroma value (16-240)
/// * `v` - Red-difference chroma value (16-240)
///
/// # Returns
///
/// RGB tuple with values clamped to 0-255 range.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    let clamp = |val: f32| -> u8 {
        if val < 0.0 {
            0
        } else if val > 255.0 {
            255
        } else {
            #[allow(clippy::cast_possible_truncation)]
            #[allow(clippy::cast_sign_loss)]
            {
                val as u8
            }
        }
    };

    (clamp(r), clamp(g), clamp(b))
}
