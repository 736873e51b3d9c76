use jpeg_decoder::{Decoder, PixelFormat as JpegFormat};

use crate::error::CameraError;

/// Wire formats a V4L2 device may hand us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Mjpeg,
    Yuyv,
    Grey,
}

/// Convert one device buffer into 8-bit luma of `width * height` bytes.
pub fn decode_gray(
    data: &[u8],
    format: WireFormat,
    width: usize,
    height: usize,
) -> Result<Vec<u8>, CameraError> {
    let pixels = width * height;
    match format {
        WireFormat::Grey => Ok(data[..pixels.min(data.len())].to_vec()),
        WireFormat::Yuyv => {
            // Y0 U Y1 V: every even byte is luma
            Ok(data.iter().step_by(2).take(pixels).copied().collect())
        }
        WireFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let decoded = decoder.decode()?;
            let info = decoder
                .info()
                .ok_or_else(|| CameraError::Device("jpeg without header".to_string()))?;
            let gray = match info.pixel_format {
                JpegFormat::L8 => decoded,
                JpegFormat::L16 => decoded.chunks_exact(2).map(|px| px[0]).collect(),
                JpegFormat::RGB24 => decoded.chunks_exact(3).map(luma).collect(),
                JpegFormat::CMYK32 => {
                    return Err(CameraError::Device("CMYK jpeg not supported".to_string()))
                }
            };
            Ok(gray)
        }
    }
}

// BT.601 weights in 8.8 fixed point
fn luma(rgb: &[u8]) -> u8 {
    let (r, g, b) = (rgb[0] as u32, rgb[1] as u32, rgb[2] as u32);
    ((77 * r + 150 * g + 29 * b) >> 8) as u8
}
