//! Raw frame to JPEG conversion

use std::time::Instant;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::frame::{FrameGeometry, PixelFormat};
use crate::error::CaptureError;

/// Turn one captured buffer into a JPEG frame.
///
/// Compressed formats pass through unchanged, everything else is converted
/// to packed RGB and re-encoded.
pub fn encode_frame(
    data: &[u8],
    format: PixelFormat,
    geometry: &FrameGeometry,
    quality: u8,
) -> Result<Bytes, CaptureError> {
    if format.is_compressed() {
        return Ok(Bytes::copy_from_slice(data));
    }

    let started = Instant::now();
    let rgb = to_rgb(data, format, geometry)?;

    let mut jpeg = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode(
        &rgb,
        geometry.width,
        geometry.height,
        ExtendedColorType::Rgb8,
    )?;

    metrics::histogram!("frame_encode_time_us").record(started.elapsed().as_micros() as f64);
    Ok(Bytes::from(jpeg))
}

/// Convert an uncompressed frame to tightly packed RGB24.
pub fn to_rgb(
    data: &[u8],
    format: PixelFormat,
    geometry: &FrameGeometry,
) -> Result<Vec<u8>, CaptureError> {
    let width = geometry.width as usize;
    let height = geometry.height as usize;
    let stride = geometry.bytes_per_line as usize;

    let min_stride = width * format.luma_bytes() as usize;
    if stride < min_stride {
        return Err(CaptureError::ShortFrame {
            expected: min_stride,
            got: stride,
        });
    }

    // chroma is subsampled 2x2, odd edges round up
    let chroma_rows = height.div_ceil(2);
    let expected = match format {
        PixelFormat::Nv12 | PixelFormat::Nv21 => {
            let pairs = 2 * width.div_ceil(2);
            if stride < pairs {
                return Err(CaptureError::ShortFrame {
                    expected: pairs,
                    got: stride,
                });
            }
            stride * height + stride * chroma_rows
        }
        PixelFormat::Yu12 | PixelFormat::Yv12 => stride * height + 2 * stride.div_ceil(2) * chroma_rows,
        _ => stride * height,
    };
    if data.len() < expected {
        return Err(CaptureError::ShortFrame {
            expected,
            got: data.len(),
        });
    }

    let mut rgb = vec![0u8; width * height * 3];
    match format {
        PixelFormat::Yuyv => packed_422(data, stride, width, height, [0, 1, 2, 3], &mut rgb),
        PixelFormat::Yvyu => packed_422(data, stride, width, height, [0, 3, 2, 1], &mut rgb),
        PixelFormat::Uyvy => packed_422(data, stride, width, height, [1, 0, 3, 2], &mut rgb),
        PixelFormat::Nv12 => semi_planar(data, stride, width, height, false, &mut rgb),
        PixelFormat::Nv21 => semi_planar(data, stride, width, height, true, &mut rgb),
        PixelFormat::Yu12 => planar(data, stride, width, height, false, &mut rgb),
        PixelFormat::Yv12 => planar(data, stride, width, height, true, &mut rgb),
        PixelFormat::Rgb565 => {
            for (y, out) in rgb.chunks_exact_mut(width * 3).enumerate() {
                let row = &data[y * stride..];
                for (x, px) in out.chunks_exact_mut(3).enumerate() {
                    let v = u16::from_le_bytes([row[x * 2], row[x * 2 + 1]]);
                    let r = ((v >> 11) & 0x1f) as u8;
                    let g = ((v >> 5) & 0x3f) as u8;
                    let b = (v & 0x1f) as u8;
                    px.copy_from_slice(&[(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]);
                }
            }
        }
        PixelFormat::Rgb24 => {
            for (y, out) in rgb.chunks_exact_mut(width * 3).enumerate() {
                out.copy_from_slice(&data[y * stride..y * stride + width * 3]);
            }
        }
        PixelFormat::Bgr24 => {
            for (y, out) in rgb.chunks_exact_mut(width * 3).enumerate() {
                let row = &data[y * stride..];
                for (x, px) in out.chunks_exact_mut(3).enumerate() {
                    px.copy_from_slice(&[row[x * 3 + 2], row[x * 3 + 1], row[x * 3]]);
                }
            }
        }
        PixelFormat::Grey => {
            for (y, out) in rgb.chunks_exact_mut(width * 3).enumerate() {
                let row = &data[y * stride..];
                for (x, px) in out.chunks_exact_mut(3).enumerate() {
                    px.fill(row[x]);
                }
            }
        }
        PixelFormat::Mjpeg | PixelFormat::Jpeg => {
            return Err(CaptureError::UnsupportedFormat {
                fourcc: String::from_utf8_lossy(&format.fourcc()).into_owned(),
                supported: "uncompressed formats only",
            })
        }
    }

    Ok(rgb)
}

/// BT.601 limited-range YCbCr to RGB
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// 4:2:2 packed; `order` gives the byte offsets of Y0, U, Y1, V in a macropixel.
fn packed_422(data: &[u8], stride: usize, width: usize, height: usize, order: [usize; 4], rgb: &mut [u8]) {
    let [y0, u, y1, v] = order;
    for row in 0..height {
        let src = &data[row * stride..];
        let dst = &mut rgb[row * width * 3..(row + 1) * width * 3];
        for x in (0..width).step_by(2) {
            let Some(m) = src.get(x * 2..x * 2 + 4) else {
                break;
            };
            dst[x * 3..x * 3 + 3].copy_from_slice(&yuv_to_rgb(m[y0], m[u], m[v]));
            if x + 1 < width {
                dst[(x + 1) * 3..(x + 2) * 3].copy_from_slice(&yuv_to_rgb(m[y1], m[u], m[v]));
            }
        }
    }
}

/// NV12 / NV21: full Y plane followed by an interleaved chroma plane.
fn semi_planar(data: &[u8], stride: usize, width: usize, height: usize, swap_uv: bool, rgb: &mut [u8]) {
    let (luma, chroma) = data.split_at(stride * height);
    for row in 0..height {
        let c_row = &chroma[(row / 2) * stride..];
        for x in 0..width {
            let pair = &c_row[(x / 2) * 2..(x / 2) * 2 + 2];
            let (u, v) = if swap_uv { (pair[1], pair[0]) } else { (pair[0], pair[1]) };
            let out = (row * width + x) * 3;
            rgb[out..out + 3].copy_from_slice(&yuv_to_rgb(luma[row * stride + x], u, v));
        }
    }
}

/// YU12 / YV12: Y plane, then two quarter-size chroma planes.
fn planar(data: &[u8], stride: usize, width: usize, height: usize, swap_uv: bool, rgb: &mut [u8]) {
    let c_stride = stride.div_ceil(2);
    let c_size = c_stride * height.div_ceil(2);
    let (luma, rest) = data.split_at(stride * height);
    let (first, second) = rest.split_at(c_size);
    let (u_plane, v_plane) = if swap_uv { (second, first) } else { (first, second) };

    for row in 0..height {
        for x in 0..width {
            let c = (row / 2) * c_stride + x / 2;
            let out = (row * width + x) * 3;
            rgb[out..out + 3].copy_from_slice(&yuv_to_rgb(luma[row * stride + x], u_plane[c], v_plane[c]));
        }
    }
}
