use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Formats the capture path can deliver as JPEG
pub const SUPPORTED_FORMATS: &str =
    "YUYV, YVYU, UYVY, NV12, NV21, YU12, YV12, RGBP, RGB3, BGR3, GREY, MJPG, JPEG";

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mjpeg,
    Jpeg,
    Yuyv,
    Yvyu,
    Uyvy,
    Nv12,
    Nv21,
    Yu12,
    Yv12,
    Rgb565,
    Rgb24,
    Bgr24,
    Grey,
}

impl PixelFormat {
    pub fn from_fourcc(code: [u8; 4]) -> Result<Self, CaptureError> {
        let format = match &code {
            b"MJPG" => PixelFormat::Mjpeg,
            b"JPEG" => PixelFormat::Jpeg,
            b"YUYV" => PixelFormat::Yuyv,
            b"YVYU" => PixelFormat::Yvyu,
            b"UYVY" => PixelFormat::Uyvy,
            b"NV12" => PixelFormat::Nv12,
            b"NV21" => PixelFormat::Nv21,
            b"YU12" => PixelFormat::Yu12,
            b"YV12" => PixelFormat::Yv12,
            b"RGBP" => PixelFormat::Rgb565,
            b"RGB3" => PixelFormat::Rgb24,
            b"BGR3" => PixelFormat::Bgr24,
            b"GREY" => PixelFormat::Grey,
            _ => {
                return Err(CaptureError::UnsupportedFormat {
                    fourcc: String::from_utf8_lossy(&code).into_owned(),
                    supported: SUPPORTED_FORMATS,
                })
            }
        };
        Ok(format)
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Jpeg => *b"JPEG",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Yvyu => *b"YVYU",
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Nv21 => *b"NV21",
            PixelFormat::Yu12 => *b"YU12",
            PixelFormat::Yv12 => *b"YV12",
            PixelFormat::Rgb565 => *b"RGBP",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Grey => *b"GREY",
        }
    }

    /// Compressed formats are forwarded to clients untouched.
    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::Jpeg)
    }

    /// Bytes per pixel in the first plane of an uncompressed frame.
    pub(crate) fn luma_bytes(self) -> u32 {
        match self {
            PixelFormat::Yuyv | PixelFormat::Yvyu | PixelFormat::Uyvy | PixelFormat::Rgb565 => 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            _ => 1,
        }
    }
}

/// Frame layout as negotiated with the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub bytes_per_line: u32,
}

impl FrameGeometry {
    /// Drivers may report a zero stride for packed formats.
    pub fn new(width: u32, height: u32, bytes_per_line: u32, format: PixelFormat) -> Self {
        let bytes_per_line = if bytes_per_line == 0 && !format.is_compressed() {
            width * format.luma_bytes()
        } else {
            bytes_per_line
        };
        Self {
            width,
            height,
            bytes_per_line,
        }
    }
}

/// What a backend streams: format plus geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamFormat {
    pub format: PixelFormat,
    #[serde(flatten)]
    pub geometry: FrameGeometry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_round_trip_for_supported_set() {
        for code in SUPPORTED_FORMATS.split(", ") {
            let raw: [u8; 4] = code.as_bytes().try_into().unwrap();
            let format = PixelFormat::from_fourcc(raw).unwrap();
            assert_eq!(&format.fourcc(), code.as_bytes());
        }
    }

    #[test]
    fn test_unsupported_fourcc_lists_supported_set() {
        let err = PixelFormat::from_fourcc(*b"H264").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("H264"));
        assert!(message.contains("YUYV"));
        assert!(message.contains("MJPG"));
    }

    #[test]
    fn test_zero_stride_is_derived() {
        let geometry = FrameGeometry::new(640, 480, 0, PixelFormat::Yuyv);
        assert_eq!(geometry.bytes_per_line, 1280);

        let geometry = FrameGeometry::new(640, 480, 0, PixelFormat::Mjpeg);
        assert_eq!(geometry.bytes_per_line, 0);
    }
}
