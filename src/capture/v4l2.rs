//! Library-backed V4L2 capture

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::convert::encode_frame;
use super::engine::{CaptureBackend, FrameRead};
use super::frame::{FrameGeometry, PixelFormat, StreamFormat};
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Capture through the `v4l` crate's own mmap stream.
///
/// The stream is created on the first read after a start, so `start` itself
/// never touches the device.
pub struct LibraryBackend {
    path: PathBuf,
    device: Device,
    stream: Option<MmapStream<'static>>,
    format: StreamFormat,
    buffer_count: u32,
    jpeg_quality: u8,
}

impl LibraryBackend {
    #[instrument(skip(config))]
    pub fn open(path: &Path, config: &CaptureConfig) -> Result<Self, CaptureError> {
        let device = Device::with_path(path).map_err(|source| CaptureError::DeviceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        let caps = device
            .query_caps()
            .map_err(|_| CaptureError::NotCaptureDevice {
                path: path.to_path_buf(),
                reason: "not a V4L2 device",
            })?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCaptureDevice {
                path: path.to_path_buf(),
                reason: "no video capture capability",
            });
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(&config.format.fourcc());
        // the driver may adjust the request, so trust what comes back
        let fmt = device.set_format(&fmt)?;

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Could not set {} fps: {e}", config.fps);
        }

        let format = PixelFormat::from_fourcc(fmt.fourcc.repr)?;
        let geometry = FrameGeometry::new(fmt.width, fmt.height, fmt.stride, format);
        info!("Negotiated {:?} {}x{}", format, geometry.width, geometry.height);

        Ok(Self {
            path: path.to_path_buf(),
            device,
            stream: None,
            format: StreamFormat { format, geometry },
            buffer_count: config.buffer_count.max(1),
            jpeg_quality: config.jpeg_quality,
        })
    }
}

impl CaptureBackend for LibraryBackend {
    fn name(&self) -> &'static str {
        "library"
    }

    fn stream_format(&self) -> StreamFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn stop(&mut self) {
        // dropping the stream turns streaming off and unmaps its buffers
        if self.stream.take().is_some() {
            info!("Capture stream stopped on {}", self.path.display());
        }
    }

    fn read_frame(&mut self, wait: Duration) -> Result<FrameRead, CaptureError> {
        let StreamFormat { format, geometry } = self.format;
        let quality = self.jpeg_quality;

        if self.stream.is_none() {
            let mut stream =
                MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
            stream.set_timeout(wait);
            info!(
                "Capture stream started on {} with {} buffers",
                self.path.display(),
                self.buffer_count
            );
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(CaptureError::NotStreaming);
        };

        let (buf, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(FrameRead::TimedOut),
            Err(e) => return Err(e.into()),
        };
        let used = (meta.bytesused as usize).min(buf.len());
        let jpeg = encode_frame(&buf[..used], format, &geometry, quality)?;
        Ok(FrameRead::Frame(jpeg))
    }
}
