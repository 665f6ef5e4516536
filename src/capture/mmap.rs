//! Raw V4L2 streaming I/O over memory-mapped driver buffers

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::os::raw::c_int;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, warn};

use super::convert::encode_frame;
use super::engine::{CaptureBackend, FrameRead};
use super::frame::{FrameGeometry, PixelFormat, StreamFormat};
use crate::error::CaptureError;
use crate::sys::{self, V4l2Buffer, V4l2Capability, V4l2Format, V4l2RequestBuffers};
use crate::CaptureConfig;

/// Who may touch a mapped buffer right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    /// Queued, the driver is filling it
    Driver,
    /// Dequeued, the application is reading it
    App,
}

/// One driver buffer mapped into our address space
pub struct FrameBuffer {
    index: u32,
    map: MmapMut,
    bytes_used: usize,
    owner: BufferOwner,
}

impl FrameBuffer {
    /// A freshly mapped buffer belongs to us until it is queued.
    pub fn new(index: u32, map: MmapMut) -> Self {
        Self {
            index,
            map,
            bytes_used: 0,
            owner: BufferOwner::App,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn owner(&self) -> BufferOwner {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn expect_owner(&self, expected: BufferOwner) -> Result<(), CaptureError> {
        if self.owner != expected {
            return Err(CaptureError::BufferOwnership {
                index: self.index,
                owner: self.owner,
                expected,
            });
        }
        Ok(())
    }

    /// The driver handed the buffer back with `bytes_used` valid bytes.
    pub fn mark_dequeued(&mut self, bytes_used: usize) -> Result<(), CaptureError> {
        self.expect_owner(BufferOwner::Driver)?;
        self.bytes_used = bytes_used.min(self.map.len());
        self.owner = BufferOwner::App;
        Ok(())
    }

    /// The buffer was queued back to the driver.
    pub fn mark_requeued(&mut self) -> Result<(), CaptureError> {
        self.expect_owner(BufferOwner::App)?;
        self.bytes_used = 0;
        self.owner = BufferOwner::Driver;
        Ok(())
    }

    /// Frame bytes, readable only while the application owns the buffer.
    pub fn data(&self) -> Result<&[u8], CaptureError> {
        self.expect_owner(BufferOwner::App)?;
        Ok(&self.map[..self.bytes_used])
    }
}

/// Fixed set of mapped buffers for one streaming session
#[derive(Default)]
pub struct BufferPool {
    buffers: Vec<FrameBuffer>,
}

impl BufferPool {
    pub fn push(&mut self, buffer: FrameBuffer) {
        self.buffers.push(buffer);
    }

    pub fn get_mut(&mut self, index: u32) -> Result<&mut FrameBuffer, CaptureError> {
        self.buffers
            .iter_mut()
            .find(|b| b.index == index)
            .ok_or(CaptureError::UnknownBuffer(index))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn count_owned_by(&self, owner: BufferOwner) -> usize {
        self.buffers.iter().filter(|b| b.owner == owner).count()
    }

    /// Unmap every buffer. Returns whether there was anything to release.
    pub fn release(&mut self) -> bool {
        let released = !self.buffers.is_empty();
        self.buffers.clear();
        released
    }
}

/// Capture backend that drives the V4L2 queue directly
pub struct RawBufferBackend {
    path: PathBuf,
    file: File,
    format: StreamFormat,
    buffer_count: u32,
    jpeg_quality: u8,
    pool: BufferPool,
    requested: bool,
    streaming: bool,
}

impl RawBufferBackend {
    /// Open the device and validate what it streams.
    ///
    /// An unsupported pixel format fails here, before any buffer exists.
    #[instrument(skip(config))]
    pub fn open(path: &Path, config: &CaptureConfig) -> Result<Self, CaptureError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| CaptureError::DeviceUnavailable {
                path: path.to_path_buf(),
                source,
            })?;
        let fd = file.as_raw_fd();

        // SAFETY: plain C struct, zero is a valid value
        let mut caps: V4l2Capability = unsafe { std::mem::zeroed() };
        sys::retry(|| unsafe { sys::vidioc_querycap(fd, &mut caps) }).map_err(|_| {
            CaptureError::NotCaptureDevice {
                path: path.to_path_buf(),
                reason: "not a V4L2 device",
            }
        })?;

        let node = caps.node_caps();
        if node & sys::V4L2_CAP_VIDEO_CAPTURE == 0 {
            return Err(CaptureError::NotCaptureDevice {
                path: path.to_path_buf(),
                reason: "no video capture capability",
            });
        }
        if node & sys::V4L2_CAP_STREAMING == 0 {
            return Err(CaptureError::NotCaptureDevice {
                path: path.to_path_buf(),
                reason: "no streaming I/O support",
            });
        }

        // SAFETY: as above
        let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
        fmt.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        sys::retry(|| unsafe { sys::vidioc_g_fmt(fd, &mut fmt) })
            .map_err(|source| CaptureError::Ioctl { op: "VIDIOC_G_FMT", source })?;

        // SAFETY: the driver filled the `pix` member for a capture type
        let pix = unsafe { fmt.fmt.pix };
        let format = PixelFormat::from_fourcc(pix.pixelformat.to_le_bytes())?;
        let geometry = FrameGeometry::new(pix.width, pix.height, pix.bytesperline, format);

        info!(
            "Device: {} ({}), {:?} {}x{}",
            sys::c_str(&caps.card),
            sys::c_str(&caps.driver),
            format,
            geometry.width,
            geometry.height
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            format: StreamFormat { format, geometry },
            buffer_count: config.buffer_count.max(1),
            jpeg_quality: config.jpeg_quality,
            pool: BufferPool::default(),
            requested: false,
            streaming: false,
        })
    }

    fn fd(&self) -> c_int {
        self.file.as_raw_fd()
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, CaptureError> {
        let fd = self.fd();
        let mut req = V4l2RequestBuffers {
            count,
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: sys::V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        sys::retry(|| unsafe { sys::vidioc_reqbufs(fd, &mut req) })
            .map_err(|source| CaptureError::Ioctl { op: "VIDIOC_REQBUFS", source })?;
        Ok(req.count)
    }

    /// Hand buffer `index` to the driver.
    fn queue(&mut self, index: u32) -> Result<(), CaptureError> {
        let fd = self.fd();
        let mut buf = V4l2Buffer::mmap(index);
        self.pool.get_mut(index)?.expect_owner(BufferOwner::App)?;
        sys::retry(|| unsafe { sys::vidioc_qbuf(fd, &mut buf) })
            .map_err(|source| CaptureError::Ioctl { op: "VIDIOC_QBUF", source })?;
        self.pool.get_mut(index)?.mark_requeued()
    }

    fn allocate_and_stream(&mut self) -> Result<(), CaptureError> {
        let granted = self.request_buffers(self.buffer_count)?;
        self.requested = true;
        if granted == 0 {
            return Err(CaptureError::NoBuffers);
        }

        let fd = self.fd();
        for index in 0..granted {
            let mut buf = V4l2Buffer::mmap(index);
            sys::retry(|| unsafe { sys::vidioc_querybuf(fd, &mut buf) })
                .map_err(|source| CaptureError::Ioctl { op: "VIDIOC_QUERYBUF", source })?;

            // SAFETY: offset and length come from the driver for this fd;
            // the mapping is dropped before the buffers are freed.
            let map = unsafe {
                MmapOptions::new()
                    .offset(u64::from(buf.m.offset))
                    .len(buf.length as usize)
                    .map_mut(&self.file)?
            };
            self.pool.push(FrameBuffer::new(index, map));
            self.queue(index)?;
        }

        let kind = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        sys::retry(|| unsafe { sys::vidioc_streamon(fd, &kind) })
            .map_err(|source| CaptureError::Ioctl { op: "VIDIOC_STREAMON", source })?;
        self.streaming = true;

        info!(
            "Capture stream started on {} with {} buffers",
            self.path.display(),
            granted
        );
        Ok(())
    }

    /// Stream off, unmap, free. Returns whether anything was held.
    fn release(&mut self) -> bool {
        let fd = self.fd();
        let mut released = false;

        if self.streaming {
            let kind = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
            if let Err(e) = sys::retry(|| unsafe { sys::vidioc_streamoff(fd, &kind) }) {
                warn!("VIDIOC_STREAMOFF failed: {e}");
            }
            self.streaming = false;
            released = true;
        }

        // mappings must go before the driver frees the buffers
        released |= self.pool.release();

        if self.requested {
            if let Err(e) = self.request_buffers(0) {
                warn!("Freeing capture buffers failed: {e}");
            }
            self.requested = false;
            released = true;
        }

        released
    }

    /// Wait until a filled buffer is ready. `false` on timeout.
    fn wait_readable(&self, wait: Duration) -> Result<bool, CaptureError> {
        let millis = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                    return Err(CaptureError::Ioctl { op: "poll", source: Errno::EIO });
                }
                Ok(true)
            }
            Err(source) => Err(CaptureError::Ioctl { op: "poll", source }),
        }
    }
}

impl CaptureBackend for RawBufferBackend {
    fn name(&self) -> &'static str {
        "raw_buffer"
    }

    fn stream_format(&self) -> StreamFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.streaming {
            return Ok(());
        }
        let result = self.allocate_and_stream();
        if result.is_err() {
            self.release();
        }
        result
    }

    fn stop(&mut self) {
        if self.release() {
            debug!("Released capture buffers on {}", self.path.display());
        }
    }

    fn read_frame(&mut self, wait: Duration) -> Result<FrameRead, CaptureError> {
        if !self.streaming {
            return Err(CaptureError::NotStreaming);
        }
        if !self.wait_readable(wait)? {
            return Ok(FrameRead::TimedOut);
        }

        let fd = self.fd();
        let mut buf = V4l2Buffer::mmap(0);
        match sys::retry(|| unsafe { sys::vidioc_dqbuf(fd, &mut buf) }) {
            Ok(_) => {}
            Err(Errno::EAGAIN) => return Ok(FrameRead::TimedOut),
            Err(source) => return Err(CaptureError::Ioctl { op: "VIDIOC_DQBUF", source }),
        }

        let StreamFormat { format, geometry } = self.format;
        let encoded = {
            let frame = self.pool.get_mut(buf.index)?;
            frame.mark_dequeued(buf.bytesused as usize)?;
            encode_frame(frame.data()?, format, &geometry, self.jpeg_quality)
        };

        // the buffer goes back to the driver whether or not conversion worked
        self.queue(buf.index)?;
        Ok(FrameRead::Frame(encoded?))
    }
}

impl Drop for RawBufferBackend {
    fn drop(&mut self) {
        self.release();
    }
}
