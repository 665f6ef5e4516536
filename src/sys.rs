//! Raw V4L2 ABI used by the raw-buffer backend and the control surface.
//!
//! Only the structures and requests this crate issues are declared. Layouts
//! follow `linux/videodev2.h`; the ioctl numbers are derived by nix from the
//! struct sizes, so they are correct on both 32- and 64-bit targets.

use std::os::raw::{c_int, c_ulong, c_void};

use nix::errno::Errno;
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

pub const V4L2_CTRL_FLAG_NEXT_CTRL: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

impl V4l2Capability {
    /// Capabilities of this node, not of the whole physical device.
    pub fn node_caps(&self) -> u32 {
        if self.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2FormatUnion {
    pub pix: V4l2PixFormat,
    pub raw_data: [u8; 200],
    // v4l2_window carries pointers, which sets the union alignment
    _align: [*mut c_void; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: V4l2FormatUnion,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferM {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl V4l2Buffer {
    /// A zeroed mmap capture buffer descriptor for `index`.
    pub fn mmap(index: u32) -> Self {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut buf: Self = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        buf
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Control {
    pub id: u32,
    pub value: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Queryctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

impl V4l2Queryctrl {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            type_: 0,
            name: [0; 32],
            minimum: 0,
            maximum: 0,
            step: 0,
            default_value: 0,
            flags: 0,
            reserved: [0; 2],
        }
    }
}

ioctl_read!(vidioc_querycap, b'V', 0, V4l2Capability);
ioctl_readwrite!(vidioc_g_fmt, b'V', 4, V4l2Format);
ioctl_readwrite!(vidioc_reqbufs, b'V', 8, V4l2RequestBuffers);
ioctl_readwrite!(vidioc_querybuf, b'V', 9, V4l2Buffer);
ioctl_readwrite!(vidioc_qbuf, b'V', 15, V4l2Buffer);
ioctl_readwrite!(vidioc_dqbuf, b'V', 17, V4l2Buffer);
ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);
ioctl_readwrite!(vidioc_g_ctrl, b'V', 27, V4l2Control);
ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, V4l2Control);
ioctl_readwrite!(vidioc_queryctrl, b'V', 36, V4l2Queryctrl);

/// Retry an ioctl interrupted by a signal.
pub fn retry<F>(mut call: F) -> nix::Result<c_int>
where
    F: FnMut() -> nix::Result<c_int>,
{
    loop {
        match call() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Null-terminated C string in a fixed-size field.
pub fn c_str(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}
