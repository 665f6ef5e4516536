//! Error types shared across the capture, motion and startup paths

use std::path::PathBuf;

use nix::errno::Errno;

use crate::capture::mmap::BufferOwner;

/// Errors raised by capture backends and the capture engine
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture device {} is unavailable: {source}", .path.display())]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} cannot stream video: {reason}", .path.display())]
    NotCaptureDevice { path: PathBuf, reason: &'static str },

    #[error("unsupported pixel format {fourcc}; supported formats: {supported}")]
    UnsupportedFormat {
        fourcc: String,
        supported: &'static str,
    },

    #[error("device did not allocate any capture buffers")]
    NoBuffers,

    #[error("capture stream is not started")]
    NotStreaming,

    #[error("driver returned unknown buffer index {0}")]
    UnknownBuffer(u32),

    #[error("buffer {index} is {owner:?}-owned, expected {expected:?}")]
    BufferOwnership {
        index: u32,
        owner: BufferOwner,
        expected: BufferOwner,
    },

    #[error("short frame: {got} bytes, expected at least {expected}")]
    ShortFrame { expected: usize, got: usize },

    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: Errno,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

impl CaptureError {
    /// Transient errors cost one frame; everything else ends the stream.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::ShortFrame { .. }
                | CaptureError::Ioctl { .. }
                | CaptureError::Io(_)
                | CaptureError::Encode(_)
        )
    }
}

/// Errors raised by a camera control surface
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control device {} is unavailable: {source}", .path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device has no {0} control")]
    Missing(&'static str),

    #[error("value {value} is out of range for control {id:#010x}")]
    OutOfRange { id: u32, value: i64 },

    #[error("{op} on control {id:#010x} failed: {source}")]
    Ioctl {
        op: &'static str,
        id: u32,
        #[source]
        source: Errno,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("GPIO {pin}: {action} failed: {source}")]
    Io {
        pin: u8,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("motion queue is full, command rejected")]
    QueueFull,

    #[error("motion worker has stopped")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("a capture session is already active on this device")]
    Busy,
}

/// Fatal errors that stop the process before it starts serving
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("no capture devices found in {}", .dir.display())]
    NoDevice { dir: PathBuf },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Controls(#[from] ControlError),

    #[error(transparent)]
    Gpio(#[from] GpioError),

    #[error("startup I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StartupError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(_) => 2,
            StartupError::NoDevice { .. } => 3,
            StartupError::Capture(CaptureError::UnsupportedFormat { .. }) => 5,
            StartupError::Capture(_) | StartupError::Controls(_) => 4,
            StartupError::Gpio(_) => 6,
            StartupError::Io(_) => 1,
        }
    }
}
