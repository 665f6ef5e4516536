pub mod convert;
pub mod engine;
pub mod frame;
pub mod mmap;
pub mod v4l2;

pub use engine::{CaptureBackend, CaptureEngine, FrameRead, TimeoutPolicy};
pub use frame::{PixelFormat, StreamFormat};
pub use mmap::RawBufferBackend;
pub use v4l2::LibraryBackend;
