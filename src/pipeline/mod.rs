pub mod events;
pub mod streamer;

pub use events::{Consumed, EventBus};
pub use streamer::FrameStreamer;
