pub mod camera;
pub mod controls;
pub mod dispatch;
pub mod gpio;
pub mod track;

pub use camera::{MotionCommand, MotionController};
pub use controls::{ControlCatalog, ControlSurface, V4l2Controls};
pub use dispatch::{MotionDispatcher, MotionRequest, Ticket};
pub use gpio::{NullGpio, PinDriver, SysfsGpio};
pub use track::{Maneuver, TrackDriveController, TrackPins};
