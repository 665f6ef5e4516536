//! Everything the request handlers share, built once at startup

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::capture::CaptureEngine;
use crate::error::StartupError;
use crate::motion::{
    ControlSurface, MotionController, MotionDispatcher, NullGpio, PinDriver, SysfsGpio,
    TrackDriveController, V4l2Controls,
};
use crate::pipeline::{EventBus, FrameStreamer};
use crate::{utils, Config};

/// Queued motion requests beyond this are refused
pub const MOTION_QUEUE_DEPTH: usize = 16;

pub struct AppContext {
    pub config: Config,
    pub streamer: FrameStreamer,
    pub motion: Arc<Mutex<MotionController>>,
    pub dispatcher: MotionDispatcher,
    pub tracks: Mutex<TrackDriveController>,
    pub events: EventBus,
    /// Fired once on shutdown; ends open streams
    pub shutdown: CancellationToken,
}

impl AppContext {
    /// Wire already-opened hardware together.
    pub fn new(
        config: Config,
        engine: CaptureEngine,
        surface: Box<dyn ControlSurface>,
        pins: Box<dyn PinDriver>,
    ) -> Result<Self, StartupError> {
        let shutdown = CancellationToken::new();
        let events = EventBus::new(config.events.capacity);
        let motion = Arc::new(Mutex::new(MotionController::new(surface)));
        let dispatcher = MotionDispatcher::spawn(motion.clone(), events.clone(), MOTION_QUEUE_DEPTH)?;
        let tracks = TrackDriveController::new(config.tracks.pins, pins)?;

        Ok(Self {
            streamer: FrameStreamer::new(engine, shutdown.clone()),
            motion,
            dispatcher,
            tracks: Mutex::new(tracks),
            events,
            shutdown,
            config,
        })
    }

    /// Select and open the camera, its controls and the track GPIO.
    pub fn open(config: Config) -> Result<Self, StartupError> {
        let device = utils::resolve_device(&config.capture)?;
        let engine = CaptureEngine::open(&device, &config.capture)?;
        let controls = V4l2Controls::open(&device)?;
        info!(ptz = controls.has_ptz(), "Camera controls ready");

        let pins: Box<dyn PinDriver> = if config.tracks.gpio {
            Box::new(SysfsGpio::new(&config.tracks.sysfs_root))
        } else {
            Box::new(NullGpio::new())
        };

        Self::new(config, engine, Box::new(controls), pins)
    }
}
