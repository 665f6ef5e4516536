pub mod capture;
pub mod context;
pub mod error;
pub mod motion;
pub mod pipeline;
pub mod records;
pub mod sys;
pub mod utils;
pub mod web;

use std::path::{Path, PathBuf};

use capture::frame::PixelFormat;
use motion::track::TrackPins;
use serde::{Deserialize, Serialize};

/// Service configuration.
///
/// Layered as built-in defaults, then a TOML file, then `ROVER__*`
/// environment variables (`ROVER__SERVER__PORT=9000`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub events: EventsConfig,
    pub tracks: TracksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long open streams get to wind down after a shutdown signal
    pub shutdown_grace_secs: u64,
}

/// Which capture backend drives the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Library,
    RawBuffer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Skip discovery and use this node
    pub device: Option<PathBuf>,
    pub backend: BackendKind,
    // requested from the driver by the library backend
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Bounded wait for a single dequeue
    pub dequeue_timeout_ms: u64,
    /// Misses in a row before a stream is ended
    pub max_consecutive_timeouts: u32,
    pub jpeg_quality: u8,
    /// Only consider PTZ cameras first during discovery
    pub ptz_only: bool,
    pub scan_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
    /// How often an idle event reader wakes up to check its peer
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracksConfig {
    /// Drive real pins through sysfs; otherwise writes are only logged
    pub gpio: bool,
    pub sysfs_root: PathBuf,
    pub pins: TrackPins,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            shutdown_grace_secs: 3,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            backend: BackendKind::RawBuffer,
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            dequeue_timeout_ms: 250,
            max_consecutive_timeouts: 8,
            jpeg_quality: 85,
            ptz_only: true,
            scan_dir: "/dev".into(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for TracksConfig {
    fn default() -> Self {
        Self {
            gpio: false,
            sysfs_root: "/sys/class/gpio".into(),
            pins: TrackPins::default(),
        }
    }
}

impl Config {
    /// Default file looked up in the working directory
    pub const DEFAULT_FILE: &'static str = "rover.toml";

    /// Load configuration. An explicit `path` must exist; the default file
    /// is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(Self::DEFAULT_FILE).required(false),
        };

        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("ROVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
