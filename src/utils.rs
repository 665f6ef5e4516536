use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};
use v4l::{capability::Flags, Device};

use crate::error::StartupError;
use crate::motion::controls::{ControlSurface, V4l2Controls};
use crate::CaptureConfig;

/// Lock a mutex, carrying on with the data if a holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoundDevice {
    pub path: PathBuf,
    pub card: String,
    pub has_ptz: bool,
}

impl FoundDevice {
    pub fn new(path: impl Into<PathBuf>, card: impl Into<String>, has_ptz: bool) -> Self {
        Self {
            path: path.into(),
            card: card.into(),
            has_ptz,
        }
    }
}

/// `video*` nodes under `dir`, sorted by name.
pub fn video_nodes(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        warn!("Cannot read {}", dir.display());
        return Vec::new();
    };
    let mut nodes: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("video"))
        .map(|e| e.path())
        .collect();
    nodes.sort();
    nodes
}

/// Probe every video node in `dir` for capture and PTZ support.
pub fn discover_devices(dir: &Path) -> Vec<FoundDevice> {
    info!("Scanning {} for capture devices...", dir.display());

    let mut found = Vec::new();
    for path in video_nodes(dir) {
        let Ok(dev) = Device::with_path(&path) else {
            debug!("Skipping {}: cannot open", path.display());
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("Skipping {}: not a capture node", path.display());
            continue;
        }

        let has_ptz = match V4l2Controls::open(&path) {
            Ok(controls) => controls.has_ptz(),
            Err(e) => {
                warn!("{e}");
                false
            }
        };
        info!("Found {} - {} [PTZ = {}]", path.display(), caps.card, has_ptz);
        found.push(FoundDevice::new(path, caps.card, has_ptz));
    }
    found
}

/// PTZ cameras first when `prefer_ptz`, otherwise the first device.
pub fn select_device(found: &[FoundDevice], prefer_ptz: bool) -> Option<&FoundDevice> {
    let ptz = prefer_ptz.then(|| found.iter().find(|d| d.has_ptz)).flatten();
    ptz.or_else(|| found.first())
}

/// The configured device, or the best one discovered.
pub fn resolve_device(config: &CaptureConfig) -> Result<PathBuf, StartupError> {
    if let Some(path) = &config.device {
        info!("Using configured capture device {}", path.display());
        return Ok(path.clone());
    }

    let found = discover_devices(&config.scan_dir);
    let device = select_device(&found, config.ptz_only).ok_or_else(|| StartupError::NoDevice {
        dir: config.scan_dir.clone(),
    })?;
    if !device.has_ptz {
        warn!("No PTZ camera found, falling back to {}", device.path.display());
    }
    Ok(device.path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptz_device_is_preferred() {
        let found = [
            FoundDevice::new("/dev/video0", "Integrated", false),
            FoundDevice::new("/dev/video2", "PTZ Pro", true),
        ];
        assert_eq!(select_device(&found, true).unwrap().path, Path::new("/dev/video2"));
        assert_eq!(select_device(&found, false).unwrap().path, Path::new("/dev/video0"));
    }

    #[test]
    fn test_falls_back_to_first_device() {
        let found = [
            FoundDevice::new("/dev/video0", "Integrated", false),
            FoundDevice::new("/dev/video1", "USB", false),
        ];
        assert_eq!(select_device(&found, true).unwrap().path, Path::new("/dev/video0"));
        assert!(select_device(&[], true).is_none());
    }

    #[test]
    fn test_empty_scan_dir_means_no_device() {
        let dir = std::env::temp_dir().join(format!("rover-scan-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("not-a-camera")).unwrap();

        let config = CaptureConfig {
            scan_dir: dir.clone(),
            ..CaptureConfig::default()
        };
        let err = resolve_device(&config).unwrap_err();
        assert_eq!(err.exit_code(), 3);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_configured_device_skips_scan() {
        let config = CaptureConfig {
            device: Some("/dev/video7".into()),
            scan_dir: "/nonexistent".into(),
            ..CaptureConfig::default()
        };
        assert_eq!(resolve_device(&config).unwrap(), Path::new("/dev/video7"));
    }
}
