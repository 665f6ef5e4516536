//! Digital output pins for the track motors

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::GpioError;

/// Output-only access to GPIO pins
pub trait PinDriver: Send {
    fn configure_output(&mut self, pin: u8) -> Result<(), GpioError>;

    fn write(&mut self, pin: u8, high: bool) -> Result<(), GpioError>;
}

/// Pins through the kernel's sysfs GPIO interface
pub struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }
}

impl PinDriver for SysfsGpio {
    fn configure_output(&mut self, pin: u8) -> Result<(), GpioError> {
        if !self.pin_dir(pin).exists() {
            fs::write(self.root.join("export"), pin.to_string()).map_err(|source| GpioError::Io {
                pin,
                action: "export",
                source,
            })?;
        }
        fs::write(self.pin_dir(pin).join("direction"), "out").map_err(|source| GpioError::Io {
            pin,
            action: "set direction",
            source,
        })
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<(), GpioError> {
        let level = if high { "1" } else { "0" };
        fs::write(self.pin_dir(pin).join("value"), level).map_err(|source| GpioError::Io {
            pin,
            action: "write",
            source,
        })
    }
}

/// Stand-in used when GPIO is disabled; writes are only logged.
pub struct NullGpio;

impl NullGpio {
    pub fn new() -> Self {
        warn!("GPIO disabled, track commands will not move anything");
        Self
    }
}

impl Default for NullGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl PinDriver for NullGpio {
    fn configure_output(&mut self, pin: u8) -> Result<(), GpioError> {
        debug!(pin, "configure output (no-op)");
        Ok(())
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<(), GpioError> {
        debug!(pin, high, "write (no-op)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(pins: &[u8]) -> PathBuf {
        let root = std::env::temp_dir().join(format!("rover-gpio-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();
        for pin in pins {
            fs::create_dir_all(root.join(format!("gpio{pin}"))).unwrap();
        }
        root
    }

    #[test]
    fn test_sysfs_writes_direction_and_value() {
        let root = fake_sysfs(&[4]);
        let mut gpio = SysfsGpio::new(&root);

        gpio.configure_output(4).unwrap();
        gpio.write(4, true).unwrap();
        assert_eq!(fs::read_to_string(root.join("gpio4/direction")).unwrap(), "out");
        assert_eq!(fs::read_to_string(root.join("gpio4/value")).unwrap(), "1");

        gpio.write(4, false).unwrap();
        assert_eq!(fs::read_to_string(root.join("gpio4/value")).unwrap(), "0");

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_unexported_pin_is_exported_first() {
        let root = fake_sysfs(&[]);
        let mut gpio = SysfsGpio::new(&root);

        // nothing creates gpio7/ here, so setting the direction must fail
        let err = gpio.configure_output(7).unwrap_err();
        assert_eq!(fs::read_to_string(root.join("export")).unwrap(), "7");
        assert!(matches!(err, GpioError::Io { pin: 7, action: "set direction", .. }));

        fs::remove_dir_all(root).unwrap();
    }
}
