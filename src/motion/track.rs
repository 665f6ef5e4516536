//! Differential drive over two tracks

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::gpio::PinDriver;
use crate::error::GpioError;
use crate::records::Heading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Back,
}

/// What one track is doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TrackMotion {
    #[default]
    Stopped,
    Forward,
    Back,
}

impl From<Direction> for TrackMotion {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Forward => TrackMotion::Forward,
            Direction::Back => TrackMotion::Back,
        }
    }
}

/// Which GPIO pin drives each track in each direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackPins {
    pub left_forward: u8,
    pub left_back: u8,
    pub right_forward: u8,
    pub right_back: u8,
}

impl Default for TrackPins {
    fn default() -> Self {
        Self {
            left_forward: 2,
            left_back: 1,
            right_forward: 0,
            right_back: 3,
        }
    }
}

impl TrackPins {
    /// (forward, back) pins of a side
    pub fn of(&self, side: Side) -> (u8, u8) {
        match side {
            Side::Left => (self.left_forward, self.left_back),
            Side::Right => (self.right_forward, self.right_back),
        }
    }

    pub fn all(&self) -> [u8; 4] {
        [self.left_forward, self.left_back, self.right_forward, self.right_back]
    }
}

/// A drive intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maneuver {
    /// Both tracks the same way
    Shift(Direction),
    /// Turn toward a side on the spot
    Rotate(Side),
    Stop,
    /// Recognised but not acted on
    Hold,
}

impl From<Heading> for Maneuver {
    fn from(heading: Heading) -> Self {
        match heading {
            Heading::North => Maneuver::Shift(Direction::Forward),
            Heading::South => Maneuver::Shift(Direction::Back),
            Heading::East => Maneuver::Rotate(Side::Right),
            Heading::West => Maneuver::Rotate(Side::Left),
            Heading::Center => Maneuver::Stop,
            Heading::NorthEast | Heading::NorthWest | Heading::SouthEast | Heading::SouthWest => {
                Maneuver::Hold
            }
        }
    }
}

pub struct TrackDriveController {
    pins: TrackPins,
    driver: Box<dyn PinDriver>,
    left: TrackMotion,
    right: TrackMotion,
}

impl TrackDriveController {
    /// Configure all four pins as outputs, driven low.
    pub fn new(pins: TrackPins, mut driver: Box<dyn PinDriver>) -> Result<Self, GpioError> {
        for pin in pins.all() {
            driver.configure_output(pin)?;
            driver.write(pin, false)?;
        }
        info!(?pins, "Track controller ready");
        Ok(Self {
            pins,
            driver,
            left: TrackMotion::Stopped,
            right: TrackMotion::Stopped,
        })
    }

    pub fn state(&self, side: Side) -> TrackMotion {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    fn set_state(&mut self, side: Side, motion: TrackMotion) {
        match side {
            Side::Left => self.left = motion,
            Side::Right => self.right = motion,
        }
    }

    /// Run one track. The opposite pin goes low before the target goes high.
    fn drive(&mut self, side: Side, direction: Direction) -> Result<(), GpioError> {
        let (forward, back) = self.pins.of(side);
        let (target, opposite) = match direction {
            Direction::Forward => (forward, back),
            Direction::Back => (back, forward),
        };
        self.driver.write(opposite, false)?;
        self.driver.write(target, true)?;
        self.set_state(side, direction.into());
        Ok(())
    }

    /// Straight line.
    pub fn shift(&mut self, direction: Direction) -> Result<(), GpioError> {
        debug!(?direction, "shift");
        self.drive(Side::Left, direction)?;
        self.drive(Side::Right, direction)
    }

    /// Spin toward `side`: that track reverses, the other advances.
    pub fn rotate(&mut self, side: Side) -> Result<(), GpioError> {
        debug!(?side, "rotate");
        let (left, right) = match side {
            Side::Left => (Direction::Back, Direction::Forward),
            Side::Right => (Direction::Forward, Direction::Back),
        };
        self.drive(Side::Left, left)?;
        self.drive(Side::Right, right)
    }

    pub fn stop(&mut self) -> Result<(), GpioError> {
        debug!("stop");
        for side in [Side::Left, Side::Right] {
            let (forward, back) = self.pins.of(side);
            self.driver.write(forward, false)?;
            self.driver.write(back, false)?;
            self.set_state(side, TrackMotion::Stopped);
        }
        Ok(())
    }

    /// Carry out a maneuver. Returns `false` for [`Maneuver::Hold`], which
    /// touches no pins.
    pub fn apply(&mut self, maneuver: Maneuver) -> Result<bool, GpioError> {
        match maneuver {
            Maneuver::Shift(direction) => self.shift(direction)?,
            Maneuver::Rotate(side) => self.rotate(side)?,
            Maneuver::Stop => self.stop()?,
            Maneuver::Hold => return Ok(false),
        }
        Ok(true)
    }
}
