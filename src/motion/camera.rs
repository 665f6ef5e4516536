//! PTZ and focus control of the camera

use tracing::{debug, instrument, warn};

use super::controls::{self, ControlCatalog, ControlInfo, ControlSurface};
use super::controls::{
    V4L2_CID_FOCUS_ABSOLUTE, V4L2_CID_FOCUS_AUTO, V4L2_CID_PAN_ABSOLUTE, V4L2_CID_PAN_RELATIVE,
    V4L2_CID_PAN_RESET, V4L2_CID_TILT_ABSOLUTE, V4L2_CID_TILT_RELATIVE, V4L2_CID_TILT_RESET,
    V4L2_CID_ZOOM_ABSOLUTE, V4L2_CID_ZOOM_RELATIVE,
};
use crate::error::ControlError;
use crate::records::{FocusRecord, PtzRecord};

/// One hardware-level command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionCommand {
    Pan(i64),
    Tilt(i64),
    Zoom(i64),
    FocusAuto(bool),
    FocusAbsolute(i64),
    Reset,
}

/// A motor axis and the controls that can move it by a step
struct Axis {
    name: &'static str,
    relative: u32,
    absolute: u32,
    prefer_absolute: bool,
}

const PAN: Axis = Axis {
    name: "pan",
    relative: V4L2_CID_PAN_RELATIVE,
    absolute: V4L2_CID_PAN_ABSOLUTE,
    prefer_absolute: false,
};

const TILT: Axis = Axis {
    name: "tilt",
    relative: V4L2_CID_TILT_RELATIVE,
    absolute: V4L2_CID_TILT_ABSOLUTE,
    prefer_absolute: false,
};

const ZOOM: Axis = Axis {
    name: "zoom",
    relative: V4L2_CID_ZOOM_RELATIVE,
    absolute: V4L2_CID_ZOOM_ABSOLUTE,
    prefer_absolute: true,
};

/// Issues PTZ and focus commands against one control surface.
///
/// Operations return the failures they ran into instead of stopping at the
/// first one, so callers see partial progress.
pub struct MotionController {
    surface: Box<dyn ControlSurface>,
    ptz: PtzRecord,
    last_commanded_zoom: i64,
    focus: FocusRecord,
}

impl MotionController {
    pub fn new(surface: Box<dyn ControlSurface>) -> Self {
        Self {
            surface,
            ptz: PtzRecord::default(),
            last_commanded_zoom: 0,
            focus: FocusRecord::default(),
        }
    }

    /// Last values accepted by `set_ptz`
    pub fn ptz(&self) -> PtzRecord {
        self.ptz
    }

    /// Last values accepted by `focus`
    pub fn focus_state(&self) -> FocusRecord {
        self.focus
    }

    pub fn last_commanded_zoom(&self) -> i64 {
        self.last_commanded_zoom
    }

    /// Send one command to the hardware.
    pub fn issue(&mut self, command: MotionCommand) -> Result<(), ControlError> {
        metrics::counter!("motion_commands").increment(1);
        debug!(?command, "Issuing motion command");
        match command {
            MotionCommand::Pan(delta) => self.step(&PAN, delta),
            MotionCommand::Tilt(delta) => self.step(&TILT, delta),
            MotionCommand::Zoom(delta) => self.step(&ZOOM, delta),
            MotionCommand::FocusAuto(auto) => self.surface.set(V4L2_CID_FOCUS_AUTO, i64::from(auto)),
            MotionCommand::FocusAbsolute(value) => {
                let info = self.require(V4L2_CID_FOCUS_ABSOLUTE, "focus_absolute")?;
                controls::set_clamped(self.surface.as_mut(), &info, value)
            }
            MotionCommand::Reset => self.reset_hardware(),
        }
    }

    fn require(&self, id: u32, name: &'static str) -> Result<ControlInfo, ControlError> {
        self.surface.query(id).ok_or(ControlError::Missing(name))
    }

    fn step(&mut self, axis: &Axis, delta: i64) -> Result<(), ControlError> {
        let relative = self.surface.query(axis.relative);
        let absolute = self.surface.query(axis.absolute);

        match (relative, absolute) {
            (Some(rel), Some(abs)) if axis.prefer_absolute => self.step_absolute(&abs, delta).or_else(|e| {
                debug!("{} absolute step failed ({e}), trying relative", axis.name);
                self.surface.set(rel.id, delta)
            }),
            (_, Some(abs)) if axis.prefer_absolute => self.step_absolute(&abs, delta),
            (Some(rel), _) => self.surface.set(rel.id, delta),
            (None, Some(abs)) => self.step_absolute(&abs, delta),
            (None, None) => Err(ControlError::Missing(axis.name)),
        }
    }

    fn step_absolute(&mut self, info: &ControlInfo, delta: i64) -> Result<(), ControlError> {
        let current = self.surface.get(info.id)?;
        controls::set_clamped(self.surface.as_mut(), info, current.saturating_add(delta))
    }

    fn reset_hardware(&mut self) -> Result<(), ControlError> {
        let mut touched = false;
        let mut first_error = None;

        for id in [V4L2_CID_PAN_RESET, V4L2_CID_TILT_RESET] {
            if self.surface.query(id).is_some() {
                touched = true;
                if let Err(e) = self.surface.set(id, 1) {
                    first_error.get_or_insert(e);
                }
            }
        }
        for id in [V4L2_CID_PAN_ABSOLUTE, V4L2_CID_TILT_ABSOLUTE, V4L2_CID_ZOOM_ABSOLUTE] {
            if let Some(info) = self.surface.query(id) {
                touched = true;
                if let Err(e) = self.surface.set(id, info.default) {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None if touched => Ok(()),
            None => Err(ControlError::Missing("pan/tilt/zoom")),
        }
    }

    /// Pan by `delta`.
    pub fn rotate(&mut self, delta: i64) -> Vec<String> {
        match self.issue(MotionCommand::Pan(delta)) {
            Ok(()) => Vec::new(),
            Err(e) => vec![format!("pan new value {delta} can't be set: {e}")],
        }
    }

    /// Tilt by `delta`.
    pub fn lift(&mut self, delta: i64) -> Vec<String> {
        match self.issue(MotionCommand::Tilt(delta)) {
            Ok(()) => Vec::new(),
            Err(e) => vec![format!("tilt new value {delta} can't be set: {e}")],
        }
    }

    /// Zoom to `absolute` by stepping from the last commanded zoom.
    ///
    /// The baseline moves to `absolute` even when the step fails, so after
    /// a failure the tracked zoom can differ from the lens position.
    pub fn zoom(&mut self, absolute: i64) -> Vec<String> {
        let delta = absolute - self.last_commanded_zoom;
        let result = self.issue(MotionCommand::Zoom(delta));
        self.last_commanded_zoom = absolute;

        match result {
            Ok(()) => Vec::new(),
            Err(e) => vec![format!("zoom new value {absolute} can't be set: {e}")],
        }
    }

    /// Set autofocus, and the absolute focus when `value` is given.
    pub fn focus(&mut self, auto: bool, value: Option<i64>) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = self.issue(MotionCommand::FocusAuto(auto)) {
            errors.push(format!("focus auto {auto} can't be set: {e}"));
        }
        if let Some(value) = value {
            if let Err(e) = self.issue(MotionCommand::FocusAbsolute(value)) {
                errors.push(format!("focus new value {value} can't be set: {e}"));
            }
        }

        self.focus.auto = auto;
        if value.is_some() {
            self.focus.value = value;
        }
        errors
    }

    /// Rotate, lift and zoom, in that order.
    #[instrument(skip(self))]
    pub fn set_ptz(&mut self, pan: i64, tilt: i64, zoom: i64) -> Vec<String> {
        let mut errors = self.rotate(pan);
        errors.extend(self.lift(tilt));
        errors.extend(self.zoom(zoom));

        self.ptz = PtzRecord { pan, tilt, zoom };
        if !errors.is_empty() {
            warn!(count = errors.len(), "PTZ command partially failed");
        }
        errors
    }

    /// Return pan, tilt and zoom to their defaults. The zoom baseline is
    /// left alone.
    pub fn reset(&mut self) -> Vec<String> {
        match self.issue(MotionCommand::Reset) {
            Ok(()) => Vec::new(),
            Err(e) => vec![format!("reset failed: {e}")],
        }
    }

    pub fn get_controls(&self, hierarchy: bool) -> Result<ControlCatalog, ControlError> {
        controls::catalog(self.surface.as_ref(), hierarchy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::controls::tests::{integer, FakeSurface};
    use crate::motion::controls::ControlKind;

    fn ptz_camera() -> FakeSurface {
        FakeSurface::with(vec![
            integer(V4L2_CID_PAN_RELATIVE, "Pan, Relative", -100, 100, 0),
            integer(V4L2_CID_TILT_RELATIVE, "Tilt, Relative", -100, 100, 0),
            integer(V4L2_CID_ZOOM_ABSOLUTE, "Zoom, Absolute", 0, 100, 0),
            integer(V4L2_CID_FOCUS_AUTO, "Focus, Automatic Continuous", 0, 1, 1),
            integer(V4L2_CID_FOCUS_ABSOLUTE, "Focus, Absolute", 0, 250, 0),
        ])
    }

    #[test]
    fn test_zoom_steps_from_baseline() {
        let surface = ptz_camera();
        let mut controller = MotionController::new(Box::new(surface.clone()));

        assert!(controller.zoom(7).is_empty());
        assert!(controller.zoom(3).is_empty());
        // absolute zoom control: 0 + 7, then 7 + (3 - 7)
        assert_eq!(
            surface.writes(),
            [(V4L2_CID_ZOOM_ABSOLUTE, 7), (V4L2_CID_ZOOM_ABSOLUTE, 3)]
        );
        assert_eq!(controller.last_commanded_zoom(), 3);
    }

    #[test]
    fn test_zoom_relative_step_is_the_difference() {
        let surface = FakeSurface::with(vec![integer(V4L2_CID_ZOOM_RELATIVE, "Zoom, Relative", -10, 10, 0)]);
        let mut controller = MotionController::new(Box::new(surface.clone()));

        for (a, b) in [(5, 2), (-4, 6), (0, 0)] {
            controller.zoom(a);
            controller.zoom(b);
            let writes = surface.writes();
            assert_eq!(writes.last(), Some(&(V4L2_CID_ZOOM_RELATIVE, b - a)));
        }
    }

    #[test]
    fn test_zoom_baseline_moves_even_on_failure() {
        let surface = ptz_camera().breaking(V4L2_CID_ZOOM_ABSOLUTE);
        let mut controller = MotionController::new(Box::new(surface));

        let errors = controller.zoom(5);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("zoom new value 5"));
        assert_eq!(controller.last_commanded_zoom(), 5);
    }

    #[test]
    fn test_set_ptz_concatenates_errors_in_order() {
        let surface = ptz_camera()
            .breaking(V4L2_CID_PAN_RELATIVE)
            .breaking(V4L2_CID_ZOOM_ABSOLUTE);
        let mut controller = MotionController::new(Box::new(surface.clone()));

        let errors = controller.set_ptz(10, -5, 2);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("pan"));
        assert!(errors[1].starts_with("zoom"));

        // tilt was still attempted between the two failures
        let ids: Vec<u32> = surface.writes().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [V4L2_CID_PAN_RELATIVE, V4L2_CID_TILT_RELATIVE, V4L2_CID_ZOOM_ABSOLUTE]);
        assert_eq!(controller.ptz(), PtzRecord { pan: 10, tilt: -5, zoom: 2 });
    }

    #[test]
    fn test_pan_falls_back_to_absolute_and_clamps() {
        let surface = FakeSurface::with(vec![integer(V4L2_CID_PAN_ABSOLUTE, "Pan, Absolute", -50, 50, 40)]);
        let mut controller = MotionController::new(Box::new(surface.clone()));

        assert!(controller.rotate(30).is_empty());
        assert_eq!(surface.writes(), [(V4L2_CID_PAN_ABSOLUTE, 50)]);
    }

    #[test]
    fn test_missing_axis_is_reported() {
        let mut controller = MotionController::new(Box::new(FakeSurface::default()));
        let errors = controller.lift(4);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("no tilt control"));
    }

    #[test]
    fn test_focus_failures_are_independent() {
        let surface = ptz_camera().breaking(V4L2_CID_FOCUS_AUTO);
        let mut controller = MotionController::new(Box::new(surface.clone()));

        let errors = controller.focus(false, Some(120));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("focus auto"));
        assert_eq!(surface.writes().last(), Some(&(V4L2_CID_FOCUS_ABSOLUTE, 120)));

        controller.focus(true, None);
        assert_eq!(controller.focus_state(), FocusRecord { auto: true, value: Some(120) });
    }

    #[test]
    fn test_reset_restores_defaults_and_keeps_baseline() {
        let mut button = integer(V4L2_CID_PAN_RESET, "Pan, Reset", 0, 0, 0);
        button.kind = ControlKind::Button;
        let surface = FakeSurface::with(vec![
            button,
            integer(V4L2_CID_ZOOM_ABSOLUTE, "Zoom, Absolute", 0, 100, 10),
        ]);
        let mut controller = MotionController::new(Box::new(surface.clone()));
        controller.zoom(40);

        assert!(controller.reset().is_empty());
        assert_eq!(
            &surface.writes()[1..],
            [(V4L2_CID_PAN_RESET, 1), (V4L2_CID_ZOOM_ABSOLUTE, 10)]
        );
        assert_eq!(controller.last_commanded_zoom(), 40);
    }

    #[test]
    fn test_reset_without_controls_fails() {
        let mut controller = MotionController::new(Box::new(FakeSurface::default()));
        assert_eq!(controller.reset().len(), 1);
    }
}
