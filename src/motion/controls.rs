//! V4L2 camera controls: enumeration, get/set, and the client catalog
//!
//! Control names follow the kernel's, flattened to snake_case keys
//! ("Pan, Absolute" becomes `pan_absolute`).

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::errno::Errno;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::sys::{self, V4l2Control, V4l2Queryctrl, V4L2_CTRL_FLAG_NEXT_CTRL};

// ===== Control classes =====
const V4L2_CTRL_CLASS_USER: u32 = 0x0098_0000;
const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a_0000;
const V4L2_CTRL_CLASS_MASK: u32 = 0x0fff_0000;

const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

// ===== Camera class controls =====
pub const V4L2_CID_PAN_RELATIVE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 4;
pub const V4L2_CID_TILT_RELATIVE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 5;
pub const V4L2_CID_PAN_RESET: u32 = V4L2_CID_CAMERA_CLASS_BASE + 6;
pub const V4L2_CID_TILT_RESET: u32 = V4L2_CID_CAMERA_CLASS_BASE + 7;
pub const V4L2_CID_PAN_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 8;
pub const V4L2_CID_TILT_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 9;
pub const V4L2_CID_FOCUS_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 10;
pub const V4L2_CID_FOCUS_RELATIVE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 11;
/// Continuous autofocus on/off
pub const V4L2_CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;
pub const V4L2_CID_ZOOM_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 13;
pub const V4L2_CID_ZOOM_RELATIVE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 14;
pub const V4L2_CID_ZOOM_CONTINUOUS: u32 = V4L2_CID_CAMERA_CLASS_BASE + 15;
pub const V4L2_CID_PAN_SPEED: u32 = V4L2_CID_CAMERA_CLASS_BASE + 32;
pub const V4L2_CID_TILT_SPEED: u32 = V4L2_CID_CAMERA_CLASS_BASE + 33;

/// Any of these makes a camera a PTZ camera
pub const PTZ_CONTROLS: [u32; 9] = [
    V4L2_CID_PAN_RELATIVE,
    V4L2_CID_TILT_RELATIVE,
    V4L2_CID_PAN_ABSOLUTE,
    V4L2_CID_TILT_ABSOLUTE,
    V4L2_CID_ZOOM_ABSOLUTE,
    V4L2_CID_ZOOM_RELATIVE,
    V4L2_CID_ZOOM_CONTINUOUS,
    V4L2_CID_PAN_SPEED,
    V4L2_CID_TILT_SPEED,
];

// ===== Control types =====
const V4L2_CTRL_TYPE_INTEGER: u32 = 1;
const V4L2_CTRL_TYPE_BOOLEAN: u32 = 2;
const V4L2_CTRL_TYPE_MENU: u32 = 3;
const V4L2_CTRL_TYPE_BUTTON: u32 = 4;
const V4L2_CTRL_TYPE_INTEGER64: u32 = 5;
const V4L2_CTRL_TYPE_CTRL_CLASS: u32 = 6;
const V4L2_CTRL_TYPE_STRING: u32 = 7;
const V4L2_CTRL_TYPE_BITMASK: u32 = 8;
const V4L2_CTRL_TYPE_INTEGER_MENU: u32 = 9;

// ===== Control flags =====
const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;
const V4L2_CTRL_FLAG_READ_ONLY: u32 = 0x0004;
const V4L2_CTRL_FLAG_INACTIVE: u32 = 0x0010;
const V4L2_CTRL_FLAG_WRITE_ONLY: u32 = 0x0040;
const V4L2_CTRL_FLAG_VOLATILE: u32 = 0x0080;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Integer,
    Boolean,
    Menu,
    Button,
    Integer64,
    Class,
    String,
    Bitmask,
    IntegerMenu,
    Unknown(u32),
}

impl From<u32> for ControlKind {
    fn from(value: u32) -> Self {
        match value {
            V4L2_CTRL_TYPE_INTEGER => ControlKind::Integer,
            V4L2_CTRL_TYPE_BOOLEAN => ControlKind::Boolean,
            V4L2_CTRL_TYPE_MENU => ControlKind::Menu,
            V4L2_CTRL_TYPE_BUTTON => ControlKind::Button,
            V4L2_CTRL_TYPE_INTEGER64 => ControlKind::Integer64,
            V4L2_CTRL_TYPE_CTRL_CLASS => ControlKind::Class,
            V4L2_CTRL_TYPE_STRING => ControlKind::String,
            V4L2_CTRL_TYPE_BITMASK => ControlKind::Bitmask,
            V4L2_CTRL_TYPE_INTEGER_MENU => ControlKind::IntegerMenu,
            other => ControlKind::Unknown(other),
        }
    }
}

impl ControlKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlKind::Integer => "integer",
            ControlKind::Boolean => "boolean",
            ControlKind::Menu => "menu",
            ControlKind::Button => "button",
            ControlKind::Integer64 => "integer64",
            ControlKind::Class => "class",
            ControlKind::String => "string",
            ControlKind::Bitmask => "bitmask",
            ControlKind::IntegerMenu => "integer_menu",
            ControlKind::Unknown(_) => "unknown",
        }
    }
}

/// Metadata of one device control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub kind: ControlKind,
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub default: i64,
    pub flags: u32,
}

impl ControlInfo {
    pub fn class(&self) -> u32 {
        self.id & V4L2_CTRL_CLASS_MASK
    }

    pub fn is_inactive(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_INACTIVE != 0
    }

    pub fn is_readonly(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_READ_ONLY != 0
    }

    /// Controls whose value cannot be saved and written back later:
    /// actions, relative moves, and anything the driver changes on its own.
    pub fn is_unrestorable(&self) -> bool {
        matches!(self.kind, ControlKind::Button)
            || self.flags & (V4L2_CTRL_FLAG_WRITE_ONLY | V4L2_CTRL_FLAG_VOLATILE) != 0
            || matches!(
                self.id,
                V4L2_CID_PAN_RELATIVE
                    | V4L2_CID_TILT_RELATIVE
                    | V4L2_CID_FOCUS_RELATIVE
                    | V4L2_CID_ZOOM_RELATIVE
                    | V4L2_CID_ZOOM_CONTINUOUS
                    | V4L2_CID_PAN_SPEED
                    | V4L2_CID_TILT_SPEED
            )
    }

    /// Whether a current value can be read back.
    fn has_value(&self) -> bool {
        !matches!(self.kind, ControlKind::Button | ControlKind::Class)
            && self.flags & V4L2_CTRL_FLAG_WRITE_ONLY == 0
    }

    fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min, self.max.max(self.min))
    }

    fn from_raw(raw: &V4l2Queryctrl) -> Self {
        Self {
            id: raw.id,
            name: sys::c_str(&raw.name),
            kind: ControlKind::from(raw.type_),
            min: raw.minimum.into(),
            max: raw.maximum.into(),
            step: raw.step.into(),
            default: raw.default_value.into(),
            flags: raw.flags,
        }
    }
}

/// Something that exposes camera controls
pub trait ControlSurface: Send {
    /// All enabled controls, class headings included.
    fn describe(&self) -> Result<Vec<ControlInfo>, ControlError>;

    fn get(&self, id: u32) -> Result<i64, ControlError>;

    fn set(&mut self, id: u32, value: i64) -> Result<(), ControlError>;

    fn query(&self, id: u32) -> Option<ControlInfo> {
        self.describe().ok()?.into_iter().find(|c| c.id == id)
    }

    fn has_ptz(&self) -> bool {
        PTZ_CONTROLS.iter().any(|&id| self.query(id).is_some())
    }
}

/// Controls of a V4L2 device node, driven with raw ioctls
pub struct V4l2Controls {
    file: File,
}

impl V4l2Controls {
    pub fn open(path: &Path) -> Result<Self, ControlError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| ControlError::Unavailable {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Opened controls of {}", path.display());
        Ok(Self { file })
    }

    fn queryctrl(&self, id: u32) -> Result<V4l2Queryctrl, Errno> {
        let fd = self.file.as_raw_fd();
        let mut raw = V4l2Queryctrl::new(id);
        sys::retry(|| unsafe { sys::vidioc_queryctrl(fd, &mut raw) })?;
        Ok(raw)
    }
}

impl ControlSurface for V4l2Controls {
    fn describe(&self) -> Result<Vec<ControlInfo>, ControlError> {
        let mut controls = Vec::new();
        let mut next = V4L2_CTRL_FLAG_NEXT_CTRL;
        loop {
            let raw = match self.queryctrl(next) {
                Ok(raw) => raw,
                Err(Errno::EINVAL) => break,
                Err(source) => {
                    return Err(ControlError::Ioctl {
                        op: "VIDIOC_QUERYCTRL",
                        id: next & !V4L2_CTRL_FLAG_NEXT_CTRL,
                        source,
                    })
                }
            };
            if raw.flags & V4L2_CTRL_FLAG_DISABLED == 0 {
                controls.push(ControlInfo::from_raw(&raw));
            }
            next = raw.id | V4L2_CTRL_FLAG_NEXT_CTRL;
        }
        Ok(controls)
    }

    fn query(&self, id: u32) -> Option<ControlInfo> {
        let raw = self.queryctrl(id).ok()?;
        (raw.flags & V4L2_CTRL_FLAG_DISABLED == 0).then(|| ControlInfo::from_raw(&raw))
    }

    fn get(&self, id: u32) -> Result<i64, ControlError> {
        let fd = self.file.as_raw_fd();
        let mut ctrl = V4l2Control { id, value: 0 };
        sys::retry(|| unsafe { sys::vidioc_g_ctrl(fd, &mut ctrl) })
            .map_err(|source| ControlError::Ioctl { op: "VIDIOC_G_CTRL", id, source })?;
        Ok(ctrl.value.into())
    }

    fn set(&mut self, id: u32, value: i64) -> Result<(), ControlError> {
        let fd = self.file.as_raw_fd();
        let value = i32::try_from(value).map_err(|_| ControlError::OutOfRange { id, value })?;
        let mut ctrl = V4l2Control { id, value };
        sys::retry(|| unsafe { sys::vidioc_s_ctrl(fd, &mut ctrl) })
            .map_err(|source| ControlError::Ioctl { op: "VIDIOC_S_CTRL", id, source })?;
        Ok(())
    }
}

/// Clamp `value` into the control's range before writing it.
pub fn set_clamped(
    surface: &mut dyn ControlSurface,
    info: &ControlInfo,
    value: i64,
) -> Result<(), ControlError> {
    surface.set(info.id, info.clamp(value))
}

/// Flat `pan_absolute`-style key for a kernel control name.
pub fn control_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.is_empty() && !key.ends_with('_') {
            key.push('_');
        }
    }
    while key.ends_with('_') {
        key.pop();
    }
    key
}

fn tooltip(id: u32) -> &'static str {
    match id {
        V4L2_CID_PAN_ABSOLUTE => "Horizontal position, arc seconds",
        V4L2_CID_TILT_ABSOLUTE => "Vertical position, arc seconds",
        V4L2_CID_PAN_RELATIVE => "Move horizontally by this many arc seconds",
        V4L2_CID_TILT_RELATIVE => "Move vertically by this many arc seconds",
        V4L2_CID_PAN_RESET => "Return to the horizontal home position",
        V4L2_CID_TILT_RESET => "Return to the vertical home position",
        V4L2_CID_ZOOM_ABSOLUTE => "Focal length",
        V4L2_CID_ZOOM_RELATIVE => "Change focal length by this many steps",
        V4L2_CID_ZOOM_CONTINUOUS => "Zoom speed, sign gives the direction",
        V4L2_CID_FOCUS_AUTO => "Continuous automatic focus",
        V4L2_CID_FOCUS_ABSOLUTE => "Lens focus distance",
        _ => "",
    }
}

fn class_title(class: u32) -> String {
    match class {
        V4L2_CTRL_CLASS_USER => "User Controls".into(),
        V4L2_CTRL_CLASS_CAMERA => "Camera Controls".into(),
        other => format!("Controls {other:#010x}"),
    }
}

/// One control as shown to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlEntry {
    pub name: String,
    pub tooltip: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub value: Option<i64>,
    pub min: i64,
    pub max: i64,
    pub default: i64,
    pub step: i64,
    pub inactive: bool,
    pub readonly: bool,
    pub unrestorable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlPage {
    pub title: String,
    pub controls: BTreeMap<String, ControlEntry>,
}

/// Controls keyed by name, optionally grouped into pages per control class
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlCatalog {
    Flat(BTreeMap<String, ControlEntry>),
    Pages(Vec<ControlPage>),
}

/// Read every control and its current value.
pub fn catalog(surface: &dyn ControlSurface, hierarchy: bool) -> Result<ControlCatalog, ControlError> {
    let described = surface.describe()?;

    let mut titles = BTreeMap::new();
    let mut entries = Vec::new();
    for info in described {
        if info.kind == ControlKind::Class {
            titles.insert(info.class(), info.name);
            continue;
        }

        let value = if info.has_value() {
            match surface.get(info.id) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Reading {} failed: {e}", info.name);
                    None
                }
            }
        } else {
            None
        };

        let entry = ControlEntry {
            tooltip: tooltip(info.id),
            kind: info.kind.as_str(),
            value,
            min: info.min,
            max: info.max,
            default: info.default,
            step: info.step,
            inactive: info.is_inactive(),
            readonly: info.is_readonly(),
            unrestorable: info.is_unrestorable(),
            name: info.name.clone(),
        };
        entries.push((info.class(), control_key(&info.name), entry));
    }

    if !hierarchy {
        return Ok(ControlCatalog::Flat(
            entries.into_iter().map(|(_, key, entry)| (key, entry)).collect(),
        ));
    }

    let mut pages: BTreeMap<u32, ControlPage> = BTreeMap::new();
    for (class, key, entry) in entries {
        pages
            .entry(class)
            .or_insert_with(|| ControlPage {
                title: titles.get(&class).cloned().unwrap_or_else(|| class_title(class)),
                controls: BTreeMap::new(),
            })
            .controls
            .insert(key, entry);
    }
    Ok(ControlCatalog::Pages(pages.into_values().collect()))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// In-memory control surface that records every write.
    #[derive(Clone, Default)]
    pub(crate) struct FakeSurface {
        pub controls: Vec<ControlInfo>,
        pub values: Arc<Mutex<HashMap<u32, i64>>>,
        pub writes: Arc<Mutex<Vec<(u32, i64)>>>,
        /// Writes to these ids fail
        pub broken: Vec<u32>,
    }

    pub(crate) fn integer(id: u32, name: &str, min: i64, max: i64, default: i64) -> ControlInfo {
        ControlInfo {
            id,
            name: name.into(),
            kind: ControlKind::Integer,
            min,
            max,
            step: 1,
            default,
            flags: 0,
        }
    }

    impl FakeSurface {
        pub fn with(controls: Vec<ControlInfo>) -> Self {
            let surface = Self {
                controls,
                ..Default::default()
            };
            {
                let mut values = surface.values.lock().unwrap();
                for c in &surface.controls {
                    values.insert(c.id, c.default);
                }
            }
            surface
        }

        pub fn breaking(mut self, id: u32) -> Self {
            self.broken.push(id);
            self
        }

        pub fn writes(&self) -> Vec<(u32, i64)> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl ControlSurface for FakeSurface {
        fn describe(&self) -> Result<Vec<ControlInfo>, ControlError> {
            Ok(self.controls.clone())
        }

        fn get(&self, id: u32) -> Result<i64, ControlError> {
            self.values
                .lock()
                .unwrap()
                .get(&id)
                .copied()
                .ok_or(ControlError::Missing("fake"))
        }

        fn set(&mut self, id: u32, value: i64) -> Result<(), ControlError> {
            self.writes.lock().unwrap().push((id, value));
            if self.broken.contains(&id) {
                return Err(ControlError::Ioctl {
                    op: "VIDIOC_S_CTRL",
                    id,
                    source: Errno::EIO,
                });
            }
            self.values.lock().unwrap().insert(id, value);
            Ok(())
        }
    }

    #[test]
    fn test_control_keys() {
        assert_eq!(control_key("Pan, Absolute"), "pan_absolute");
        assert_eq!(control_key("Focus, Automatic Continuous"), "focus_automatic_continuous");
        assert_eq!(control_key("White Balance Temperature, Auto"), "white_balance_temperature_auto");
        assert_eq!(control_key("  Zoom (Relative) "), "zoom_relative");
    }

    #[test]
    fn test_ptz_detection() {
        let plain = FakeSurface::with(vec![integer(0x0098_0900, "Brightness", 0, 255, 128)]);
        assert!(!plain.has_ptz());

        let ptz = FakeSurface::with(vec![integer(V4L2_CID_ZOOM_ABSOLUTE, "Zoom, Absolute", 0, 10, 0)]);
        assert!(ptz.has_ptz());
    }

    #[test]
    fn test_flat_catalog() {
        let mut reset = integer(V4L2_CID_PAN_RESET, "Pan, Reset", 0, 0, 0);
        reset.kind = ControlKind::Button;
        let surface = FakeSurface::with(vec![
            integer(V4L2_CID_PAN_ABSOLUTE, "Pan, Absolute", -36000, 36000, 0),
            reset,
        ]);

        let ControlCatalog::Flat(flat) = catalog(&surface, false).unwrap() else {
            panic!("expected a flat catalog");
        };
        let pan = &flat["pan_absolute"];
        assert_eq!(pan.name, "Pan, Absolute");
        assert_eq!(pan.kind, "integer");
        assert_eq!(pan.value, Some(0));
        assert_eq!((pan.min, pan.max), (-36000, 36000));
        assert!(!pan.unrestorable);

        let reset = &flat["pan_reset"];
        assert_eq!(reset.value, None);
        assert!(reset.unrestorable);
    }

    #[test]
    fn test_hierarchy_groups_by_class() {
        let mut heading = integer(V4L2_CTRL_CLASS_CAMERA | 1, "Camera Controls", 0, 0, 0);
        heading.kind = ControlKind::Class;
        let surface = FakeSurface::with(vec![
            integer(0x0098_0900, "Brightness", 0, 255, 128),
            heading,
            integer(V4L2_CID_ZOOM_ABSOLUTE, "Zoom, Absolute", 0, 10, 0),
            integer(V4L2_CID_TILT_ABSOLUTE, "Tilt, Absolute", -100, 100, 0),
        ]);

        let ControlCatalog::Pages(pages) = catalog(&surface, true).unwrap() else {
            panic!("expected pages");
        };
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].title, "User Controls");
        assert!(pages[0].controls.contains_key("brightness"));
        assert_eq!(pages[1].title, "Camera Controls");
        assert_eq!(
            pages[1].controls.keys().collect::<Vec<_>>(),
            ["tilt_absolute", "zoom_absolute"]
        );
    }
}
