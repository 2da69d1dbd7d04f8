//! Devices reachable from a session.
//!
//! Devices are addressed by logical paths of the form `/<Type>:<ordinal>`,
//! e.g. `/Ultrasound:0`, `/Us4R:0`, `/CPU:0`, `/GPU:0`.
//!
//! ```text
//! path ──► DeviceId ──► hardware core ──► DeviceHandle{id: Us4R:0}
//!                                              │
//!                                  Device::from_handle (closed table)
//!                                              │
//!                             ┌────────────────┼───────────────┐
//!                             ▼                ▼               ▼
//!                        Device::Us4R     Device::File    (unsupported tag
//!                                                          → None)
//! ```
//!
//! `/Ultrasound:<n>` is an alias the core resolves to whichever concrete
//! front-end the session was configured with.

pub mod compute;
pub mod file;
pub mod probe;
pub mod ultrasound;
pub mod us4r;

pub use compute::{ComputeCapabilities, ComputeDevice, GpuInfo};
pub use file::FileDevice;
pub use probe::ProbeDescriptor;
pub use ultrasound::{
    DataDescription, FrameChannelMapping, FrameChannelMappingBuilder, MappingEntry,
    UltrasoundDescriptor, UltrasoundDevice, UNAVAILABLE_CHANNEL,
};
pub use us4r::Us4R;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::hardware::DeviceHandle;

/// Every device-type tag a session knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Alias for the session's front-end, whatever it is.
    Ultrasound,
    Us4R,
    File,
    Us4OEM,
    Probe,
    Cpu,
    Gpu,
}

impl DeviceType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Ultrasound" => Some(Self::Ultrasound),
            "Us4R" => Some(Self::Us4R),
            "File" => Some(Self::File),
            "Us4OEM" => Some(Self::Us4OEM),
            "Probe" => Some(Self::Probe),
            "CPU" => Some(Self::Cpu),
            "GPU" => Some(Self::Gpu),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ultrasound => "Ultrasound",
            Self::Us4R => "Us4R",
            Self::File => "File",
            Self::Us4OEM => "Us4OEM",
            Self::Probe => "Probe",
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
        }
    }
}

/// Device identifier: type tag plus ordinal. Displays as `Us4R:0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub device_type: DeviceType,
    pub ordinal: u32,
}

impl DeviceId {
    pub const fn new(device_type: DeviceType, ordinal: u32) -> Self {
        Self {
            device_type,
            ordinal,
        }
    }

    /// Parse a logical path such as `/Us4R:0`.
    pub fn parse_path(path: &str) -> Option<Self> {
        let rest = path.strip_prefix('/')?;
        let (tag, ordinal) = rest.split_once(':')?;
        Some(Self::new(DeviceType::parse(tag)?, ordinal.parse().ok()?))
    }

    pub fn path(&self) -> String {
        format!("/{}", self)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type.as_str(), self.ordinal)
    }
}

/// A typed device wrapper, shared by every `get_device` caller.
#[derive(Debug, Clone)]
pub enum Device {
    Us4R(Arc<Us4R>),
    File(Arc<FileDevice>),
    Compute(Arc<ComputeDevice>),
}

impl Device {
    /// Build the wrapper matching a core-provided handle.
    ///
    /// Only front-ends with a wrapper are accepted; returns `None` for any
    /// other tag (e.g. a bare `Us4OEM` module).
    pub fn from_handle(handle: DeviceHandle) -> Option<Self> {
        match handle.id.device_type {
            DeviceType::Us4R => Some(Self::Us4R(Arc::new(Us4R::new(handle)))),
            DeviceType::File => Some(Self::File(Arc::new(FileDevice::new(handle)))),
            DeviceType::Ultrasound
            | DeviceType::Us4OEM
            | DeviceType::Probe
            | DeviceType::Cpu
            | DeviceType::Gpu => None,
        }
    }

    pub fn id(&self) -> DeviceId {
        match self {
            Self::Us4R(device) => *device.id(),
            Self::File(device) => *device.id(),
            Self::Compute(device) => device.id(),
        }
    }

    /// The front-end capability view, if this is an ultrasound device.
    pub fn as_ultrasound(&self) -> Option<Arc<dyn UltrasoundDevice>> {
        match self {
            Self::Us4R(device) => Some(device.clone() as Arc<dyn UltrasoundDevice>),
            Self::File(device) => Some(device.clone() as Arc<dyn UltrasoundDevice>),
            Self::Compute(_) => None,
        }
    }

    /// True when both values wrap the same instance.
    pub fn ptr_eq(&self, other: &Device) -> bool {
        match (self, other) {
            (Self::Us4R(a), Self::Us4R(b)) => Arc::ptr_eq(a, b),
            (Self::File(a), Self::File(b)) => Arc::ptr_eq(a, b),
            (Self::Compute(a), Self::Compute(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
