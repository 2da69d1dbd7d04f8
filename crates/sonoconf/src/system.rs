//! System configuration - describes the ultrasound front-end a session talks to.
//!
//! These values seed the hardware core when a session is created. After
//! that, the uploaded scheme is the source of truth for anything it sets
//! (buffer size, work mode).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which front-end the session connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    /// us4R / us4R-lite: synthesized frames from the acquisition engine.
    #[default]
    Us4r,
    /// Replay of frames recorded to a raw int16 file.
    File,
}

impl SystemKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "us4r" | "us4r-lite" => Some(Self::Us4r),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Us4r => "us4r",
            Self::File => "file",
        }
    }
}

/// How acquisitions are triggered once a scheme is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    /// One acquisition pass per `run()` call.
    Manual,
    /// Continuous; the next acquisition is triggered by a buffer element release.
    #[default]
    Host,
    /// Continuous; acquisitions are paced by the sequence PRI, not by consumers.
    Async,
}

impl WorkMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "host" => Some(Self::Host),
            "async" => Some(Self::Async),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Host => "host",
            Self::Async => "async",
        }
    }
}

/// Probe attached to the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Model name, e.g. "L3-9i-D".
    #[serde(default = "ProbeConfig::default_model")]
    pub model: String,

    /// Number of transducer elements.
    #[serde(default = "ProbeConfig::default_n_elements")]
    pub n_elements: u32,

    /// Distance between element centers [m].
    #[serde(default = "ProbeConfig::default_pitch")]
    pub pitch: f64,

    /// Nominal transducer center frequency [Hz].
    #[serde(default = "ProbeConfig::default_center_frequency")]
    pub center_frequency: f64,
}

impl ProbeConfig {
    fn default_model() -> String {
        "L3-9i-D".to_string()
    }

    fn default_n_elements() -> u32 {
        192
    }

    fn default_pitch() -> f64 {
        0.2e-3
    }

    fn default_center_frequency() -> f64 {
        6e6
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            n_elements: Self::default_n_elements(),
            pitch: Self::default_pitch(),
            center_frequency: Self::default_center_frequency(),
        }
    }
}

/// Acquisition defaults applied when the scheme leaves them unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default)]
    pub work_mode: WorkMode,

    /// Number of elements in the host streaming buffer.
    /// Default: 4
    #[serde(default = "AcquisitionConfig::default_buffer_elements")]
    pub buffer_elements: u32,

    /// Invalidate the buffer and stop acquiring when the producer finds no
    /// free element. When false, the overflowing frame is reported and skipped.
    /// Default: true
    #[serde(default = "AcquisitionConfig::default_stop_on_overflow")]
    pub stop_on_overflow: bool,
}

impl AcquisitionConfig {
    fn default_buffer_elements() -> u32 {
        4
    }

    fn default_stop_on_overflow() -> bool {
        true
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            work_mode: WorkMode::default(),
            buffer_elements: Self::default_buffer_elements(),
            stop_on_overflow: Self::default_stop_on_overflow(),
        }
    }
}

/// Replay source for the `file` system kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Raw little-endian int16 dataset, frames stored back to back.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Number of frames stored in the file.
    #[serde(default)]
    pub n_frames: u32,
}

/// Compute devices available to processing pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// GPU ordinal to expose as `/GPU:<n>`; `None` disables GPU discovery.
    #[serde(default = "ComputeConfig::default_gpu_ordinal")]
    pub gpu_ordinal: Option<u32>,

    /// Device node probed to decide whether the GPU is present.
    #[serde(default = "ComputeConfig::default_gpu_device_node")]
    pub gpu_device_node: PathBuf,
}

impl ComputeConfig {
    fn default_gpu_ordinal() -> Option<u32> {
        Some(0)
    }

    fn default_gpu_device_node() -> PathBuf {
        PathBuf::from("/dev/nvidia0")
    }
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            gpu_ordinal: Self::default_gpu_ordinal(),
            gpu_device_node: Self::default_gpu_device_node(),
        }
    }
}

/// Complete description of the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub kind: SystemKind,

    /// ADC sampling frequency [Hz].
    /// Default: 65 MHz
    #[serde(default = "SystemConfig::default_sampling_frequency")]
    pub sampling_frequency: f64,

    /// Number of us4OEM modules.
    #[serde(default = "SystemConfig::default_n_modules")]
    pub n_modules: u32,

    /// Receive channels handled by one module at a time.
    #[serde(default = "SystemConfig::default_channels_per_module")]
    pub channels_per_module: u32,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub file: FileConfig,

    #[serde(default)]
    pub compute: ComputeConfig,
}

impl SystemConfig {
    fn default_sampling_frequency() -> f64 {
        65e6
    }

    fn default_n_modules() -> u32 {
        2
    }

    fn default_channels_per_module() -> u32 {
        32
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            kind: SystemKind::default(),
            sampling_frequency: Self::default_sampling_frequency(),
            n_modules: Self::default_n_modules(),
            channels_per_module: Self::default_channels_per_module(),
            probe: ProbeConfig::default(),
            acquisition: AcquisitionConfig::default(),
            file: FileConfig::default(),
            compute: ComputeConfig::default(),
        }
    }
}
