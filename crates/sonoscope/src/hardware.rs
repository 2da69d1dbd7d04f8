//! Hardware core boundary.
//!
//! The core owns the physical (or simulated) front-end: it takes a compiled
//! program, allocates the streaming buffer frames are written to, resolves
//! device paths and drives triggering. Sessions only ever talk to it
//! through these traits, so a real driver can replace [`crate::sim`].
//!
//! ```text
//! Session::upload ──► CompiledScheme ──► CoreSession::upload ──► UploadResult
//!                                                                 ├─ StreamingBuffer
//!                                                                 └─ FrameChannelMapping
//! ```

use sonoconf::{SonoConfig, WorkMode};
use std::path::PathBuf;
use thiserror::Error;

use crate::buffer::{BufferError, StreamingBuffer};
use crate::devices::{DeviceId, FrameChannelMapping, ProbeDescriptor};
use crate::ops::{DigitalDownConversion, TxRxSequence};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The core refused the program (shape, size or mode it cannot run).
    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("no scheme uploaded")]
    NotUploaded,

    #[error("failed to open frame source {path}: {source}")]
    Source {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(std::io::Error),
}

/// A program ready for the front-end, plus how to stream it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledScheme {
    pub sequence: TxRxSequence,
    pub digital_down_conversion: Option<DigitalDownConversion>,
    /// Streaming buffer capacity
    pub n_elements: u32,
    pub work_mode: WorkMode,
    pub stop_on_overflow: bool,
}

/// What the core hands back for an upload.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub buffer: StreamingBuffer,
    /// Where each logical channel was acquired. `None` for replayed data.
    pub frame_channel_mapping: Option<FrameChannelMapping>,
}

/// Core-side description of a device, turned into a wrapper by
/// [`crate::devices::Device::from_handle`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub probe: ProbeDescriptor,
    pub sampling_frequency: f64,
    pub n_modules: u32,
    pub channels_per_module: u32,
    /// Recording backing a `File` device.
    pub source: Option<PathBuf>,
}

/// Entry point of a hardware core.
pub trait HardwareCore: Send + Sync {
    /// Connect to the front-end described by `config`.
    fn create_session(&self, config: &SonoConfig) -> Result<Box<dyn CoreSession>, CoreError>;
}

/// One connection to a front-end.
///
/// Calls arrive from a single controlling thread; the session state
/// machine has already checked ordering by the time they get here.
pub trait CoreSession: Send {
    /// Load a program and allocate its output buffer.
    ///
    /// A previous upload's buffer is shut down first.
    fn upload(&mut self, scheme: &CompiledScheme) -> Result<UploadResult, CoreError>;

    /// Resolve a device id. `Ultrasound:n` resolves to the configured
    /// front-end.
    fn get_device(&self, id: &DeviceId) -> Result<DeviceHandle, CoreError>;

    /// Arm the front-end. Nothing is acquired until `run`.
    fn start_scheme(&mut self) -> Result<(), CoreError>;

    /// Stop triggering. The buffer stays allocated.
    fn stop_scheme(&mut self) -> Result<(), CoreError>;

    /// MANUAL: acquire one frame. HOST/ASYNC: start continuous triggering.
    fn run(&mut self) -> Result<(), CoreError>;

    /// Stop and release everything, including the buffer.
    fn close(&mut self) -> Result<(), CoreError>;
}
