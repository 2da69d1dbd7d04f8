//! Sonoscope: ultrasound acquisition sessions
//!
//! Orchestrates a multi-channel ultrasound front-end from the host side:
//! compiles a user-level imaging sequence into a hardware program, uploads
//! it through a hardware core, and delivers the acquired frames through a
//! fixed-size streaming buffer, optionally into a processing pipeline.
//!
//! - **Session**: lifecycle (upload, start, run, stop, close) and device lookup
//! - **Kernels**: sequence compilers keyed by sequence kind
//! - **StreamingBuffer**: ring of frame elements, never overwritten before release
//! - **ProcessingRunner**: worker thread draining the buffer through a pipeline
//! - **Core**: boundary to the front-end driver; `sim` implements it in-process

pub mod buffer;
pub mod hardware;
pub mod devices;
pub mod kernels;
pub mod metadata;
pub mod ops;
pub mod processing;
pub mod session;
pub mod sim;

#[cfg(test)]
pub(crate) mod test_support;

pub use buffer::{
    BufferElement, BufferError, BufferProducer, BufferState, BufferStatsSnapshot,
    BufferSubscription, Delivery, ElementState, StreamingBuffer,
};
pub use hardware::{CompiledScheme, CoreError, CoreSession, DeviceHandle, HardwareCore, UploadResult};
pub use devices::{
    ComputeCapabilities, Device, DeviceId, DeviceType, FileDevice, ProbeDescriptor, Us4R,
    UltrasoundDescriptor, UltrasoundDevice,
};
pub use kernels::{KernelError, KernelExecutionContext, KernelFn, KernelRegistry};
pub use metadata::{ConstMetadata, DataType, FrameAcquisitionContext, FrameMetadata};
pub use ops::{
    CustomSequence, DigitalDownConversion, LinSequence, Medium, Pulse, PwiSequence, Scheme,
    Sequence, SequenceKind, TxRxSequence,
};
pub use processing::{
    Frame, Gain, Lambda, ParameterDef, Pipeline, ProcessedFrame, Processing, ProcessingError,
    RunnerEvent, RunnerOutputs, SchemeProcessing, SelectFrames, Step, TerminationReason,
};
pub use session::{
    Session, SessionBuilder, SessionContext, SessionError, SessionRegistry, SessionState,
    UploadOutput,
};
pub use sim::SimulatedCore;
pub use sonoconf::{SonoConfig, WorkMode};
