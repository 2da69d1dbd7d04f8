//! Frame processing attached to an upload.
//!
//! A scheme carries either a bare [`Pipeline`] or a full [`Processing`]
//! wrapper; both become a `Processing` before the runner sees them.

pub mod pipeline;
pub mod runner;

pub use pipeline::{
    Frame, Gain, Lambda, ParameterDef, ParameterHandle, ParameterTable, Pipeline, SelectFrames,
    Step,
};
pub use runner::{
    ProcessedFrame, ProcessingRunner, RunnerEvent, RunnerOutputs, RunnerStats, TerminationReason,
};

use std::fmt;
use thiserror::Error;

use crate::buffer::BufferError;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("pipeline has no steps")]
    EmptyPipeline,

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("parameter {0} declared twice")]
    DuplicateParameter(String),

    #[error("invalid value for {name}: {message}")]
    InvalidParameter { name: String, message: String },

    #[error("step {step}: {message}")]
    Step { step: String, message: String },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("failed to spawn processing thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("processing worker is gone")]
    WorkerLost,
}

/// Invoked on the processing thread for every output frame.
pub type FrameCallback = Box<dyn FnMut(&ProcessedFrame) + Send>;

/// A pipeline plus how its outputs are delivered.
pub struct Processing {
    pub pipeline: Pipeline,
    pub callback: Option<FrameCallback>,
    /// Attach per-frame metadata (frame number, trigger counter) to outputs.
    pub extract_metadata: bool,
}

impl Processing {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            callback: None,
            extract_metadata: false,
        }
    }

    pub fn with_callback(mut self, callback: impl FnMut(&ProcessedFrame) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_metadata_extraction(mut self) -> Self {
        self.extract_metadata = true;
        self
    }
}

impl fmt::Debug for Processing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processing")
            .field("pipeline", &self.pipeline)
            .field("callback", &self.callback.is_some())
            .field("extract_metadata", &self.extract_metadata)
            .finish()
    }
}

/// The processing field of a scheme.
#[derive(Debug)]
pub enum SchemeProcessing {
    Pipeline(Pipeline),
    Processing(Processing),
}

impl SchemeProcessing {
    /// A bare pipeline gets no callback and no metadata extraction.
    pub fn into_processing(self) -> Processing {
        match self {
            Self::Pipeline(pipeline) => Processing::new(pipeline),
            Self::Processing(processing) => processing,
        }
    }
}

impl From<Pipeline> for SchemeProcessing {
    fn from(pipeline: Pipeline) -> Self {
        Self::Pipeline(pipeline)
    }
}

impl From<Processing> for SchemeProcessing {
    fn from(processing: Processing) -> Self {
        Self::Processing(processing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_pipeline_promoted() {
        let processing = SchemeProcessing::from(Pipeline::new().with_step(Gain::new(1.0)))
            .into_processing();
        assert!(processing.callback.is_none());
        assert!(!processing.extract_metadata);
        assert_eq!(processing.pipeline.len(), 1);
    }

    #[test]
    fn test_processing_kept_as_is() {
        let processing = Processing::new(Pipeline::new())
            .with_callback(|_| {})
            .with_metadata_extraction();
        let converted = SchemeProcessing::from(processing).into_processing();
        assert!(converted.callback.is_some());
        assert!(converted.extract_metadata);
    }
}
