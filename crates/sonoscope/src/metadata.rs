//! Constant metadata describing every frame of one upload.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::devices::{DataDescription, UltrasoundDescriptor};
use crate::ops::{Medium, Sequence, TxRxSequence};

/// Version tag stamped on metadata produced by this build.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int16,
    Float32,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int16 => "int16",
            Self::Float32 => "float32",
        }
    }
}

/// How the frames were acquired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameAcquisitionContext {
    pub device: UltrasoundDescriptor,
    pub sequence: Sequence,
    pub raw_sequence: TxRxSequence,
    pub medium: Medium,
    pub custom_data: BTreeMap<String, serde_json::Value>,
}

/// Shared, read-only description of an upload's frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstMetadata {
    pub context: FrameAcquisitionContext,
    pub data_description: DataDescription,
    pub input_shape: Vec<usize>,
    pub is_iq_data: bool,
    pub dtype: DataType,
    pub version: String,
}

impl ConstMetadata {
    pub fn new(
        context: FrameAcquisitionContext,
        data_description: DataDescription,
        input_shape: Vec<usize>,
        is_iq_data: bool,
    ) -> Self {
        Self {
            context,
            data_description,
            input_shape,
            is_iq_data,
            dtype: DataType::Int16,
            version: VERSION.to_string(),
        }
    }

    /// Copy with a different frame shape/type, as a processing step emits.
    pub fn with_output(&self, input_shape: Vec<usize>, dtype: DataType) -> Self {
        Self {
            input_shape,
            dtype,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Per-frame values extracted from the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameMetadata {
    /// Acquisition counter since upload
    pub frame_number: u64,
    /// Buffer element the frame arrived in
    pub position: usize,
    /// Trigger counter the front-end wrote into the first sample
    pub trigger_counter: i16,
}
