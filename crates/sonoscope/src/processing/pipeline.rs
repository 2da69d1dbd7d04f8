//! Processing pipelines: ordered steps plus a shared parameter table.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

use super::ProcessingError;
use crate::devices::{DeviceId, DeviceType};
use crate::metadata::{ConstMetadata, DataType};

/// Description of a tunable pipeline parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterDef {
    pub name: String,
    pub shape: Vec<usize>,
    /// Inclusive bounds every value must respect
    pub range: Option<(f64, f64)>,
    pub description: String,
}

impl ParameterDef {
    pub fn scalar(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: vec![1],
            range: None,
            description: description.into(),
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Number of values the parameter holds.
    pub fn n_values(&self) -> usize {
        self.shape.iter().product()
    }

    fn check(&self, values: &[f64]) -> Result<(), ProcessingError> {
        if values.len() != self.n_values() {
            return Err(ProcessingError::InvalidParameter {
                name: self.name.clone(),
                message: format!("expected {} values, got {}", self.n_values(), values.len()),
            });
        }
        if let Some((min, max)) = self.range {
            if let Some(v) = values.iter().find(|v| !(min..=max).contains(*v)) {
                return Err(ProcessingError::InvalidParameter {
                    name: self.name.clone(),
                    message: format!("{} outside [{}, {}]", v, min, max),
                });
            }
        }
        Ok(())
    }
}

/// Declared parameters and their current values.
#[derive(Debug, Default)]
pub struct ParameterTable {
    defs: BTreeMap<String, ParameterDef>,
    values: BTreeMap<String, Vec<f64>>,
}

impl ParameterTable {
    pub fn declare(&mut self, def: ParameterDef, default: Vec<f64>) -> Result<(), ProcessingError> {
        if self.defs.contains_key(&def.name) {
            return Err(ProcessingError::DuplicateParameter(def.name));
        }
        def.check(&default)?;
        self.values.insert(def.name.clone(), default);
        self.defs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|values| values.first().copied())
    }

    pub fn set(&mut self, name: &str, values: &[f64]) -> Result<(), ProcessingError> {
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| ProcessingError::UnknownParameter(name.to_string()))?;
        def.check(values)?;
        self.values.insert(name.to_string(), values.to_vec());
        Ok(())
    }

    pub fn defs(&self) -> &BTreeMap<String, ParameterDef> {
        &self.defs
    }
}

/// Shared handle to a pipeline's parameter table.
///
/// The controlling thread sets values while the processing thread reads
/// them; a value set mid-frame applies to that frame or the next one.
#[derive(Debug, Clone, Default)]
pub struct ParameterHandle(Arc<RwLock<ParameterTable>>);

impl ParameterHandle {
    pub fn get_parameters(&self) -> BTreeMap<String, ParameterDef> {
        self.read().defs().clone()
    }

    pub fn get_parameter(&self, name: &str) -> Option<Vec<f64>> {
        self.read().get(name).map(<[f64]>::to_vec)
    }

    pub fn set_parameter(&self, name: &str, values: &[f64]) -> Result<(), ProcessingError> {
        self.write().set(name, values)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ParameterTable> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ParameterTable> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One frame flowing through a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Frame {
    pub fn from_i16(samples: &[i16], shape: &[usize]) -> Self {
        Self {
            data: samples.iter().map(|&s| s as f32).collect(),
            shape: shape.to_vec(),
        }
    }
}

/// A single stage of a pipeline.
pub trait Step: Send {
    fn name(&self) -> &str;

    /// Parameters the step reads, with their defaults.
    fn parameters(&self) -> Vec<(ParameterDef, Vec<f64>)> {
        Vec::new()
    }

    /// Check the input description and derive the output one.
    fn prepare(&mut self, metadata: &ConstMetadata) -> Result<ConstMetadata, ProcessingError>;

    fn process(&mut self, frame: Frame, parameters: &ParameterTable) -> Result<Frame, ProcessingError>;
}

type LambdaFn = Box<dyn FnMut(Frame) -> Result<Frame, ProcessingError> + Send>;

/// Arbitrary per-frame function. Output shape is assumed to match the input.
pub struct Lambda {
    name: String,
    func: LambdaFn,
}

impl Lambda {
    pub fn new(
        name: impl Into<String>,
        func: impl FnMut(Frame) -> Result<Frame, ProcessingError> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl Step for Lambda {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self, metadata: &ConstMetadata) -> Result<ConstMetadata, ProcessingError> {
        Ok(metadata.with_output(metadata.input_shape.clone(), DataType::Float32))
    }

    fn process(&mut self, frame: Frame, _parameters: &ParameterTable) -> Result<Frame, ProcessingError> {
        (self.func)(frame)
    }
}

/// Multiplies every sample by the `gain` parameter.
pub struct Gain {
    default: f64,
}

impl Gain {
    pub const PARAMETER: &'static str = "gain";

    pub fn new(default: f64) -> Self {
        Self { default }
    }
}

impl Step for Gain {
    fn name(&self) -> &str {
        "Gain"
    }

    fn parameters(&self) -> Vec<(ParameterDef, Vec<f64>)> {
        vec![(
            ParameterDef::scalar(Self::PARAMETER, "linear gain applied to every sample")
                .with_range(0.0, 1e3),
            vec![self.default],
        )]
    }

    fn prepare(&mut self, metadata: &ConstMetadata) -> Result<ConstMetadata, ProcessingError> {
        Ok(metadata.with_output(metadata.input_shape.clone(), DataType::Float32))
    }

    fn process(&mut self, mut frame: Frame, parameters: &ParameterTable) -> Result<Frame, ProcessingError> {
        let gain = parameters.scalar(Self::PARAMETER).unwrap_or(self.default) as f32;
        frame.data.iter_mut().for_each(|s| *s *= gain);
        Ok(frame)
    }
}

/// Keeps the listed transmit events (first axis), in the given order.
pub struct SelectFrames {
    frames: Vec<usize>,
}

impl SelectFrames {
    pub fn new(frames: Vec<usize>) -> Self {
        Self { frames }
    }
}

impl Step for SelectFrames {
    fn name(&self) -> &str {
        "SelectFrames"
    }

    fn prepare(&mut self, metadata: &ConstMetadata) -> Result<ConstMetadata, ProcessingError> {
        let step_error = |message: String| ProcessingError::Step {
            step: "SelectFrames".to_string(),
            message,
        };
        let (&n_frames, rest) = metadata
            .input_shape
            .split_first()
            .ok_or_else(|| step_error("input has no frame axis".to_string()))?;
        if self.frames.is_empty() {
            return Err(step_error("no frames selected".to_string()));
        }
        if let Some(bad) = self.frames.iter().find(|&&f| f >= n_frames) {
            return Err(step_error(format!("frame {} out of {}", bad, n_frames)));
        }

        let mut shape = Vec::with_capacity(metadata.input_shape.len());
        shape.push(self.frames.len());
        shape.extend_from_slice(rest);
        Ok(metadata.with_output(shape, DataType::Float32))
    }

    fn process(&mut self, frame: Frame, _parameters: &ParameterTable) -> Result<Frame, ProcessingError> {
        let stride: usize = frame.shape.iter().skip(1).product();
        let mut data = Vec::with_capacity(stride * self.frames.len());
        for &f in &self.frames {
            let chunk = frame.data.get(f * stride..(f + 1) * stride).ok_or_else(|| {
                ProcessingError::Step {
                    step: "SelectFrames".to_string(),
                    message: format!("frame {} missing from input of shape {:?}", f, frame.shape),
                }
            })?;
            data.extend_from_slice(chunk);
        }
        let mut shape = frame.shape;
        shape[0] = self.frames.len();
        Ok(Frame { data, shape })
    }
}

/// Ordered steps executed on one compute device.
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
    placement: DeviceId,
    parameters: ParameterHandle,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            placement: DeviceId::new(DeviceType::Cpu, 0),
            parameters: ParameterHandle::default(),
        }
    }

    /// Append a step and declare its parameters.
    ///
    /// A parameter name already declared by an earlier step keeps its
    /// first declaration.
    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        {
            let mut table = self.parameters.write();
            for (def, default) in step.parameters() {
                let name = def.name.clone();
                if let Err(e) = table.declare(def, default) {
                    warn!("step {}: parameter {} not declared: {}", step.name(), name, e);
                }
            }
        }
        self.steps.push(Box::new(step));
        self
    }

    /// Run the pipeline on `device` (`/CPU:0` by default).
    pub fn placed_on(mut self, device: DeviceId) -> Self {
        self.placement = device;
        self
    }

    pub fn placement(&self) -> DeviceId {
        self.placement
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn parameters(&self) -> &ParameterHandle {
        &self.parameters
    }

    pub fn get_parameters(&self) -> BTreeMap<String, ParameterDef> {
        self.parameters.get_parameters()
    }

    pub fn get_parameter(&self, name: &str) -> Option<Vec<f64>> {
        self.parameters.get_parameter(name)
    }

    pub fn set_parameter(&self, name: &str, values: &[f64]) -> Result<(), ProcessingError> {
        self.parameters.set_parameter(name, values)
    }

    /// Thread the input description through every step.
    pub fn prepare(&mut self, metadata: &ConstMetadata) -> Result<ConstMetadata, ProcessingError> {
        if self.steps.is_empty() {
            return Err(ProcessingError::EmptyPipeline);
        }
        let mut current = metadata.clone();
        for step in &mut self.steps {
            current = step.prepare(&current)?;
        }
        Ok(current)
    }

    pub fn process(&mut self, frame: Frame) -> Result<Frame, ProcessingError> {
        let table = self.parameters.read();
        let mut frame = frame;
        for step in &mut self.steps {
            frame = step.process(frame, &table)?;
        }
        Ok(frame)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.step_names())
            .field("placement", &self.placement)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::metadata_with_shape;

    #[test]
    fn test_parameters_declared_by_steps() {
        let pipeline = Pipeline::new()
            .with_step(Gain::new(2.0))
            .with_step(SelectFrames::new(vec![0]));
        let params = pipeline.get_parameters();
        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["gain"]);
        assert_eq!(pipeline.get_parameter("gain"), Some(vec![2.0]));
    }

    #[test]
    fn test_set_parameter_validates() {
        let pipeline = Pipeline::new().with_step(Gain::new(1.0));
        pipeline.set_parameter("gain", &[4.0]).unwrap();
        assert_eq!(pipeline.get_parameter("gain"), Some(vec![4.0]));

        assert!(matches!(
            pipeline.set_parameter("gain", &[1.0, 2.0]),
            Err(ProcessingError::InvalidParameter { .. })
        ));
        assert!(matches!(
            pipeline.set_parameter("gain", &[-1.0]),
            Err(ProcessingError::InvalidParameter { .. })
        ));
        assert!(matches!(
            pipeline.set_parameter("offset", &[1.0]),
            Err(ProcessingError::UnknownParameter(_))
        ));
    }

    #[test]
    fn test_prepare_and_process() {
        let mut pipeline = Pipeline::new()
            .with_step(SelectFrames::new(vec![2, 0]))
            .with_step(Gain::new(10.0));
        let output = pipeline.prepare(&metadata_with_shape(vec![3, 2, 2])).unwrap();
        assert_eq!(output.input_shape, vec![2, 2, 2]);
        assert_eq!(output.dtype, DataType::Float32);

        let samples: Vec<i16> = (0..12).collect();
        let frame = Frame::from_i16(&samples, &[3, 2, 2]);
        let out = pipeline.process(frame).unwrap();
        assert_eq!(out.shape, vec![2, 2, 2]);
        assert_eq!(out.data, vec![80.0, 90.0, 100.0, 110.0, 0.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_select_frames_out_of_range() {
        let mut pipeline = Pipeline::new().with_step(SelectFrames::new(vec![5]));
        assert!(matches!(
            pipeline.prepare(&metadata_with_shape(vec![3, 2, 2])),
            Err(ProcessingError::Step { .. })
        ));
    }

    #[test]
    fn test_empty_pipeline_cannot_prepare() {
        let mut pipeline = Pipeline::new();
        assert!(matches!(
            pipeline.prepare(&metadata_with_shape(vec![1, 4, 4])),
            Err(ProcessingError::EmptyPipeline)
        ));
    }

    #[test]
    fn test_lambda_step() {
        let mut pipeline = Pipeline::new().with_step(Lambda::new("negate", |mut frame: Frame| {
            frame.data.iter_mut().for_each(|s| *s = -*s);
            Ok(frame)
        }));
        let out = pipeline.process(Frame::from_i16(&[1, -2], &[1, 1, 2])).unwrap();
        assert_eq!(out.data, vec![-1.0, 2.0]);
    }
}
