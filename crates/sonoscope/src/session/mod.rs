//! Acquisition sessions.
//!
//! A [`Session`] owns the connection to a hardware core, the devices
//! resolved through it, the streaming buffer of the current upload and at
//! most one processing runner.
//!
//! ```text
//!            upload            start_scheme          stop_scheme
//! Created ──────────► Uploaded ──────────► Running ──────────► Stopped
//!                        ▲  │                 ▲                  │ │
//!                        │  └─ stop_scheme ───┼────────────────► │ │
//!                        └──── upload ────────┼──────────────────┘ │
//!                                             └─── start_scheme ───┘
//!
//!                      any state ── close ──► Closed
//! ```
//!
//! A failed operation never changes the state. Every public operation runs
//! under the session's log dispatcher, inside a `session` span.

pub mod error;
pub mod registry;

pub use error::SessionError;
pub use registry::{SessionInfo, SessionRegistry};

use chrono::Utc;
use sonoconf::{SonoConfig, WorkMode};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Dispatch, Span};
use uuid::Uuid;

use crate::buffer::StreamingBuffer;
use crate::devices::{ComputeCapabilities, Device, DeviceId, DeviceType};
use crate::hardware::{CompiledScheme, CoreSession, HardwareCore};
use crate::kernels::{KernelExecutionContext, KernelRegistry};
use crate::metadata::{ConstMetadata, FrameAcquisitionContext};
use crate::ops::{Medium, Scheme};
use crate::processing::{
    ParameterDef, ProcessingRunner, RunnerOutputs, RunnerStats, SchemeProcessing,
};
use crate::sim::SimulatedCore;

/// Path of the session's front-end, whatever its concrete type.
pub const ULTRASOUND_DEVICE: &str = "/Ultrasound:0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Uploaded,
    Running,
    Stopped,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Uploaded => "uploaded",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Immutable per-session context. Replaced wholesale by `set_medium`.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub medium: Medium,
    pub config: Arc<SonoConfig>,
}

/// What `upload` hands back.
#[derive(Debug)]
pub enum UploadOutput {
    /// No processing: consume the buffer directly.
    Buffer {
        buffer: StreamingBuffer,
        metadata: Arc<ConstMetadata>,
    },
    /// Processing attached: pipeline outputs.
    Processed(RunnerOutputs),
}

impl UploadOutput {
    /// Metadata of what the caller receives: raw frames or pipeline output.
    pub fn metadata(&self) -> &Arc<ConstMetadata> {
        match self {
            Self::Buffer { metadata, .. } => metadata,
            Self::Processed(outputs) => outputs.metadata(),
        }
    }

    pub fn into_buffer(self) -> Option<(StreamingBuffer, Arc<ConstMetadata>)> {
        match self {
            Self::Buffer { buffer, metadata } => Some((buffer, metadata)),
            Self::Processed(_) => None,
        }
    }

    pub fn into_outputs(self) -> Option<RunnerOutputs> {
        match self {
            Self::Processed(outputs) => Some(outputs),
            Self::Buffer { .. } => None,
        }
    }
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config_path: Option<PathBuf>,
    config: Option<SonoConfig>,
    medium: Option<Medium>,
    core: Option<Arc<dyn HardwareCore>>,
    kernels: Option<KernelRegistry>,
    registry: Option<SessionRegistry>,
    log_dispatch: Option<Dispatch>,
    capabilities: Option<ComputeCapabilities>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session file to load. It must exist.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Use this configuration as-is instead of loading one.
    pub fn config(mut self, config: SonoConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn medium(mut self, medium: Medium) -> Self {
        self.medium = Some(medium);
        self
    }

    /// Hardware core to connect through (default: [`SimulatedCore`]).
    pub fn core(mut self, core: Arc<dyn HardwareCore>) -> Self {
        self.core = Some(core);
        self
    }

    pub fn kernels(mut self, kernels: KernelRegistry) -> Self {
        self.kernels = Some(kernels);
        self
    }

    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Log sink for everything the session does (default: the dispatcher
    /// current when `build` is called).
    pub fn log_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.log_dispatch = Some(dispatch);
        self
    }

    /// Skip probing the host for compute devices.
    pub fn capabilities(mut self, capabilities: ComputeCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn build(self) -> Result<Session, SessionError> {
        let dispatch = self
            .log_dispatch
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(|d| d.clone()));
        tracing::dispatcher::with_default(&dispatch, || self.connect(dispatch.clone()))
    }

    fn connect(self, dispatch: Dispatch) -> Result<Session, SessionError> {
        let config = match (self.config, &self.config_path) {
            (Some(config), _) => config,
            (None, Some(path)) => SonoConfig::load_session_file(path)?,
            (None, None) => SonoConfig::load()?,
        };
        let capabilities = self
            .capabilities
            .unwrap_or_else(|| ComputeCapabilities::probe(&config.system.compute));
        let core = self
            .core
            .unwrap_or_else(|| Arc::new(SimulatedCore) as Arc<dyn HardwareCore>);
        let core_session = core.create_session(&config)?;

        let id = Uuid::new_v4();
        let span = info_span!("session", id = %id);
        let registry = self.registry.unwrap_or_default();
        registry.register(SessionInfo {
            id,
            config_path: self.config_path.clone(),
            opened_at: Utc::now(),
        });

        span.in_scope(|| {
            info!(
                "session opened: {} front-end, {} elements",
                config.system.kind.as_str(),
                config.system.probe.n_elements
            )
        });

        Ok(Session {
            id,
            state: SessionState::Created,
            context: Arc::new(SessionContext {
                medium: self.medium.unwrap_or_default(),
                config: Arc::new(config),
            }),
            core: Some(core_session),
            kernels: self.kernels.unwrap_or_default(),
            capabilities,
            devices: HashMap::new(),
            devices_by_id: HashMap::new(),
            buffer: None,
            metadata: None,
            runner: None,
            work_mode: None,
            triggered: false,
            registry,
            dispatch,
            span,
        })
    }
}

/// An acquisition session with one ultrasound front-end.
pub struct Session {
    id: Uuid,
    state: SessionState,
    context: Arc<SessionContext>,
    core: Option<Box<dyn CoreSession>>,
    kernels: KernelRegistry,
    capabilities: ComputeCapabilities,
    /// Wrappers by requested path, and by resolved id so aliases share one.
    devices: HashMap<String, Device>,
    devices_by_id: HashMap<DeviceId, Device>,
    buffer: Option<StreamingBuffer>,
    metadata: Option<Arc<ConstMetadata>>,
    runner: Option<ProcessingRunner>,
    /// Work mode of the current upload
    work_mode: Option<WorkMode>,
    /// HOST/ASYNC triggering armed since the last start
    triggered: bool,
    registry: SessionRegistry,
    dispatch: Dispatch,
    span: Span,
}

impl Session {
    /// Open a session from a session file, using the simulated core.
    pub fn open(config_path: impl AsRef<Path>, medium: Option<Medium>) -> Result<Self, SessionError> {
        let mut builder = SessionBuilder::new().config_path(config_path.as_ref());
        if let Some(medium) = medium {
            builder = builder.medium(medium);
        }
        builder.build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.context)
    }

    pub fn config(&self) -> &SonoConfig {
        &self.context.config
    }

    pub fn medium(&self) -> Result<Medium, SessionError> {
        self.ensure_open()?;
        Ok(self.context.medium.clone())
    }

    /// Replace the session context with one using `medium`.
    ///
    /// Applies to the next upload.
    pub fn set_medium(&mut self, medium: Medium) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.context = Arc::new(SessionContext {
            medium,
            config: Arc::clone(&self.context.config),
        });
        Ok(())
    }

    /// Buffer of the current upload.
    pub fn buffer(&self) -> Option<&StreamingBuffer> {
        self.buffer.as_ref()
    }

    /// Input metadata of the current upload.
    pub fn metadata(&self) -> Option<&Arc<ConstMetadata>> {
        self.metadata.as_ref()
    }

    pub fn processing_stats(&self) -> Option<Arc<RunnerStats>> {
        self.runner.as_ref().map(|runner| Arc::clone(runner.stats()))
    }

    /// Resolve a device path such as `/Ultrasound:0` or `/GPU:0`.
    ///
    /// Wrappers are cached: every call for the same device returns the
    /// same instance.
    pub fn get_device(&mut self, path: &str) -> Result<Device, SessionError> {
        self.in_scope_mut(|session| session.resolve_device(path))
    }

    /// Compile `scheme`, upload it and allocate its output buffer.
    pub fn upload(&mut self, scheme: Scheme) -> Result<UploadOutput, SessionError> {
        self.in_scope_mut(|session| session.upload_scheme(scheme))
    }

    /// Arm the uploaded scheme; resumes processing stopped by `stop_scheme`.
    pub fn start_scheme(&mut self) -> Result<(), SessionError> {
        self.in_scope_mut(|session| {
            session.ensure_open()?;
            match session.state {
                SessionState::Created => return Err(SessionError::NotUploaded),
                SessionState::Running => {
                    return Err(SessionError::InvalidState {
                        state: session.state,
                        operation: "start",
                    })
                }
                _ => {}
            }
            session.core_mut()?.start_scheme()?;
            if let Some(runner) = session.runner.as_mut() {
                runner.resume()?;
            }
            session.triggered = false;
            session.state = SessionState::Running;
            info!("scheme started");
            Ok(())
        })
    }

    /// Stop acquisition, then processing. No callback fires after this returns.
    pub fn stop_scheme(&mut self) -> Result<(), SessionError> {
        self.in_scope_mut(|session| {
            session.ensure_open()?;
            if session.state == SessionState::Created {
                return Err(SessionError::NotUploaded);
            }
            session.core_mut()?.stop_scheme()?;
            if let Some(runner) = session.runner.as_mut() {
                runner.close();
            }
            session.triggered = false;
            session.state = SessionState::Stopped;
            info!("scheme stopped");
            Ok(())
        })
    }

    /// Trigger acquisition.
    ///
    /// MANUAL: one frame per call. HOST/ASYNC: starts continuous triggering;
    /// only one call per start is allowed.
    pub fn run(&mut self) -> Result<(), SessionError> {
        self.in_scope_mut(|session| {
            session.ensure_open()?;
            match session.state {
                SessionState::Created => return Err(SessionError::NotUploaded),
                SessionState::Running => {}
                _ => return Err(SessionError::NotRunning),
            }
            let work_mode = session.work_mode.ok_or(SessionError::NotUploaded)?;
            if work_mode != WorkMode::Manual && session.triggered {
                return Err(SessionError::InvalidState {
                    state: session.state,
                    operation: "run again",
                });
            }
            session.core_mut()?.run()?;
            if work_mode != WorkMode::Manual {
                session.triggered = true;
                debug!("{} triggering armed", work_mode.as_str());
            }
            Ok(())
        })
    }

    /// Stop everything and disconnect. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), SessionError> {
        self.in_scope_mut(|session| {
            if session.state == SessionState::Closed {
                return Ok(());
            }
            if let Some(core) = session.core.as_mut() {
                if session.state != SessionState::Created {
                    if let Err(e) = core.stop_scheme() {
                        warn!("stop before close failed: {}", e);
                    }
                }
            }
            // joins the worker; its owner's Drop sends the terminal event
            session.runner = None;
            if let Some(mut core) = session.core.take() {
                if let Err(e) = core.close() {
                    warn!("core close failed: {}", e);
                }
            }
            if let Some(buffer) = session.buffer.take() {
                buffer.shutdown();
            }
            session.metadata = None;
            session.devices.clear();
            session.devices_by_id.clear();
            session.registry.deregister(&session.id);
            session.state = SessionState::Closed;
            info!("session closed");
            Ok(())
        })
    }

    /// Set a pipeline parameter. Returns `false` when no processing is attached.
    pub fn set_parameter(&self, name: &str, values: &[f64]) -> Result<bool, SessionError> {
        self.in_scope(|session| {
            session.ensure_open()?;
            match &session.runner {
                Some(runner) => {
                    runner.parameters().set_parameter(name, values)?;
                    debug!("parameter {} = {:?}", name, values);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    pub fn get_parameter(&self, name: &str) -> Result<Option<Vec<f64>>, SessionError> {
        self.in_scope(|session| {
            session.ensure_open()?;
            Ok(session
                .runner
                .as_ref()
                .and_then(|runner| runner.parameters().get_parameter(name)))
        })
    }

    pub fn get_parameters(&self) -> Result<Option<BTreeMap<String, ParameterDef>>, SessionError> {
        self.in_scope(|session| {
            session.ensure_open()?;
            Ok(session
                .runner
                .as_ref()
                .map(|runner| runner.parameters().get_parameters()))
        })
    }

    // ------------------------------------------------------------------------

    fn in_scope<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, || self.span.in_scope(|| f(self)))
    }

    fn in_scope_mut<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let dispatch = self.dispatch.clone();
        let span = self.span.clone();
        tracing::dispatcher::with_default(&dispatch, || span.in_scope(|| f(self)))
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Closed => Err(SessionError::SessionClosed),
            _ => Ok(()),
        }
    }

    fn core_mut(&mut self) -> Result<&mut Box<dyn CoreSession>, SessionError> {
        self.core.as_mut().ok_or(SessionError::SessionClosed)
    }

    fn resolve_device(&mut self, path: &str) -> Result<Device, SessionError> {
        self.ensure_open()?;
        if let Some(device) = self.devices.get(path) {
            return Ok(device.clone());
        }
        let not_found = || SessionError::DeviceNotFound(path.to_string());
        let id = DeviceId::parse_path(path).ok_or_else(not_found)?;

        let device = match id.device_type {
            DeviceType::Cpu | DeviceType::Gpu => match self.devices_by_id.get(&id) {
                Some(device) => device.clone(),
                None => {
                    let compute = self.capabilities.device(&id).ok_or_else(not_found)?;
                    Device::Compute(Arc::new(compute))
                }
            },
            _ => {
                let handle = self
                    .core
                    .as_ref()
                    .ok_or(SessionError::SessionClosed)?
                    .get_device(&id)?;
                match self.devices_by_id.get(&handle.id) {
                    Some(device) => device.clone(),
                    None => {
                        let resolved = handle.id;
                        Device::from_handle(handle).ok_or_else(|| {
                            SessionError::DeviceNotFound(format!(
                                "{} (resolved to {}, which has no device wrapper)",
                                path, resolved
                            ))
                        })?
                    }
                }
            }
        };

        debug!("resolved {} to {}", path, device.id());
        self.devices_by_id.insert(device.id(), device.clone());
        self.devices.insert(path.to_string(), device.clone());
        Ok(device)
    }

    fn upload_scheme(&mut self, scheme: Scheme) -> Result<UploadOutput, SessionError> {
        self.ensure_open()?;
        if self.state == SessionState::Running {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "upload",
            });
        }
        if self.runner.as_ref().is_some_and(ProcessingRunner::is_running) {
            return Err(SessionError::ProcessingActive);
        }
        if let Some(processing) = &scheme.processing {
            self.check_processing(processing)?;
        }

        let device = self.resolve_device(ULTRASOUND_DEVICE)?;
        let ultrasound = device
            .as_ultrasound()
            .ok_or_else(|| SessionError::DeviceNotFound(ULTRASOUND_DEVICE.to_string()))?;
        let descriptor = ultrasound.get_dto();
        let medium = self.context.medium.clone();

        let Scheme {
            tx_rx_sequence,
            processing,
            digital_down_conversion,
            output_buffer,
            work_mode,
        } = scheme;

        let kernel_context = KernelExecutionContext::new(
            descriptor.clone(),
            medium.clone(),
            tx_rx_sequence,
            digital_down_conversion.clone(),
        );
        let raw_sequence = self.kernels.compile(&kernel_context)?;
        debug!(
            "compiled {} into {} ops",
            kernel_context.op.kind(),
            raw_sequence.ops.len()
        );

        let acquisition = &self.context.config.system.acquisition;
        let work_mode = work_mode.unwrap_or(acquisition.work_mode);
        let compiled = CompiledScheme {
            sequence: raw_sequence.clone(),
            digital_down_conversion: digital_down_conversion.clone(),
            n_elements: output_buffer
                .map(|spec| spec.n_elements)
                .unwrap_or(acquisition.buffer_elements),
            work_mode,
            stop_on_overflow: acquisition.stop_on_overflow,
        };
        let upload_result = self.core_mut()?.upload(&compiled)?;
        let buffer = upload_result.buffer.clone();

        ultrasound.set_kernel_context(&kernel_context);
        let data_description = ultrasound.get_data_description(&upload_result, &raw_sequence);

        let input_shape = buffer.shape().to_vec();
        let metadata = Arc::new(ConstMetadata::new(
            FrameAcquisitionContext {
                device: descriptor,
                sequence: kernel_context.op,
                raw_sequence,
                medium,
                custom_data: kernel_context.custom,
            },
            data_description,
            input_shape,
            digital_down_conversion.is_some(),
        ));

        let (runner, output) = match processing {
            Some(processing) => {
                match ProcessingRunner::start(
                    &buffer,
                    Arc::clone(&metadata),
                    processing.into_processing(),
                ) {
                    Ok((runner, outputs)) => (Some(runner), UploadOutput::Processed(outputs)),
                    Err(e) => {
                        // the core already replaced the previous upload
                        buffer.shutdown();
                        self.discard_upload();
                        warn!("processing rejected the upload, session needs a new upload: {}", e);
                        return Err(SessionError::InvalidScheme(format!(
                            "processing cannot be attached: {}",
                            e
                        )));
                    }
                }
            }
            None => (
                None,
                UploadOutput::Buffer {
                    buffer: buffer.clone(),
                    metadata: Arc::clone(&metadata),
                },
            ),
        };

        // the previous runner is already closed; dropping it ends its output stream
        self.runner = runner;
        self.buffer = Some(buffer);
        self.metadata = Some(metadata);
        self.work_mode = Some(work_mode);
        self.triggered = false;
        self.state = SessionState::Uploaded;
        info!(
            "scheme uploaded: {} mode, processing {}",
            work_mode.as_str(),
            if self.runner.is_some() { "attached" } else { "none" }
        );
        Ok(output)
    }

    /// Forget the current upload so lifecycle calls report `NotUploaded`.
    fn discard_upload(&mut self) {
        self.runner = None;
        if let Some(buffer) = self.buffer.take() {
            buffer.shutdown();
        }
        self.metadata = None;
        self.work_mode = None;
        self.triggered = false;
        self.state = SessionState::Created;
    }

    fn check_processing(&self, processing: &SchemeProcessing) -> Result<(), SessionError> {
        let pipeline = match processing {
            SchemeProcessing::Pipeline(pipeline) => pipeline,
            SchemeProcessing::Processing(processing) => &processing.pipeline,
        };
        if pipeline.is_empty() {
            return Err(SessionError::InvalidScheme("pipeline has no steps".to_string()));
        }
        let placement = pipeline.placement();
        if !self.capabilities.supports(&placement) {
            return Err(SessionError::InvalidScheme(format!(
                "pipeline placed on {}, which this session does not have",
                placement.path()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("medium", &self.context.medium)
            .field("buffer", &self.buffer)
            .field("processing", &self.runner.is_some())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("session close on drop failed: {}", e);
        }
    }
}
