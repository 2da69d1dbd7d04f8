//! In-process hardware core.
//!
//! Stands in for the front-end driver: allocates the streaming buffer for
//! each upload and produces frames according to the work mode.
//!
//! ```text
//!                 ┌──────────── FrameEngine ────────────┐
//!   MANUAL run ──►│                                      │
//!   HOST release ►│ Mutex<BufferProducer> ◄── FrameSource│──► StreamingBuffer
//!   ASYNC pacer ─►│                    (synthetic/replay)│
//!                 └──────────────────────────────────────┘
//! ```
//!
//! `us4r` sessions synthesize frames; `file` sessions replay little-endian
//! int16 frames from a memory-mapped recording, wrapping at the end.
//! Sample 0 of every frame carries the trigger counter.

use memmap2::{Mmap, MmapOptions};
use sonoconf::{SonoConfig, SystemConfig, SystemKind, WorkMode};
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::buffer::{BufferError, BufferProducer, BufferState, StreamingBuffer};
use crate::devices::{
    DeviceId, DeviceType, FrameChannelMapping, FrameChannelMappingBuilder, MappingEntry,
    ProbeDescriptor,
};
use crate::hardware::{
    CompiledScheme, CoreError, CoreSession, DeviceHandle, HardwareCore, UploadResult,
};

/// Shortest interval between two ASYNC acquisitions.
const MIN_FRAME_PERIOD: Duration = Duration::from_micros(100);

/// The default hardware core.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedCore;

impl HardwareCore for SimulatedCore {
    fn create_session(&self, config: &SonoConfig) -> Result<Box<dyn CoreSession>, CoreError> {
        Ok(Box::new(SimulatedSession::new(config.system.clone())?))
    }
}

#[derive(Debug)]
enum FrameSource {
    Synthetic,
    Replay { recording: Arc<Mmap>, n_frames: usize },
}

impl FrameSource {
    fn render(&self, frame_number: u64, dst: &mut [i16]) {
        match self {
            Self::Synthetic => {
                for (i, sample) in dst.iter_mut().enumerate() {
                    let phase = (i as u64).wrapping_mul(31).wrapping_add(frame_number * 7);
                    *sample = (phase % 4096) as i16 - 2048;
                }
            }
            Self::Replay {
                recording,
                n_frames,
            } => {
                let frame_bytes = dst.len() * 2;
                let offset = (frame_number as usize % n_frames) * frame_bytes;
                let bytes = &recording[offset..offset + frame_bytes];
                for (sample, raw) in dst.iter_mut().zip(bytes.chunks_exact(2)) {
                    *sample = i16::from_le_bytes([raw[0], raw[1]]);
                }
            }
        }
        if let Some(first) = dst.first_mut() {
            *first = (frame_number & 0x7fff) as i16;
        }
    }
}

/// Writes frames into the current upload's buffer.
struct FrameEngine {
    producer: Mutex<BufferProducer>,
    source: FrameSource,
    armed: Arc<AtomicBool>,
}

impl FrameEngine {
    fn acquire(&self) -> Result<usize, BufferError> {
        let mut producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
        producer.fill_with(|frame_number, dst| self.source.render(frame_number, dst))
    }

    /// Acquire only if the next element is free. Returns whether a frame was written.
    fn acquire_if_free(&self) -> bool {
        if !self.armed.load(Ordering::Acquire) {
            return false;
        }
        let mut producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
        if !producer.next_is_free() {
            return false;
        }
        producer
            .fill_with(|frame_number, dst| self.source.render(frame_number, dst))
            .is_ok()
    }

    fn fill_free(&self) -> usize {
        let mut filled = 0;
        while self.acquire_if_free() {
            filled += 1;
        }
        filled
    }
}

struct Upload {
    buffer: StreamingBuffer,
    engine: Arc<FrameEngine>,
    work_mode: WorkMode,
    frame_period: Duration,
}

/// Session of the simulated core.
pub struct SimulatedSession {
    system: SystemConfig,
    recording: Option<Arc<Mmap>>,
    upload: Option<Upload>,
    armed: Arc<AtomicBool>,
    pacer: Option<JoinHandle<()>>,
}

impl SimulatedSession {
    pub fn new(system: SystemConfig) -> Result<Self, CoreError> {
        let recording = match system.kind {
            SystemKind::Us4r => None,
            SystemKind::File => {
                let path = system.file.path.clone().ok_or_else(|| {
                    CoreError::Rejected("file system needs [system.file] path".to_string())
                })?;
                let file = File::open(&path).map_err(|source| CoreError::Source {
                    path: path.clone(),
                    source,
                })?;
                let mmap = unsafe { MmapOptions::new().map(&file) }
                    .map_err(|source| CoreError::Source {
                        path: path.clone(),
                        source,
                    })?;
                info!("replaying {} ({} bytes)", path.display(), mmap.len());
                Some(Arc::new(mmap))
            }
        };

        Ok(Self {
            system,
            recording,
            upload: None,
            armed: Arc::new(AtomicBool::new(false)),
            pacer: None,
        })
    }

    fn n_channels(&self) -> usize {
        (self.system.n_modules * self.system.channels_per_module) as usize
    }

    fn frontend_id(&self) -> DeviceId {
        match self.system.kind {
            SystemKind::Us4r => DeviceId::new(DeviceType::Us4R, 0),
            SystemKind::File => DeviceId::new(DeviceType::File, 0),
        }
    }

    fn handle(&self, id: DeviceId) -> DeviceHandle {
        DeviceHandle {
            id,
            probe: ProbeDescriptor::from(&self.system.probe),
            sampling_frequency: self.system.sampling_frequency,
            n_modules: self.system.n_modules,
            channels_per_module: self.system.channels_per_module,
            source: match id.device_type {
                DeviceType::File => self.system.file.path.clone(),
                _ => None,
            },
        }
    }

    /// `[events, samples, channels]`, plus a trailing I/Q axis with DDC.
    fn frame_shape(&self, scheme: &CompiledScheme) -> Result<Vec<usize>, CoreError> {
        let ops = &scheme.sequence.ops;
        if ops.is_empty() {
            return Err(CoreError::Rejected("sequence has no ops".to_string()));
        }
        let samples = |op: &crate::ops::TxRx| match &scheme.digital_down_conversion {
            Some(ddc) => {
                let (start, end) = op.rx.sample_range;
                end.saturating_sub(start) / ddc.decimation_factor.max(1)
            }
            None => op.rx.n_samples(),
        };
        let n_samples = samples(&ops[0]);
        if let Some((i, op)) = ops.iter().enumerate().find(|(_, op)| samples(op) != n_samples) {
            return Err(CoreError::Rejected(format!(
                "op {} records {} samples, op 0 records {}",
                i,
                samples(op),
                n_samples
            )));
        }
        if n_samples == 0 {
            return Err(CoreError::Rejected("ops record no samples".to_string()));
        }

        let n_events = ops.len() * scheme.sequence.n_repeats.max(1) as usize;
        let mut shape = vec![n_events, n_samples as usize, self.n_channels()];
        if scheme.digital_down_conversion.is_some() {
            shape.push(2);
        }
        Ok(shape)
    }

    fn frame_channel_mapping(&self, scheme: &CompiledScheme, n_events: usize) -> FrameChannelMapping {
        let n_channels = self.n_channels() as u32;
        let cpm = self.system.channels_per_module.max(1);
        let ops = &scheme.sequence.ops;
        let mut builder = FrameChannelMappingBuilder::new(n_events as u32, n_channels);
        for event in 0..n_events {
            let active = ops[event % ops.len()].rx.n_active() as u32;
            for channel in 0..active.min(n_channels) {
                builder.set(
                    event as u32,
                    channel,
                    MappingEntry {
                        module: (channel / cpm) as u8,
                        frame: event as u32,
                        channel: (channel % cpm) as i32,
                    },
                );
            }
        }
        builder.build()
    }

    fn source(&self, frame_len: usize) -> Result<FrameSource, CoreError> {
        let Some(recording) = &self.recording else {
            return Ok(FrameSource::Synthetic);
        };
        let available = recording.len() / (frame_len * 2).max(1);
        let n_frames = match self.system.file.n_frames as usize {
            0 => available,
            limit => limit.min(available),
        };
        if n_frames == 0 {
            return Err(CoreError::Rejected(format!(
                "recording holds {} bytes, a frame needs {}",
                recording.len(),
                frame_len * 2
            )));
        }
        debug!("replay source: {} frames of {} samples", n_frames, frame_len);
        Ok(FrameSource::Replay {
            recording: Arc::clone(recording),
            n_frames,
        })
    }

    fn current(&self) -> Result<&Upload, CoreError> {
        self.upload.as_ref().ok_or(CoreError::NotUploaded)
    }

    fn start_pacer(&mut self) -> Result<(), CoreError> {
        let upload = self.current()?;
        let engine = Arc::clone(&upload.engine);
        let buffer = upload.buffer.clone();
        let period = upload.frame_period;
        let armed = Arc::clone(&self.armed);

        let handle = thread::Builder::new()
            .name("sonoscope-acquisition".to_string())
            .spawn(move || {
                debug!("acquisition pacer started, period {:?}", period);
                while armed.load(Ordering::Acquire) {
                    match engine.acquire() {
                        Ok(_) | Err(BufferError::Overflow { .. }) => {}
                        Err(e) => {
                            debug!("acquisition pacer stopping: {}", e);
                            break;
                        }
                    }
                    if buffer.state() != BufferState::Running {
                        break;
                    }
                    thread::sleep(period);
                }
                debug!("acquisition pacer exiting");
            })
            .map_err(CoreError::Spawn)?;
        self.pacer = Some(handle);
        Ok(())
    }
}

impl CoreSession for SimulatedSession {
    fn upload(&mut self, scheme: &CompiledScheme) -> Result<UploadResult, CoreError> {
        if scheme.n_elements == 0 {
            return Err(CoreError::Rejected("buffer needs at least one element".to_string()));
        }
        let shape = self.frame_shape(scheme)?;
        let frame_len = shape.iter().product();
        let source = self.source(frame_len)?;

        self.stop_scheme()?;
        if let Some(previous) = self.upload.take() {
            previous.buffer.shutdown();
        }

        let frame_channel_mapping = match self.system.kind {
            SystemKind::Us4r => Some(self.frame_channel_mapping(scheme, shape[0])),
            SystemKind::File => None,
        };
        let (buffer, producer) =
            StreamingBuffer::new(scheme.n_elements as usize, shape, scheme.stop_on_overflow)?;
        let engine = Arc::new(FrameEngine {
            producer: Mutex::new(producer),
            source,
            armed: Arc::clone(&self.armed),
        });
        let frame_period = Duration::try_from_secs_f64(scheme.sequence.frame_duration())
            .unwrap_or(MIN_FRAME_PERIOD)
            .max(MIN_FRAME_PERIOD);

        info!(
            "uploaded {} ops, buffer {} x {:?}, {} mode",
            scheme.sequence.ops.len(),
            buffer.n_elements(),
            buffer.shape(),
            scheme.work_mode.as_str()
        );

        self.upload = Some(Upload {
            buffer: buffer.clone(),
            engine,
            work_mode: scheme.work_mode,
            frame_period,
        });
        Ok(UploadResult {
            buffer,
            frame_channel_mapping,
        })
    }

    fn get_device(&self, id: &DeviceId) -> Result<DeviceHandle, CoreError> {
        let frontend = self.frontend_id();
        let resolved = match id.device_type {
            DeviceType::Ultrasound if id.ordinal == 0 => frontend,
            _ if *id == frontend => frontend,
            DeviceType::Us4OEM if id.ordinal < self.system.n_modules => *id,
            DeviceType::Probe if id.ordinal == 0 => *id,
            _ => return Err(CoreError::DeviceNotFound(id.path())),
        };
        Ok(self.handle(resolved))
    }

    fn start_scheme(&mut self) -> Result<(), CoreError> {
        self.current()?;
        self.armed.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_scheme(&mut self) -> Result<(), CoreError> {
        self.armed.store(false, Ordering::Release);
        if let Some(upload) = &self.upload {
            upload.buffer.set_release_hook(None);
        }
        if let Some(pacer) = self.pacer.take() {
            if pacer.join().is_err() {
                warn!("acquisition pacer panicked");
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<(), CoreError> {
        let work_mode = self.current()?.work_mode;
        if !self.armed.load(Ordering::Acquire) {
            return Err(CoreError::Rejected("scheme is not started".to_string()));
        }
        match work_mode {
            WorkMode::Manual => {
                self.current()?.engine.acquire()?;
                Ok(())
            }
            WorkMode::Host => {
                let upload = self.current()?;
                let engine: Weak<FrameEngine> = Arc::downgrade(&upload.engine);
                upload.buffer.set_release_hook(Some(Arc::new(move |_: usize| {
                    if let Some(engine) = engine.upgrade() {
                        engine.acquire_if_free();
                    }
                })));
                let filled = upload.engine.fill_free();
                debug!("host mode armed, {} frames queued", filled);
                Ok(())
            }
            WorkMode::Async => self.start_pacer(),
        }
    }

    fn close(&mut self) -> Result<(), CoreError> {
        self.stop_scheme()?;
        if let Some(upload) = self.upload.take() {
            upload.buffer.shutdown();
        }
        debug!("simulated core closed");
        Ok(())
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
