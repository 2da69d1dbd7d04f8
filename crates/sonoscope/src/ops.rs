//! Acquisition descriptions: what the user asks the front-end to do.
//!
//! A [`Scheme`] bundles a [`Sequence`] (high-level or already raw), optional
//! processing and optional digital down-conversion. High-level sequences
//! are compiled into a [`TxRxSequence`] by the kernel registry before they
//! reach the hardware core.

use serde::{Deserialize, Serialize};
use sonoconf::WorkMode;
use std::fmt;

use crate::processing::SchemeProcessing;

/// Acoustic propagation medium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medium {
    pub name: String,
    /// Speed of sound [m/s]
    pub speed_of_sound: f64,
}

impl Medium {
    pub fn new(name: impl Into<String>, speed_of_sound: f64) -> Self {
        Self {
            name: name.into(),
            speed_of_sound,
        }
    }

    pub fn soft_tissue() -> Self {
        Self::new("soft_tissue", 1540.0)
    }
}

impl Default for Medium {
    fn default() -> Self {
        Self::soft_tissue()
    }
}

/// Sine burst transmitted by the active elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    /// Carrier frequency [Hz]
    pub center_frequency: f64,
    /// Burst length in carrier periods
    pub n_periods: f64,
    pub inverse: bool,
}

impl Pulse {
    pub fn new(center_frequency: f64, n_periods: f64) -> Self {
        Self {
            center_frequency,
            n_periods,
            inverse: false,
        }
    }
}

/// Classical scan-line imaging: one focused transmit per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinSequence {
    /// Transmit aperture center per line, as a (fractional) element index.
    pub tx_aperture_center_element: Vec<f64>,
    pub tx_aperture_size: u32,
    /// Transmit focus depth [m]; `f64::INFINITY` for an unfocused beam.
    pub tx_focus: f64,
    pub pulse: Pulse,
    /// Receive aperture center per line; must match the transmit count.
    pub rx_aperture_center_element: Vec<f64>,
    pub rx_aperture_size: u32,
    /// Half-open range of samples to acquire, `[start, end)`.
    pub rx_sample_range: (u32, u32),
    pub downsampling_factor: u32,
    /// Pulse repetition interval [s]
    pub pri: f64,
    /// Overrides the session medium when set [m/s]
    pub speed_of_sound: Option<f64>,
    /// TGC gain at depth 0 [dB]
    pub tgc_start: f64,
    /// TGC slope [dB/m]
    pub tgc_slope: f64,
}

/// Plane-wave imaging: full-aperture transmits steered at the given angles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PwiSequence {
    /// Steering angles [rad]
    pub angles: Vec<f64>,
    pub pulse: Pulse,
    pub rx_sample_range: (u32, u32),
    pub downsampling_factor: u32,
    pub pri: f64,
    pub speed_of_sound: Option<f64>,
    pub tgc_start: f64,
    pub tgc_slope: f64,
}

/// A sequence handled by a user-registered kernel, looked up by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomSequence {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    pub aperture: Vec<bool>,
    /// Per-element transmit delays [s]; inactive elements are 0.
    pub delays: Vec<f64>,
    pub pulse: Pulse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rx {
    pub aperture: Vec<bool>,
    pub sample_range: (u32, u32),
    pub downsampling_factor: u32,
    /// Channels added before/after the aperture when it hangs off the probe edge.
    pub padding: (u32, u32),
}

impl Rx {
    /// Samples recorded per channel for this op, before any DDC decimation.
    pub fn n_samples(&self) -> u32 {
        let (start, end) = self.sample_range;
        end.saturating_sub(start) / self.downsampling_factor.max(1)
    }

    pub fn n_active(&self) -> usize {
        self.aperture.iter().filter(|&&on| on).count()
    }
}

/// One transmit/receive event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRx {
    pub tx: Tx,
    pub rx: Rx,
    pub pri: f64,
}

/// Hardware-ready program: the compiled form of any [`Sequence`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRxSequence {
    pub ops: Vec<TxRx>,
    /// TGC curve [dB], sampled uniformly over the receive window.
    pub tgc_curve: Vec<f64>,
    /// How many times the whole sequence is repeated per frame.
    pub n_repeats: u32,
    /// Sequence repetition interval [s], if the frame rate is capped.
    pub sri: Option<f64>,
}

impl TxRxSequence {
    pub fn new(ops: Vec<TxRx>, tgc_curve: Vec<f64>) -> Self {
        Self {
            ops,
            tgc_curve,
            n_repeats: 1,
            sri: None,
        }
    }

    /// Time needed to execute the whole program once [s].
    pub fn frame_duration(&self) -> f64 {
        let ops: f64 = self.ops.iter().map(|op| op.pri).sum::<f64>() * self.n_repeats as f64;
        match self.sri {
            Some(sri) if sri > ops => sri,
            _ => ops,
        }
    }
}

/// Discriminant of [`Sequence`], used as the kernel registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceKind {
    Linear,
    PlaneWave,
    Custom(String),
    Raw,
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "LinSequence"),
            Self::PlaneWave => write!(f, "PwiSequence"),
            Self::Custom(name) => write!(f, "Custom({})", name),
            Self::Raw => write!(f, "TxRxSequence"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sequence {
    Linear(LinSequence),
    PlaneWave(PwiSequence),
    Custom(CustomSequence),
    Raw(TxRxSequence),
}

impl Sequence {
    pub fn kind(&self) -> SequenceKind {
        match self {
            Self::Linear(_) => SequenceKind::Linear,
            Self::PlaneWave(_) => SequenceKind::PlaneWave,
            Self::Custom(custom) => SequenceKind::Custom(custom.name.clone()),
            Self::Raw(_) => SequenceKind::Raw,
        }
    }

    /// Receive downsampling applied by the front-end (1 for custom sequences).
    pub fn downsampling_factor(&self) -> u32 {
        match self {
            Self::Linear(seq) => seq.downsampling_factor,
            Self::PlaneWave(seq) => seq.downsampling_factor,
            Self::Custom(_) => 1,
            Self::Raw(seq) => seq
                .ops
                .first()
                .map(|op| op.rx.downsampling_factor)
                .unwrap_or(1),
        }
    }
}

impl From<LinSequence> for Sequence {
    fn from(seq: LinSequence) -> Self {
        Self::Linear(seq)
    }
}

impl From<PwiSequence> for Sequence {
    fn from(seq: PwiSequence) -> Self {
        Self::PlaneWave(seq)
    }
}

impl From<TxRxSequence> for Sequence {
    fn from(seq: TxRxSequence) -> Self {
        Self::Raw(seq)
    }
}

/// Digital down-conversion performed by the front-end: RF → complex baseband.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalDownConversion {
    /// Mixing frequency [Hz]
    pub demodulation_frequency: f64,
    pub decimation_factor: u32,
    /// Low-pass FIR applied before decimation
    pub fir_coefficients: Vec<f64>,
}

/// Output buffer sizing requested by a scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBufferSpec {
    pub n_elements: u32,
}

/// Everything needed to start an acquisition. Consumed by `Session::upload`.
pub struct Scheme {
    pub tx_rx_sequence: Sequence,
    pub processing: Option<SchemeProcessing>,
    pub digital_down_conversion: Option<DigitalDownConversion>,
    /// Falls back to `[system.acquisition] buffer_elements`.
    pub output_buffer: Option<DataBufferSpec>,
    /// Falls back to `[system.acquisition] work_mode`.
    pub work_mode: Option<WorkMode>,
}

impl Scheme {
    pub fn new(sequence: impl Into<Sequence>) -> Self {
        Self {
            tx_rx_sequence: sequence.into(),
            processing: None,
            digital_down_conversion: None,
            output_buffer: None,
            work_mode: None,
        }
    }

    pub fn with_processing(mut self, processing: impl Into<SchemeProcessing>) -> Self {
        self.processing = Some(processing.into());
        self
    }

    pub fn with_ddc(mut self, ddc: DigitalDownConversion) -> Self {
        self.digital_down_conversion = Some(ddc);
        self
    }

    pub fn with_buffer(mut self, n_elements: u32) -> Self {
        self.output_buffer = Some(DataBufferSpec { n_elements });
        self
    }

    pub fn with_work_mode(mut self, work_mode: WorkMode) -> Self {
        self.work_mode = Some(work_mode);
        self
    }
}

impl fmt::Debug for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheme")
            .field("tx_rx_sequence", &self.tx_rx_sequence.kind())
            .field("processing", &self.processing.is_some())
            .field("digital_down_conversion", &self.digital_down_conversion)
            .field("output_buffer", &self.output_buffer)
            .field("work_mode", &self.work_mode)
            .finish()
    }
}
