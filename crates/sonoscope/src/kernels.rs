//! Sequence compilation: user-level sequence → hardware-ready [`TxRxSequence`].
//!
//! Kernels are plain function pointers keyed by [`SequenceKind`]. They see
//! nothing but the [`KernelExecutionContext`] they are handed, so compiling
//! the same context twice yields the same program.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

use crate::devices::{ProbeDescriptor, UltrasoundDescriptor};
use crate::ops::{
    DigitalDownConversion, Medium, Pulse, Rx, Sequence, SequenceKind, Tx, TxRx, TxRxSequence,
};

/// Lowest gain the front-end amplifiers accept [dB]
pub const TGC_MIN_DB: f64 = 14.0;
/// Highest gain the front-end amplifiers accept [dB]
pub const TGC_MAX_DB: f64 = 54.0;
/// Spacing of TGC curve points, in ADC samples
pub const TGC_SAMPLE_STEP: u32 = 150;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("no kernel registered for {0}")]
    UnsupportedSequence(SequenceKind),

    #[error("kernel for {expected} called with {actual}")]
    KindMismatch {
        expected: SequenceKind,
        actual: SequenceKind,
    },

    #[error("invalid {name}: {message}")]
    InvalidParameter { name: String, message: String },
}

fn invalid(name: &str, message: impl Into<String>) -> KernelError {
    KernelError::InvalidParameter {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Inputs of a single compilation. Scoped to one upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelExecutionContext {
    pub device: UltrasoundDescriptor,
    pub medium: Medium,
    pub op: Sequence,
    /// DDC the front-end will apply to the acquired data, if any.
    pub hardware_ddc: Option<DigitalDownConversion>,
    /// Extension values for custom kernels.
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl KernelExecutionContext {
    pub fn new(
        device: UltrasoundDescriptor,
        medium: Medium,
        op: Sequence,
        hardware_ddc: Option<DigitalDownConversion>,
    ) -> Self {
        Self {
            device,
            medium,
            op,
            hardware_ddc,
            custom: BTreeMap::new(),
        }
    }
}

pub type KernelFn = fn(&KernelExecutionContext) -> Result<TxRxSequence, KernelError>;

/// Sequence kind → compiler.
#[derive(Clone)]
pub struct KernelRegistry {
    kernels: HashMap<SequenceKind, KernelFn>,
}

impl KernelRegistry {
    /// A registry with no kernels at all.
    pub fn empty() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    /// Linear, plane-wave and raw sequences.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(SequenceKind::Linear, compile_linear);
        registry.register(SequenceKind::PlaneWave, compile_plane_wave);
        registry.register(SequenceKind::Raw, compile_raw);
        registry
    }

    /// Returns the kernel previously registered for `kind`, if any.
    pub fn register(&mut self, kind: SequenceKind, kernel: KernelFn) -> Option<KernelFn> {
        self.kernels.insert(kind, kernel)
    }

    pub fn register_custom(&mut self, name: impl Into<String>, kernel: KernelFn) -> Option<KernelFn> {
        self.register(SequenceKind::Custom(name.into()), kernel)
    }

    pub fn contains(&self, kind: &SequenceKind) -> bool {
        self.kernels.contains_key(kind)
    }

    pub fn compile(&self, context: &KernelExecutionContext) -> Result<TxRxSequence, KernelError> {
        let kind = context.op.kind();
        let kernel = self
            .kernels
            .get(&kind)
            .ok_or(KernelError::UnsupportedSequence(kind))?;
        check_ddc(context.hardware_ddc.as_ref())?;
        kernel(context)
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kernels.keys()).finish()
    }
}

// ============================================================================
// Built-in kernels
// ============================================================================

/// Focused scan lines, one transmit/receive per aperture center.
pub fn compile_linear(context: &KernelExecutionContext) -> Result<TxRxSequence, KernelError> {
    let seq = match &context.op {
        Sequence::Linear(seq) => seq,
        other => return Err(mismatch(SequenceKind::Linear, other)),
    };

    if seq.tx_aperture_center_element.is_empty() {
        return Err(invalid("tx_aperture_center_element", "no scan lines"));
    }
    if seq.rx_aperture_center_element.len() != seq.tx_aperture_center_element.len() {
        return Err(invalid(
            "rx_aperture_center_element",
            format!(
                "{} rx centers for {} tx centers",
                seq.rx_aperture_center_element.len(),
                seq.tx_aperture_center_element.len()
            ),
        ));
    }
    if seq.tx_focus.is_nan() || seq.tx_focus <= 0.0 {
        return Err(invalid("tx_focus", format!("{} is not a positive depth", seq.tx_focus)));
    }
    check_rx(seq.rx_sample_range, seq.downsampling_factor)?;
    check_pri(seq.pri)?;
    let c = speed_of_sound(context, seq.speed_of_sound)?;
    let probe = &context.device.probe;

    let ops = seq
        .tx_aperture_center_element
        .iter()
        .zip(&seq.rx_aperture_center_element)
        .map(|(&tx_center, &rx_center)| {
            let (tx_aperture, _) = aperture(probe.n_elements, tx_center, seq.tx_aperture_size)?;
            let delays = focused_delays(probe, &tx_aperture, tx_center, seq.tx_focus, c);
            let (rx_aperture, padding) =
                aperture(probe.n_elements, rx_center, seq.rx_aperture_size)?;
            Ok(TxRx {
                tx: Tx {
                    aperture: tx_aperture,
                    delays,
                    pulse: seq.pulse.clone(),
                },
                rx: Rx {
                    aperture: rx_aperture,
                    sample_range: seq.rx_sample_range,
                    downsampling_factor: seq.downsampling_factor,
                    padding,
                },
                pri: seq.pri,
            })
        })
        .collect::<Result<Vec<_>, KernelError>>()?;

    let tgc = tgc_curve(context, seq.rx_sample_range, c, seq.tgc_start, seq.tgc_slope);
    Ok(TxRxSequence::new(ops, tgc))
}

/// Full-aperture plane waves, one transmit per steering angle.
pub fn compile_plane_wave(context: &KernelExecutionContext) -> Result<TxRxSequence, KernelError> {
    let seq = match &context.op {
        Sequence::PlaneWave(seq) => seq,
        other => return Err(mismatch(SequenceKind::PlaneWave, other)),
    };

    if seq.angles.is_empty() {
        return Err(invalid("angles", "no transmit angles"));
    }
    if let Some(angle) = seq.angles.iter().find(|a| a.abs() >= std::f64::consts::FRAC_PI_2) {
        return Err(invalid("angles", format!("{} rad is not steerable", angle)));
    }
    check_rx(seq.rx_sample_range, seq.downsampling_factor)?;
    check_pri(seq.pri)?;
    let c = speed_of_sound(context, seq.speed_of_sound)?;
    let probe = &context.device.probe;
    let n = probe.n_elements as usize;

    let ops = seq
        .angles
        .iter()
        .map(|&angle| TxRx {
            tx: Tx {
                aperture: vec![true; n],
                delays: plane_wave_delays(probe, angle, c),
                pulse: seq.pulse.clone(),
            },
            rx: Rx {
                aperture: vec![true; n],
                sample_range: seq.rx_sample_range,
                downsampling_factor: seq.downsampling_factor,
                padding: (0, 0),
            },
            pri: seq.pri,
        })
        .collect();

    let tgc = tgc_curve(context, seq.rx_sample_range, c, seq.tgc_start, seq.tgc_slope);
    Ok(TxRxSequence::new(ops, tgc))
}

/// Already-raw sequences pass through after validation.
pub fn compile_raw(context: &KernelExecutionContext) -> Result<TxRxSequence, KernelError> {
    let seq = match &context.op {
        Sequence::Raw(seq) => seq,
        other => return Err(mismatch(SequenceKind::Raw, other)),
    };

    if seq.ops.is_empty() {
        return Err(invalid("ops", "sequence has no tx/rx events"));
    }
    if seq.n_repeats == 0 {
        return Err(invalid("n_repeats", "must be at least 1"));
    }
    let n = context.device.probe.n_elements as usize;
    for (i, op) in seq.ops.iter().enumerate() {
        if op.tx.aperture.len() != n || op.tx.delays.len() != n {
            return Err(invalid(
                "tx",
                format!("op {}: aperture/delays must cover {} elements", i, n),
            ));
        }
        check_rx(op.rx.sample_range, op.rx.downsampling_factor)?;
        check_pri(op.pri)?;
    }
    Ok(seq.clone())
}

// ============================================================================
// Helpers
// ============================================================================

fn mismatch(expected: SequenceKind, actual: &Sequence) -> KernelError {
    KernelError::KindMismatch {
        expected,
        actual: actual.kind(),
    }
}

fn check_rx(sample_range: (u32, u32), downsampling_factor: u32) -> Result<(), KernelError> {
    let (start, end) = sample_range;
    if end <= start {
        return Err(invalid(
            "rx_sample_range",
            format!("empty range [{}, {})", start, end),
        ));
    }
    if downsampling_factor == 0 {
        return Err(invalid("downsampling_factor", "must be at least 1"));
    }
    Ok(())
}

fn check_pri(pri: f64) -> Result<(), KernelError> {
    if pri.is_nan() || pri <= 0.0 {
        return Err(invalid("pri", format!("{} is not a positive interval", pri)));
    }
    Ok(())
}

fn check_ddc(ddc: Option<&DigitalDownConversion>) -> Result<(), KernelError> {
    match ddc {
        Some(ddc) if ddc.decimation_factor == 0 => {
            Err(invalid("decimation_factor", "must be at least 1"))
        }
        Some(ddc) if ddc.fir_coefficients.is_empty() => {
            Err(invalid("fir_coefficients", "DDC needs a decimation filter"))
        }
        _ => Ok(()),
    }
}

fn speed_of_sound(
    context: &KernelExecutionContext,
    sequence_override: Option<f64>,
) -> Result<f64, KernelError> {
    let c = sequence_override.unwrap_or(context.medium.speed_of_sound);
    if c.is_nan() || c <= 0.0 {
        return Err(invalid("speed_of_sound", format!("{} m/s", c)));
    }
    Ok(c)
}

/// Element mask for an aperture of `size` elements centered at `center`,
/// plus the (left, right) padding needed where it hangs off the probe.
fn aperture(n_elements: u32, center: f64, size: u32) -> Result<(Vec<bool>, (u32, u32)), KernelError> {
    if size == 0 || size > n_elements {
        return Err(invalid(
            "aperture_size",
            format!("{} not in 1..={}", size, n_elements),
        ));
    }
    if center.is_nan() || center < -0.5 || center > n_elements as f64 - 0.5 {
        return Err(invalid("aperture_center_element", format!("{} is off the probe", center)));
    }

    let origin = (center - (size as f64 - 1.0) / 2.0).round() as i64;
    let end = origin + size as i64;
    let mask = (0..n_elements as i64).map(|e| e >= origin && e < end).collect();
    let left = (-origin).max(0) as u32;
    let right = (end - n_elements as i64).max(0) as u32;
    Ok((mask, (left, right)))
}

/// Delays focusing the active elements at `focus` below `center`.
fn focused_delays(probe: &ProbeDescriptor, mask: &[bool], center: f64, focus: f64, c: f64) -> Vec<f64> {
    if focus.is_infinite() {
        return vec![0.0; mask.len()];
    }
    let path = |e: usize| probe.distance(center, e as f64).hypot(focus);
    let longest = mask
        .iter()
        .enumerate()
        .filter(|(_, &on)| on)
        .map(|(e, _)| path(e))
        .fold(0.0, f64::max);

    mask.iter()
        .enumerate()
        .map(|(e, &on)| if on { (longest - path(e)) / c } else { 0.0 })
        .collect()
}

fn plane_wave_delays(probe: &ProbeDescriptor, angle: f64, c: f64) -> Vec<f64> {
    let raw: Vec<f64> = (0..probe.n_elements)
        .map(|e| probe.distance(0.0, e as f64) * angle.sin() / c)
        .collect();
    let min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    raw.into_iter().map(|d| d - min).collect()
}

/// Linear-in-depth gain, clamped to the amplifier range.
fn tgc_curve(
    context: &KernelExecutionContext,
    sample_range: (u32, u32),
    c: f64,
    start_db: f64,
    slope_db_per_m: f64,
) -> Vec<f64> {
    let fs = context.device.sampling_frequency;
    let (_, end) = sample_range;
    let n_points = end.div_ceil(TGC_SAMPLE_STEP);
    (0..n_points)
        .map(|k| {
            let t = (k * TGC_SAMPLE_STEP) as f64 / fs;
            let depth = t * c / 2.0;
            (start_db + slope_db_per_m * depth).clamp(TGC_MIN_DB, TGC_MAX_DB)
        })
        .collect()
}

/// Helper for tests and demos: a pulse at the probe's center frequency.
pub fn default_pulse(probe: &ProbeDescriptor) -> Pulse {
    Pulse::new(probe.center_frequency, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceId, DeviceType};
    use crate::ops::{CustomSequence, LinSequence, PwiSequence};

    fn device() -> UltrasoundDescriptor {
        UltrasoundDescriptor {
            id: DeviceId::new(DeviceType::Us4R, 0),
            probe: ProbeDescriptor {
                model: "test".to_string(),
                n_elements: 32,
                pitch: 0.3e-3,
                center_frequency: 5e6,
            },
            sampling_frequency: 65e6,
        }
    }

    fn lin() -> LinSequence {
        LinSequence {
            tx_aperture_center_element: vec![8.0, 16.0, 24.0],
            tx_aperture_size: 9,
            tx_focus: 20e-3,
            pulse: Pulse::new(5e6, 2.0),
            rx_aperture_center_element: vec![8.0, 16.0, 24.0],
            rx_aperture_size: 16,
            rx_sample_range: (0, 2048),
            downsampling_factor: 1,
            pri: 100e-6,
            speed_of_sound: None,
            tgc_start: 14.0,
            tgc_slope: 2e2,
        }
    }

    fn context(op: Sequence) -> KernelExecutionContext {
        KernelExecutionContext::new(device(), Medium::soft_tissue(), op, None)
    }

    #[test]
    fn test_compile_is_deterministic() {
        let registry = KernelRegistry::with_defaults();
        let ctx = context(lin().into());
        let a = registry.compile(&ctx).unwrap();
        let b = registry.compile(&ctx.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.ops.len(), 3);
    }

    #[test]
    fn test_linear_focus_delays_symmetric() {
        let seq = compile_linear(&context(lin().into())).unwrap();
        let op = &seq.ops[1];
        let active: Vec<usize> = (0..32).filter(|&e| op.tx.aperture[e]).collect();
        assert_eq!(active.len(), 9);
        assert_eq!(active.first(), Some(&12));

        // outermost elements fire first, center last
        let first = op.tx.delays[12];
        let last = op.tx.delays[20];
        assert!(first.abs() < 1e-15);
        assert!((first - last).abs() < 1e-15);
        assert!(op.tx.delays[16] > 0.0);
    }

    #[test]
    fn test_linear_rx_padding_at_edge() {
        let mut seq = lin();
        seq.rx_aperture_center_element = vec![0.0, 16.0, 31.0];
        let compiled = compile_linear(&context(seq.into())).unwrap();
        assert!(compiled.ops[0].rx.padding.0 > 0);
        assert_eq!(compiled.ops[1].rx.padding, (0, 0));
        assert!(compiled.ops[2].rx.padding.1 > 0);
    }

    #[test]
    fn test_linear_rejects_mismatched_centers() {
        let mut seq = lin();
        seq.rx_aperture_center_element.pop();
        let err = compile_linear(&context(seq.into())).unwrap_err();
        assert!(matches!(err, KernelError::InvalidParameter { ref name, .. } if name == "rx_aperture_center_element"));
    }

    #[test]
    fn test_plane_wave_delays() {
        let pwi = PwiSequence {
            angles: vec![-0.1, 0.0, 0.1],
            pulse: Pulse::new(5e6, 2.0),
            rx_sample_range: (0, 1024),
            downsampling_factor: 2,
            pri: 200e-6,
            speed_of_sound: Some(1450.0),
            tgc_start: 20.0,
            tgc_slope: 0.0,
        };
        let seq = compile_plane_wave(&context(pwi.into())).unwrap();
        assert_eq!(seq.ops.len(), 3);
        assert!(seq.ops[1].tx.delays.iter().all(|&d| d == 0.0));
        // positive angle: first element fires first
        assert_eq!(seq.ops[2].tx.delays[0], 0.0);
        assert!(seq.ops[2].tx.delays[31] > 0.0);
        assert!(seq.tgc_curve.iter().all(|&g| g == 20.0));
    }

    #[test]
    fn test_tgc_clamped() {
        let mut seq = lin();
        seq.tgc_start = 0.0;
        seq.tgc_slope = 1e5;
        let compiled = compile_linear(&context(seq.into())).unwrap();
        assert_eq!(compiled.tgc_curve.first(), Some(&TGC_MIN_DB));
        assert_eq!(compiled.tgc_curve.last(), Some(&TGC_MAX_DB));
    }

    #[test]
    fn test_unsupported_custom_sequence() {
        let registry = KernelRegistry::with_defaults();
        let ctx = context(Sequence::Custom(CustomSequence {
            name: "sta".to_string(),
            params: serde_json::Value::Null,
        }));
        let err = registry.compile(&ctx).unwrap_err();
        assert!(matches!(err, KernelError::UnsupportedSequence(SequenceKind::Custom(ref n)) if n == "sta"));
    }

    #[test]
    fn test_register_custom_kernel() {
        fn one_shot(ctx: &KernelExecutionContext) -> Result<TxRxSequence, KernelError> {
            let n = ctx.device.probe.n_elements as usize;
            Ok(TxRxSequence::new(
                vec![TxRx {
                    tx: Tx {
                        aperture: vec![true; n],
                        delays: vec![0.0; n],
                        pulse: default_pulse(&ctx.device.probe),
                    },
                    rx: Rx {
                        aperture: vec![true; n],
                        sample_range: (0, 256),
                        downsampling_factor: 1,
                        padding: (0, 0),
                    },
                    pri: 1e-4,
                }],
                vec![],
            ))
        }

        let mut registry = KernelRegistry::with_defaults();
        assert!(registry.register_custom("one_shot", one_shot).is_none());
        let ctx = context(Sequence::Custom(CustomSequence {
            name: "one_shot".to_string(),
            params: serde_json::json!({}),
        }));
        let seq = registry.compile(&ctx).unwrap();
        assert_eq!(seq.ops.len(), 1);
        assert_eq!(seq.ops[0].tx.pulse.center_frequency, 5e6);
    }

    #[test]
    fn test_raw_passthrough_and_kind_mismatch() {
        let compiled = compile_linear(&context(lin().into())).unwrap();
        let raw = compile_raw(&context(compiled.clone().into())).unwrap();
        assert_eq!(raw, compiled);

        let err = compile_raw(&context(lin().into())).unwrap_err();
        assert!(matches!(err, KernelError::KindMismatch { .. }));
    }

    #[test]
    fn test_ddc_requires_decimation() {
        let registry = KernelRegistry::with_defaults();
        let mut ctx = context(lin().into());
        ctx.hardware_ddc = Some(DigitalDownConversion {
            demodulation_frequency: 5e6,
            decimation_factor: 0,
            fir_coefficients: vec![1.0],
        });
        assert!(registry.compile(&ctx).is_err());
    }
}
