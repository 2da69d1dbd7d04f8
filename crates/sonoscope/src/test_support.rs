//! Fixtures shared by unit tests.

use std::collections::BTreeMap;

use crate::devices::{DataDescription, DeviceId, DeviceType, ProbeDescriptor, UltrasoundDescriptor};
use crate::metadata::{ConstMetadata, FrameAcquisitionContext};
use crate::ops::{Medium, TxRxSequence};

/// Metadata for raw int16 frames of `shape`, acquired by a 64-element probe.
pub(crate) fn metadata_with_shape(shape: Vec<usize>) -> ConstMetadata {
    let device = UltrasoundDescriptor {
        id: DeviceId::new(DeviceType::Us4R, 0),
        probe: ProbeDescriptor {
            model: "test".to_string(),
            n_elements: 64,
            pitch: 0.2e-3,
            center_frequency: 6e6,
        },
        sampling_frequency: 65e6,
    };
    let raw = TxRxSequence::new(Vec::new(), Vec::new());
    ConstMetadata::new(
        FrameAcquisitionContext {
            device,
            sequence: raw.clone().into(),
            raw_sequence: raw,
            medium: Medium::soft_tissue(),
            custom_data: BTreeMap::new(),
        },
        DataDescription {
            sampling_frequency: 65e6,
            frame_channel_mapping: None,
            custom: BTreeMap::new(),
        },
        shape,
        false,
    )
}
