use portable_atomic::AtomicF64;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use super::{DataDescription, DeviceId, ProbeDescriptor, UltrasoundDescriptor, UltrasoundDevice};
use crate::hardware::{DeviceHandle, UploadResult};
use crate::kernels::KernelExecutionContext;
use crate::ops::TxRxSequence;

/// Front-end stand-in that replays a recorded acquisition.
///
/// The recording was made with a fixed configuration, so the kernel
/// context does not change the sampling frequency except for DDC.
#[derive(Debug)]
pub struct FileDevice {
    id: DeviceId,
    probe: ProbeDescriptor,
    sampling_frequency: f64,
    source: Option<PathBuf>,
    current_sampling_frequency: AtomicF64,
}

impl FileDevice {
    pub fn new(handle: DeviceHandle) -> Self {
        Self {
            id: handle.id,
            probe: handle.probe,
            sampling_frequency: handle.sampling_frequency,
            source: handle.source,
            current_sampling_frequency: AtomicF64::new(handle.sampling_frequency),
        }
    }

    pub fn source(&self) -> Option<&PathBuf> {
        self.source.as_ref()
    }
}

impl UltrasoundDevice for FileDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn set_kernel_context(&self, context: &KernelExecutionContext) {
        let decimation = context
            .hardware_ddc
            .as_ref()
            .map(|ddc| ddc.decimation_factor.max(1))
            .unwrap_or(1);
        self.current_sampling_frequency
            .store(self.sampling_frequency / decimation as f64, Ordering::Release);
    }

    fn get_dto(&self) -> UltrasoundDescriptor {
        UltrasoundDescriptor {
            id: self.id,
            probe: self.probe.clone(),
            sampling_frequency: self.sampling_frequency,
        }
    }

    fn get_data_description(
        &self,
        upload_result: &UploadResult,
        _sequence: &TxRxSequence,
    ) -> DataDescription {
        let mut custom = BTreeMap::new();
        if let Some(source) = &self.source {
            custom.insert(
                "source".to_string(),
                source.display().to_string().into(),
            );
        }
        DataDescription {
            sampling_frequency: self.current_sampling_frequency(),
            frame_channel_mapping: upload_result.frame_channel_mapping.clone(),
            custom,
        }
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn current_sampling_frequency(&self) -> f64 {
        self.current_sampling_frequency.load(Ordering::Acquire)
    }
}
