use portable_atomic::AtomicF64;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use tracing::debug;

use super::{DataDescription, DeviceId, ProbeDescriptor, UltrasoundDescriptor, UltrasoundDevice};
use crate::hardware::{DeviceHandle, UploadResult};
use crate::kernels::KernelExecutionContext;
use crate::ops::TxRxSequence;

/// us4R / us4R-lite front-end: a set of us4OEM acquisition modules behind
/// one probe.
#[derive(Debug)]
pub struct Us4R {
    id: DeviceId,
    probe: ProbeDescriptor,
    sampling_frequency: f64,
    n_modules: u32,
    channels_per_module: u32,
    current_sampling_frequency: AtomicF64,
}

impl Us4R {
    pub fn new(handle: DeviceHandle) -> Self {
        Self {
            id: handle.id,
            probe: handle.probe,
            sampling_frequency: handle.sampling_frequency,
            n_modules: handle.n_modules,
            channels_per_module: handle.channels_per_module,
            current_sampling_frequency: AtomicF64::new(handle.sampling_frequency),
        }
    }

    pub fn n_modules(&self) -> u32 {
        self.n_modules
    }

    /// Receive channels recorded per transmit event.
    pub fn n_rx_channels(&self) -> u32 {
        self.n_modules * self.channels_per_module
    }
}

impl UltrasoundDevice for Us4R {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn set_kernel_context(&self, context: &KernelExecutionContext) {
        let divisor = match &context.hardware_ddc {
            Some(ddc) => ddc.decimation_factor,
            None => context.op.downsampling_factor(),
        };
        let fs = self.sampling_frequency / divisor.max(1) as f64;
        self.current_sampling_frequency.store(fs, Ordering::Release);
        debug!("{}: current sampling frequency {} Hz", self.id, fs);
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
        sequence: &TxRxSequence,
    ) -> DataDescription {
        let mut custom = BTreeMap::new();
        custom.insert("n_modules".to_string(), self.n_modules.into());
        custom.insert(
            "channels_per_module".to_string(),
            self.channels_per_module.into(),
        );
        custom.insert("n_ops".to_string(), sequence.ops.len().into());

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
