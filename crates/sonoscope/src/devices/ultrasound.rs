//! The capability every ultrasound front-end provides to a session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::{DeviceId, ProbeDescriptor};
use crate::hardware::UploadResult;
use crate::kernels::KernelExecutionContext;
use crate::ops::TxRxSequence;

/// Marks a logical channel with no physical counterpart.
pub const UNAVAILABLE_CHANNEL: i32 = -1;

/// Snapshot of a front-end used for sequence compilation and metadata.
///
/// Two descriptors are equal when they describe the same device id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UltrasoundDescriptor {
    pub id: DeviceId,
    pub probe: ProbeDescriptor,
    /// Nominal ADC sampling frequency [Hz]
    pub sampling_frequency: f64,
}

impl PartialEq for UltrasoundDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for UltrasoundDescriptor {}

impl Hash for UltrasoundDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Physical location of one logical (frame, channel) sample column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Acquisition module that recorded the channel
    pub module: u8,
    /// Frame number within that module's output
    pub frame: u32,
    /// Channel within that frame
    pub channel: i32,
}

/// Maps logical (frame, channel) to the module/frame/channel it was acquired on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameChannelMapping {
    n_frames: u32,
    n_channels: u32,
    entries: Vec<Option<MappingEntry>>,
}

impl FrameChannelMapping {
    pub fn n_frames(&self) -> u32 {
        self.n_frames
    }

    pub fn n_channels(&self) -> u32 {
        self.n_channels
    }

    pub fn get(&self, frame: u32, channel: u32) -> Option<MappingEntry> {
        if frame >= self.n_frames || channel >= self.n_channels {
            return None;
        }
        self.entries[(frame * self.n_channels + channel) as usize]
    }

    /// Physical channel number, or [`UNAVAILABLE_CHANNEL`].
    pub fn channel(&self, frame: u32, channel: u32) -> i32 {
        self.get(frame, channel)
            .map(|entry| entry.channel)
            .unwrap_or(UNAVAILABLE_CHANNEL)
    }
}

/// Builder for [`FrameChannelMapping`]; every entry starts unavailable.
#[derive(Debug)]
pub struct FrameChannelMappingBuilder {
    n_frames: u32,
    n_channels: u32,
    entries: Vec<Option<MappingEntry>>,
}

impl FrameChannelMappingBuilder {
    pub fn new(n_frames: u32, n_channels: u32) -> Self {
        Self {
            n_frames,
            n_channels,
            entries: vec![None; (n_frames * n_channels) as usize],
        }
    }

    /// Out-of-range coordinates are ignored.
    pub fn set(&mut self, frame: u32, channel: u32, entry: MappingEntry) -> &mut Self {
        if frame < self.n_frames && channel < self.n_channels {
            self.entries[(frame * self.n_channels + channel) as usize] = Some(entry);
        }
        self
    }

    pub fn build(self) -> FrameChannelMapping {
        FrameChannelMapping {
            n_frames: self.n_frames,
            n_channels: self.n_channels,
            entries: self.entries,
        }
    }
}

/// Layout contract for frames acquired by an uploaded sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataDescription {
    /// Sampling frequency of the delivered data [Hz], after decimation.
    pub sampling_frequency: f64,
    pub frame_channel_mapping: Option<FrameChannelMapping>,
    pub custom: BTreeMap<String, serde_json::Value>,
}

/// Operations a session needs from any ultrasound front-end.
///
/// Wrappers are shared between `get_device` callers, so the context hook
/// takes `&self`; implementations keep their bookkeeping in atomics.
pub trait UltrasoundDevice: Send + Sync + fmt::Debug {
    fn id(&self) -> &DeviceId;

    /// Called with the context of each upload, before data description.
    fn set_kernel_context(&self, context: &KernelExecutionContext);

    fn get_dto(&self) -> UltrasoundDescriptor;

    /// Derive the frame layout for an upload.
    ///
    /// Expected to move into the hardware core eventually; callers should
    /// not rely on this living on the device.
    fn get_data_description(
        &self,
        upload_result: &UploadResult,
        sequence: &TxRxSequence,
    ) -> DataDescription;

    /// Nominal ADC sampling frequency [Hz].
    fn sampling_frequency(&self) -> f64;

    /// Sampling frequency after downsampling/DDC for the last upload [Hz].
    fn current_sampling_frequency(&self) -> f64;
}
