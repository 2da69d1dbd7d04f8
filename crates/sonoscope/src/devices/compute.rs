//! Compute devices that processing pipelines can be placed on.
//!
//! GPU presence is probed once, when the session is built, and is never
//! re-checked afterwards.

use sonoconf::ComputeConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{DeviceId, DeviceType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub ordinal: u32,
    pub device_node: PathBuf,
}

/// What the host can offer to processing pipelines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeCapabilities {
    gpu: Option<GpuInfo>,
}

impl ComputeCapabilities {
    /// Probe the host according to `[system.compute]`.
    pub fn probe(config: &ComputeConfig) -> Self {
        let gpu = config.gpu_ordinal.and_then(|ordinal| {
            let node = config.gpu_device_node.as_path();
            if node.exists() {
                info!("GPU:{} available via {}", ordinal, node.display());
                Some(GpuInfo {
                    ordinal,
                    device_node: node.to_path_buf(),
                })
            } else {
                debug!("no GPU at {}", node.display());
                None
            }
        });
        Self { gpu }
    }

    /// CPU only.
    pub fn cpu_only() -> Self {
        Self { gpu: None }
    }

    pub fn with_gpu(gpu: GpuInfo) -> Self {
        Self { gpu: Some(gpu) }
    }

    pub fn gpu(&self) -> Option<&GpuInfo> {
        self.gpu.as_ref()
    }

    /// Whether a pipeline can be placed on `id`.
    pub fn supports(&self, id: &DeviceId) -> bool {
        match id.device_type {
            DeviceType::Cpu => id.ordinal == 0,
            DeviceType::Gpu => self.gpu.as_ref().is_some_and(|g| g.ordinal == id.ordinal),
            _ => false,
        }
    }

    /// Construct the wrapper for a supported compute device.
    pub fn device(&self, id: &DeviceId) -> Option<ComputeDevice> {
        if !self.supports(id) {
            return None;
        }
        let device_node = match id.device_type {
            DeviceType::Gpu => self.gpu.as_ref().map(|g| g.device_node.clone()),
            _ => None,
        };
        Some(ComputeDevice {
            id: *id,
            device_node,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeDevice {
    id: DeviceId,
    device_node: Option<PathBuf>,
}

impl ComputeDevice {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn device_node(&self) -> Option<&Path> {
        self.device_node.as_deref()
    }
}
