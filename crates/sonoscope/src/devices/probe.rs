use serde::{Deserialize, Serialize};
use sonoconf::ProbeConfig;

/// Transducer attached to an ultrasound front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeDescriptor {
    pub model: String,
    pub n_elements: u32,
    /// Element pitch [m]
    pub pitch: f64,
    /// Nominal center frequency [Hz]
    pub center_frequency: f64,
}

impl ProbeDescriptor {
    /// Lateral distance between two (fractional) element positions [m].
    pub fn distance(&self, from: f64, to: f64) -> f64 {
        (to - from) * self.pitch
    }

    /// Full aperture width [m].
    pub fn width(&self) -> f64 {
        self.n_elements.saturating_sub(1) as f64 * self.pitch
    }
}

impl From<&ProbeConfig> for ProbeDescriptor {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            model: config.model.clone(),
            n_elements: config.n_elements,
            pitch: config.pitch,
            center_frequency: config.center_frequency,
        }
    }
}
