//! Session configuration loading for Sonoscope.
//!
//! This crate provides configuration loading with minimal dependencies so
//! that every Sonoscope crate (and host applications embedding a session)
//! can import it.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): paths and telemetry - fixed for the
//!   lifetime of the process.
//!
//! - **System** (`SystemConfig`): the front-end a session connects to (probe,
//!   sampling frequency, module layout) and acquisition defaults. The
//!   uploaded scheme overrides the acquisition defaults it specifies.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sonoconf::SonoConfig;
//!
//! let config = SonoConfig::load_session_file("us4r_L3-9i-D.toml")
//!     .expect("Failed to load session config");
//!
//! println!("probe: {}", config.system.probe.model);
//! println!("buffer elements: {}", config.system.acquisition.buffer_elements);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/sonoscope/session.toml` (system)
//! 2. `~/.config/sonoscope/session.toml` (user)
//! 3. the session file passed to `Session::open`, or `./sonoscope.toml`
//! 4. Environment variables (`SONOSCOPE_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! data_dir = "~/.local/share/sonoscope"
//!
//! [telemetry]
//! log_level = "info"
//!
//! [system]
//! kind = "us4r"
//! sampling_frequency = 65e6
//! n_modules = 2
//!
//! [system.probe]
//! model = "L3-9i-D"
//! n_elements = 192
//! pitch = 0.2e-3
//!
//! [system.acquisition]
//! work_mode = "host"
//! buffer_elements = 4
//! stop_on_overflow = true
//! ```

pub mod infra;
pub mod loader;
pub mod system;

pub use infra::{InfraConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use system::{
    AcquisitionConfig, ComputeConfig, FileConfig, ProbeConfig, SystemConfig, SystemKind, WorkMode,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Complete Sonoscope configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SonoConfig {
    /// Infrastructure - fixed for the process.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Front-end description and acquisition defaults.
    #[serde(default)]
    pub system: SystemConfig,
}

impl SonoConfig {
    /// Load configuration from all discovered sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/sonoscope/session.toml`
    /// 3. `~/.config/sonoscope/session.toml`
    /// 4. `./sonoscope.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration for a session from an explicit file.
    ///
    /// Unlike [`SonoConfig::load_from`], the file must exist: a session
    /// cannot be opened against a front-end description that isn't there.
    pub fn load_session_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let (config, _sources) = Self::load_with_sources_from(Some(path))?;
        Ok(config)
    }

    /// Load configuration from an optional file path, then apply env overrides.
    ///
    /// If `config_path` is provided and exists, it takes precedence over the
    /// local `./sonoscope.toml` override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = SonoConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources)?;

        Ok((config, sources))
    }

    /// Parse a configuration from TOML text (no discovery, no env overlay).
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        loader::parse_toml(contents, Path::new("<inline>"))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let system = &self.system;
        let mut output = String::new();

        output.push_str("# Sonoscope Session Configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "data_dir = \"{}\"\n",
            self.infra.paths.data_dir.display()
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        output.push_str("\n[system]\n");
        output.push_str(&format!("kind = \"{}\"\n", system.kind.as_str()));
        output.push_str(&format!(
            "sampling_frequency = {:?}\n",
            system.sampling_frequency
        ));
        output.push_str(&format!("n_modules = {}\n", system.n_modules));
        output.push_str(&format!(
            "channels_per_module = {}\n",
            system.channels_per_module
        ));

        output.push_str("\n[system.probe]\n");
        output.push_str(&format!("model = \"{}\"\n", system.probe.model));
        output.push_str(&format!("n_elements = {}\n", system.probe.n_elements));
        output.push_str(&format!("pitch = {:?}\n", system.probe.pitch));
        output.push_str(&format!(
            "center_frequency = {:?}\n",
            system.probe.center_frequency
        ));

        output.push_str("\n[system.acquisition]\n");
        output.push_str(&format!(
            "work_mode = \"{}\"\n",
            system.acquisition.work_mode.as_str()
        ));
        output.push_str(&format!(
            "buffer_elements = {}\n",
            system.acquisition.buffer_elements
        ));
        output.push_str(&format!(
            "stop_on_overflow = {}\n",
            system.acquisition.stop_on_overflow
        ));

        output.push_str("\n[system.file]\n");
        if let Some(path) = &system.file.path {
            output.push_str(&format!("path = \"{}\"\n", path.display()));
        }
        output.push_str(&format!("n_frames = {}\n", system.file.n_frames));

        output.push_str("\n[system.compute]\n");
        match system.compute.gpu_ordinal {
            Some(ordinal) => output.push_str(&format!("gpu_ordinal = {}\n", ordinal)),
            // negative disables GPU discovery
            None => output.push_str("gpu_ordinal = -1\n"),
        }
        output.push_str(&format!(
            "gpu_device_node = \"{}\"\n",
            system.compute.gpu_device_node.display()
        ));

        output
    }
}
