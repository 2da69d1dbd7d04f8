//! Config file discovery, loading, and environment variable overlay.

use crate::infra::{PathsConfig, TelemetryConfig};
use crate::system::{ComputeConfig, ProbeConfig, SystemConfig, SystemKind, WorkMode};
use crate::{ConfigError, InfraConfig, SonoConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with an explicit session file.
///
/// If `session_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(session_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/sonoscope/session.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("sonoscope/session.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = session_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("sonoscope.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<SonoConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.into(),
    }
}

/// TOML allows integers where we want floats (`n = 65000000`); accept both.
fn as_number(value: &toml::Value) -> Option<f64> {
    value
        .as_float()
        .or_else(|| value.as_integer().map(|v| v as f64))
}

fn get_u32(table: &toml::Table, section: &str, key: &str) -> Result<Option<u32>, ConfigError> {
    match table.get(key) {
        None => Ok(None),
        Some(v) => {
            let raw = v
                .as_integer()
                .ok_or_else(|| invalid(&format!("{section}.{key}"), "expected an integer"))?;
            u32::try_from(raw)
                .map(Some)
                .map_err(|_| invalid(&format!("{section}.{key}"), format!("{raw} out of range")))
        }
    }
}

fn get_f64(table: &toml::Table, section: &str, key: &str) -> Result<Option<f64>, ConfigError> {
    match table.get(key) {
        None => Ok(None),
        Some(v) => as_number(v)
            .map(Some)
            .ok_or_else(|| invalid(&format!("{section}.{key}"), "expected a number")),
    }
}

/// Parse config from TOML string.
pub(crate) fn parse_toml(contents: &str, path: &Path) -> Result<SonoConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut infra = InfraConfig::default();

    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("data_dir").and_then(|v| v.as_str()) {
            infra.paths.data_dir = expand_path(v);
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            infra.telemetry.log_level = v.to_string();
        }
    }

    let mut system = SystemConfig::default();

    if let Some(section) = table.get("system").and_then(|v| v.as_table()) {
        if let Some(v) = section.get("kind").and_then(|v| v.as_str()) {
            system.kind = SystemKind::parse(v)
                .ok_or_else(|| invalid("system.kind", format!("unknown system kind '{v}'")))?;
        }
        if let Some(v) = get_f64(section, "system", "sampling_frequency")? {
            if v <= 0.0 {
                return Err(invalid("system.sampling_frequency", "must be positive"));
            }
            system.sampling_frequency = v;
        }
        if let Some(v) = get_u32(section, "system", "n_modules")? {
            system.n_modules = v;
        }
        if let Some(v) = get_u32(section, "system", "channels_per_module")? {
            system.channels_per_module = v;
        }

        if let Some(probe) = section.get("probe").and_then(|v| v.as_table()) {
            if let Some(v) = probe.get("model").and_then(|v| v.as_str()) {
                system.probe.model = v.to_string();
            }
            if let Some(v) = get_u32(probe, "system.probe", "n_elements")? {
                system.probe.n_elements = v;
            }
            if let Some(v) = get_f64(probe, "system.probe", "pitch")? {
                system.probe.pitch = v;
            }
            if let Some(v) = get_f64(probe, "system.probe", "center_frequency")? {
                system.probe.center_frequency = v;
            }
        }

        if let Some(acq) = section.get("acquisition").and_then(|v| v.as_table()) {
            if let Some(v) = acq.get("work_mode").and_then(|v| v.as_str()) {
                system.acquisition.work_mode = WorkMode::parse(v).ok_or_else(|| {
                    invalid("system.acquisition.work_mode", format!("unknown work mode '{v}'"))
                })?;
            }
            if let Some(v) = get_u32(acq, "system.acquisition", "buffer_elements")? {
                if v == 0 {
                    return Err(invalid(
                        "system.acquisition.buffer_elements",
                        "must be at least 1",
                    ));
                }
                system.acquisition.buffer_elements = v;
            }
            if let Some(v) = acq.get("stop_on_overflow").and_then(|v| v.as_bool()) {
                system.acquisition.stop_on_overflow = v;
            }
        }

        if let Some(file) = section.get("file").and_then(|v| v.as_table()) {
            if let Some(v) = file.get("path").and_then(|v| v.as_str()) {
                system.file.path = Some(expand_path(v));
            }
            if let Some(v) = get_u32(file, "system.file", "n_frames")? {
                system.file.n_frames = v;
            }
        }

        if let Some(compute) = section.get("compute").and_then(|v| v.as_table()) {
            if let Some(v) = compute.get("gpu_ordinal").and_then(|v| v.as_integer()) {
                system.compute.gpu_ordinal = u32::try_from(v).ok();
            }
            if let Some(v) = compute.get("gpu_device_node").and_then(|v| v.as_str()) {
                system.compute.gpu_device_node = expand_path(v);
            }
        }
    }

    Ok(SonoConfig { infra, system })
}

/// Pick the overlay value when it was set to something other than the default.
fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence field by field.
pub fn merge_configs(base: SonoConfig, overlay: SonoConfig) -> SonoConfig {
    let defaults = SonoConfig::default();
    let (b, o, d) = (base.system, overlay.system, defaults.system);

    SonoConfig {
        infra: InfraConfig {
            paths: PathsConfig {
                data_dir: pick(
                    base.infra.paths.data_dir,
                    overlay.infra.paths.data_dir,
                    PathsConfig::default().data_dir,
                ),
            },
            telemetry: TelemetryConfig {
                log_level: pick(
                    base.infra.telemetry.log_level,
                    overlay.infra.telemetry.log_level,
                    TelemetryConfig::default().log_level,
                ),
            },
        },
        system: SystemConfig {
            kind: pick(b.kind, o.kind, d.kind),
            sampling_frequency: pick(b.sampling_frequency, o.sampling_frequency, d.sampling_frequency),
            n_modules: pick(b.n_modules, o.n_modules, d.n_modules),
            channels_per_module: pick(
                b.channels_per_module,
                o.channels_per_module,
                d.channels_per_module,
            ),
            probe: ProbeConfig {
                model: pick(b.probe.model, o.probe.model, d.probe.model),
                n_elements: pick(b.probe.n_elements, o.probe.n_elements, d.probe.n_elements),
                pitch: pick(b.probe.pitch, o.probe.pitch, d.probe.pitch),
                center_frequency: pick(
                    b.probe.center_frequency,
                    o.probe.center_frequency,
                    d.probe.center_frequency,
                ),
            },
            acquisition: crate::AcquisitionConfig {
                work_mode: pick(
                    b.acquisition.work_mode,
                    o.acquisition.work_mode,
                    d.acquisition.work_mode,
                ),
                buffer_elements: pick(
                    b.acquisition.buffer_elements,
                    o.acquisition.buffer_elements,
                    d.acquisition.buffer_elements,
                ),
                stop_on_overflow: pick(
                    b.acquisition.stop_on_overflow,
                    o.acquisition.stop_on_overflow,
                    d.acquisition.stop_on_overflow,
                ),
            },
            file: crate::FileConfig {
                path: o.file.path.or(b.file.path),
                n_frames: pick(b.file.n_frames, o.file.n_frames, d.file.n_frames),
            },
            compute: ComputeConfig {
                gpu_ordinal: pick(b.compute.gpu_ordinal, o.compute.gpu_ordinal, d.compute.gpu_ordinal),
                gpu_device_node: pick(
                    b.compute.gpu_device_node,
                    o.compute.gpu_device_node,
                    d.compute.gpu_device_node,
                ),
            },
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(
    config: &mut SonoConfig,
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    if let Ok(v) = env::var("SONOSCOPE_DATA_DIR") {
        config.infra.paths.data_dir = expand_path(&v);
        sources.env_overrides.push("SONOSCOPE_DATA_DIR".to_string());
    }

    if let Ok(v) = env::var("SONOSCOPE_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("SONOSCOPE_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("SONOSCOPE_WORK_MODE") {
        config.system.acquisition.work_mode = WorkMode::parse(&v)
            .ok_or_else(|| invalid("SONOSCOPE_WORK_MODE", format!("unknown work mode '{v}'")))?;
        sources.env_overrides.push("SONOSCOPE_WORK_MODE".to_string());
    }
    if let Ok(v) = env::var("SONOSCOPE_BUFFER_ELEMENTS") {
        match v.parse::<u32>() {
            Ok(n) if n > 0 => {
                config.system.acquisition.buffer_elements = n;
                sources.env_overrides.push("SONOSCOPE_BUFFER_ELEMENTS".to_string());
            }
            _ => return Err(invalid("SONOSCOPE_BUFFER_ELEMENTS", format!("'{v}' is not a positive integer"))),
        }
    }
    if let Ok(v) = env::var("SONOSCOPE_FILE") {
        config.system.file.path = Some(expand_path(&v));
        sources.env_overrides.push("SONOSCOPE_FILE".to_string());
    }

    Ok(())
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[system.acquisition]
work_mode = "manual"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.system.acquisition.work_mode, WorkMode::Manual);
        // Other values should be defaults
        assert_eq!(config.system.acquisition.buffer_elements, 4);
        assert_eq!(config.system.sampling_frequency, 65e6);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[paths]
data_dir = "/data/sonoscope"

[telemetry]
log_level = "debug"

[system]
kind = "us4r"
sampling_frequency = 65000000
n_modules = 4
channels_per_module = 32

[system.probe]
model = "AL2442"
n_elements = 128
pitch = 0.3e-3
center_frequency = 5.5e6

[system.acquisition]
work_mode = "async"
buffer_elements = 16
stop_on_overflow = false

[system.compute]
gpu_ordinal = -1
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();

        assert_eq!(config.infra.paths.data_dir, PathBuf::from("/data/sonoscope"));
        assert_eq!(config.infra.telemetry.log_level, "debug");
        assert_eq!(config.system.sampling_frequency, 65e6);
        assert_eq!(config.system.n_modules, 4);
        assert_eq!(config.system.probe.model, "AL2442");
        assert_eq!(config.system.probe.n_elements, 128);
        assert_eq!(config.system.acquisition.work_mode, WorkMode::Async);
        assert_eq!(config.system.acquisition.buffer_elements, 16);
        assert!(!config.system.acquisition.stop_on_overflow);
        assert_eq!(config.system.compute.gpu_ordinal, None);
    }

    #[test]
    fn test_parse_rejects_unknown_work_mode() {
        let toml = r#"
[system.acquisition]
work_mode = "sometimes"
"#;
        let err = parse_toml(toml, Path::new("test.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "system.acquisition.work_mode"));
    }

    #[test]
    fn test_parse_rejects_empty_buffer() {
        let toml = r#"
[system.acquisition]
buffer_elements = 0
"#;
        assert!(parse_toml(toml, Path::new("test.toml")).is_err());
    }

    #[test]
    fn test_parse_syntax_error() {
        let err = parse_toml("[system", Path::new("broken.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_merge_overlay_wins_only_when_set() {
        let base = parse_toml(
            r#"
[system]
n_modules = 4
[system.acquisition]
buffer_elements = 8
"#,
            Path::new("base.toml"),
        )
        .unwrap();
        let overlay = parse_toml(
            r#"
[system.acquisition]
work_mode = "manual"
"#,
            Path::new("overlay.toml"),
        )
        .unwrap();

        let merged = merge_configs(base, overlay);
        assert_eq!(merged.system.n_modules, 4);
        assert_eq!(merged.system.acquisition.buffer_elements, 8);
        assert_eq!(merged.system.acquisition.work_mode, WorkMode::Manual);
    }
}
