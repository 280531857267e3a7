//! Backend configuration from environment variables or a TOML file.
//!
//! Environment values are loaded from `GG_BATCH_*` variables with sensible
//! defaults. Invalid values fall back to defaults without crashing; numeric
//! values are floored where zero would be meaningless.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_BATCH_PLATFORM` | host | Memory platform: host, simulated, cuda |
//! | `GG_BATCH_DEVICE_ID` | 0 | Device used for device-resident tensors |
//! | `GG_BATCH_DEVICE_COUNT` | 1 | Simulated device count |
//! | `GG_BATCH_DEVICE_CAPACITY` | 268435456 | Simulated memory per device (bytes) |
//! | `GG_BATCH_DEFERRED_COPIES` | false | Simulated copies land on stream sync |
//! | `GG_BATCH_MAX_BATCH_SIZE` | 8 | Max requests per batch (0 = no batching) |
//! | `GG_BATCH_PINNED_INPUT` | false | Stage inputs in pinned memory |
//! | `GG_BATCH_PINNED_OUTPUT` | false | Stage outputs in pinned memory |
//! | `GG_BATCH_LOG_LEVEL` | info | Log filter directive |
//! | `GG_BATCH_LOG_FORMAT` | json | Log format: json, pretty, compact |

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::batch::BatchSettings;
use crate::error::BackendError;
use crate::memory::{DeviceId, HostPlatform, MemoryPlatform, SimulatedDeviceConfig, SimulatedDevicePlatform};
use crate::telemetry::{self, LogConfig, LogError, LogFormat};

const DEFAULT_DEVICE_CAPACITY: usize = 256 * 1024 * 1024; // 256 MiB
const MIN_DEVICE_CAPACITY: usize = 1024 * 1024; // floor: 1 MiB

/// Which [`MemoryPlatform`] to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    #[default]
    Host,
    Simulated,
    Cuda,
}

impl PlatformKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "host" | "cpu" => Some(Self::Host),
            "simulated" | "sim" => Some(Self::Simulated),
            "cuda" | "gpu" => Some(Self::Cuda),
            _ => None,
        }
    }
}

/// Simulated device settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub device_count: usize,
    /// Bytes per device.
    pub capacity: usize,
    pub deferred_copies: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            capacity: DEFAULT_DEVICE_CAPACITY,
            deferred_copies: false,
        }
    }
}

/// All backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub platform: PlatformKind,
    pub device_id: DeviceId,
    pub simulated: SimulatedConfig,
    pub batch: BatchSettings,
    pub logging: LogConfig,
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub platform: PlatformKind,
    pub device_id: DeviceId,
    pub simulated_device_count: usize,
    pub simulated_capacity: usize,
    pub deferred_copies: bool,
    pub max_batch_size: usize,
    pub use_pinned_input: bool,
    pub use_pinned_output: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var (`1/0`, `true/false`, `yes/no`, `on/off`).
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn load_simulated_config() -> SimulatedConfig {
    let device_count = parse_usize("GG_BATCH_DEVICE_COUNT", 1);
    let capacity = parse_usize("GG_BATCH_DEVICE_CAPACITY", DEFAULT_DEVICE_CAPACITY);
    SimulatedConfig {
        device_count: device_count.max(1),
        capacity: capacity.max(MIN_DEVICE_CAPACITY),
        deferred_copies: parse_bool("GG_BATCH_DEFERRED_COPIES", false),
    }
}

fn load_batch_settings() -> BatchSettings {
    let defaults = BatchSettings::default();
    BatchSettings {
        // Zero is meaningful: the model does not batch.
        max_batch_size: parse_usize("GG_BATCH_MAX_BATCH_SIZE", defaults.max_batch_size),
        use_pinned_input: parse_bool("GG_BATCH_PINNED_INPUT", defaults.use_pinned_input),
        use_pinned_output: parse_bool("GG_BATCH_PINNED_OUTPUT", defaults.use_pinned_output),
    }
}

fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    let level = std::env::var("GG_BATCH_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(defaults.level);
    let format = std::env::var("GG_BATCH_LOG_FORMAT")
        .ok()
        .and_then(|v| LogFormat::parse(&v))
        .unwrap_or(defaults.format);
    LogConfig {
        format,
        level,
        output_path: None,
    }
}

impl BackendConfig {
    /// Load all configuration from environment variables.
    ///
    /// Missing or invalid values fall back to safe defaults without panicking.
    pub fn from_env() -> Self {
        let platform = std::env::var("GG_BATCH_PLATFORM")
            .ok()
            .and_then(|v| PlatformKind::parse(&v))
            .unwrap_or_default();
        Self {
            platform,
            device_id: parse_usize("GG_BATCH_DEVICE_ID", 0),
            simulated: load_simulated_config(),
            batch: load_batch_settings(),
            logging: load_log_config(),
        }
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, BackendError> {
        let config: Self = toml::from_str(text).map_err(|e| BackendError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BackendError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, BackendError> {
        toml::to_string_pretty(self).map_err(|e| BackendError::Config(e.to_string()))
    }

    /// Reject values a file may contain but the environment loader floors.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.platform == PlatformKind::Simulated {
            if self.simulated.device_count == 0 {
                return Err(BackendError::Config("simulated.device_count must be at least 1".into()));
            }
            if self.simulated.capacity < MIN_DEVICE_CAPACITY {
                return Err(BackendError::Config(format!(
                    "simulated.capacity must be at least {} bytes",
                    MIN_DEVICE_CAPACITY
                )));
            }
            if self.device_id >= self.simulated.device_count {
                return Err(BackendError::Config(format!(
                    "device_id {} out of range for {} simulated devices",
                    self.device_id, self.simulated.device_count
                )));
            }
        }
        Ok(())
    }

    /// Construct the configured memory platform.
    pub fn build_platform(&self) -> Result<Arc<dyn MemoryPlatform>, BackendError> {
        self.validate()?;
        let platform: Arc<dyn MemoryPlatform> = match self.platform {
            PlatformKind::Host => Arc::new(HostPlatform::new()),
            PlatformKind::Simulated => Arc::new(SimulatedDevicePlatform::new(SimulatedDeviceConfig {
                device_count: self.simulated.device_count,
                capacity_per_device: self.simulated.capacity,
                deferred_copies: self.simulated.deferred_copies,
            })),
            #[cfg(feature = "cuda")]
            PlatformKind::Cuda => Arc::new(crate::memory::CudaPlatform::new()?),
            #[cfg(not(feature = "cuda"))]
            PlatformKind::Cuda => {
                return Err(BackendError::Config(
                    "cuda platform requested but the crate was built without the `cuda` feature".into(),
                ))
            }
        };
        tracing::info!(platform = platform.name(), device_id = self.device_id, "memory platform ready");
        Ok(platform)
    }

    /// Install the global subscriber described by the `logging` section.
    pub fn init_logging(&self) -> Result<(), LogError> {
        telemetry::init_logging(&self.logging)
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            platform: self.platform,
            device_id: self.device_id,
            simulated_device_count: self.simulated.device_count,
            simulated_capacity: self.simulated.capacity,
            deferred_copies: self.simulated.deferred_copies,
            max_batch_size: self.batch.max_batch_size,
            use_pinned_input: self.batch.use_pinned_input,
            use_pinned_output: self.batch.use_pinned_output,
            log_level: self.logging.level.clone(),
            log_format: self.logging.format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "GG_BATCH_PLATFORM",
        "GG_BATCH_DEVICE_ID",
        "GG_BATCH_DEVICE_COUNT",
        "GG_BATCH_DEVICE_CAPACITY",
        "GG_BATCH_DEFERRED_COPIES",
        "GG_BATCH_MAX_BATCH_SIZE",
        "GG_BATCH_PINNED_INPUT",
        "GG_BATCH_PINNED_OUTPUT",
        "GG_BATCH_LOG_LEVEL",
        "GG_BATCH_LOG_FORMAT",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = BackendConfig::from_env();
        assert_eq!(cfg, BackendConfig::default());
        assert_eq!(cfg.platform, PlatformKind::Host);
        assert_eq!(cfg.batch.max_batch_size, 8);
        assert_eq!(cfg.simulated.capacity, 256 * 1024 * 1024);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_BATCH_PLATFORM", "simulated");
        std::env::set_var("GG_BATCH_DEVICE_COUNT", "2");
        std::env::set_var("GG_BATCH_DEVICE_ID", "1");
        std::env::set_var("GG_BATCH_DEFERRED_COPIES", "yes");
        std::env::set_var("GG_BATCH_MAX_BATCH_SIZE", "0");
        std::env::set_var("GG_BATCH_PINNED_OUTPUT", "1");
        std::env::set_var("GG_BATCH_LOG_FORMAT", "pretty");
        let cfg = BackendConfig::from_env();
        assert_eq!(cfg.platform, PlatformKind::Simulated);
        assert_eq!(cfg.simulated.device_count, 2);
        assert_eq!(cfg.device_id, 1);
        assert!(cfg.simulated.deferred_copies);
        assert_eq!(cfg.batch.max_batch_size, 0);
        assert!(cfg.batch.use_pinned_output);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_BATCH_PLATFORM", "tpu");
        std::env::set_var("GG_BATCH_MAX_BATCH_SIZE", "many");
        std::env::set_var("GG_BATCH_DEFERRED_COPIES", "maybe");
        std::env::set_var("GG_BATCH_LOG_FORMAT", "xml");
        let cfg = BackendConfig::from_env();
        assert_eq!(cfg.platform, PlatformKind::Host);
        assert_eq!(cfg.batch.max_batch_size, 8);
        assert!(!cfg.simulated.deferred_copies);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        clear_env_vars();
    }

    #[test]
    fn test_device_floors() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_BATCH_DEVICE_COUNT", "0");
        std::env::set_var("GG_BATCH_DEVICE_CAPACITY", "16");
        let cfg = BackendConfig::from_env();
        assert_eq!(cfg.simulated.device_count, 1);
        assert!(cfg.simulated.capacity >= 1024 * 1024, "capacity must have floor");
        clear_env_vars();
    }

    #[test]
    fn test_toml_partial_document_uses_defaults() {
        let cfg = BackendConfig::from_toml_str(
            r#"
            platform = "simulated"

            [batch]
            max_batch_size = 4

            [simulated]
            deferred_copies = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.platform, PlatformKind::Simulated);
        assert_eq!(cfg.batch.max_batch_size, 4);
        assert!(!cfg.batch.use_pinned_input);
        assert!(cfg.simulated.deferred_copies);
        assert_eq!(cfg.simulated.device_count, 1);
    }

    #[test]
    fn test_toml_rejects_bad_values() {
        let unknown_platform = BackendConfig::from_toml_str(r#"platform = "tpu""#);
        assert!(matches!(unknown_platform, Err(BackendError::Config(_))));

        let bad_device = BackendConfig::from_toml_str(
            r#"
            platform = "simulated"
            device_id = 3
            "#,
        );
        assert!(matches!(bad_device, Err(BackendError::Config(_))));
    }

    #[test]
    fn test_from_file_round_trip() {
        let mut cfg = BackendConfig::default();
        cfg.platform = PlatformKind::Simulated;
        cfg.simulated.device_count = 2;
        cfg.batch.max_batch_size = 16;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cfg.to_toml_string().unwrap().as_bytes()).unwrap();
        let loaded = BackendConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_logging_section_drives_init() {
        let cfg = BackendConfig::from_toml_str(
            r#"
            [logging]
            level = "gg_batch=loud"
            "#,
        )
        .unwrap();
        assert!(matches!(cfg.init_logging(), Err(LogError::InvalidFilter(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = BackendConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(BackendError::Config(_))));
    }

    #[test]
    fn test_build_platform_matches_kind() {
        let host = BackendConfig::default().build_platform().unwrap();
        assert_eq!(host.name(), "host");
        assert!(!host.capabilities().device_memory);

        let sim = BackendConfig {
            platform: PlatformKind::Simulated,
            ..Default::default()
        }
        .build_platform()
        .unwrap();
        assert_eq!(sim.name(), "simulated");
        assert!(sim.capabilities().device_memory);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_without_feature_is_config_error() {
        let cfg = BackendConfig {
            platform: PlatformKind::Cuda,
            ..Default::default()
        };
        assert!(matches!(cfg.build_platform(), Err(BackendError::Config(_))));
    }

    #[test]
    fn test_effective_config_serializes() {
        let cfg = BackendConfig::default();
        let json = serde_json::to_value(cfg.effective_config()).unwrap();
        assert_eq!(json["platform"], "host");
        assert_eq!(json["max_batch_size"], 8);
        assert_eq!(json["log_format"], "json");
        assert_eq!(json["simulated_capacity"], 256 * 1024 * 1024);
    }
}
