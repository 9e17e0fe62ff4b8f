//! TOML configuration for boardmedic.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::guard::DEFAULT_MEMORY_CEILING;
use crate::engine::{Backend, RunRequest};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "BOARDMEDIC_CONFIG";

/// Standard system location, tried after the environment variable.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/boardmedic/boardmedic.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub ram: RamConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration for this process.
    ///
    /// An explicit path must load; a broken file there is an error. The
    /// environment variable and the system path fall through to defaults
    /// with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Try, in order: `$BOARDMEDIC_CONFIG`, [`SYSTEM_CONFIG_PATH`], defaults.
    pub fn load_or_default() -> Self {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_from_candidates(env_path.as_deref(), Path::new(SYSTEM_CONFIG_PATH))
    }

    fn load_from_candidates(env_path: Option<&Path>, system_path: &Path) -> Self {
        if let Some(path) = env_path {
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "{CONFIG_ENV} set but file could not be loaded, trying fallback"
                ),
            }
        }

        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(
                    path = %system_path.display(),
                    error = %e,
                    "system config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// CPU request from the `[cpu]` section.
    pub fn cpu_request(&self) -> RunRequest {
        let mut req = RunRequest::cpu(Duration::from_secs(self.cpu.duration_secs))
            .with_sample_interval(secs_f64(self.cpu.sample_interval_secs))
            .with_backend(self.cpu.backend);
        if let Some(workers) = self.cpu.workers {
            req = req.with_workers(workers);
        }
        req
    }

    /// RAM request from the `[ram]` section.
    pub fn ram_request(&self) -> RunRequest {
        RunRequest::ram_mb(self.ram.total_mb, self.ram.chunk_mb, self.ram.passes)
    }
}

/// Non-finite or negative values map to zero, which request validation
/// rejects.
fn secs_f64(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub duration_secs: u64,
    /// Absent means one worker per logical core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    pub sample_interval_secs: f64,
    pub backend: Backend,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            duration_secs: 10,
            workers: None,
            sample_interval_secs: 1.0,
            backend: Backend::Builtin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RamConfig {
    pub total_mb: u64,
    pub chunk_mb: u64,
    pub passes: u32,
}

impl Default for RamConfig {
    fn default() -> Self {
        Self {
            total_mb: 256,
            chunk_mb: 16,
            passes: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Fraction of available memory a RAM run may use.
    pub memory_ceiling: f64,
    /// How long stopping workers waits before forcing them.
    pub stop_grace_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            stop_grace_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LoadTarget, MIB};

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.cpu.duration_secs, 10);
        assert_eq!(cfg.cpu.workers, None);
        assert_eq!(cfg.cpu.sample_interval_secs, 1.0);
        assert_eq!(cfg.cpu.backend, Backend::Builtin);
        assert_eq!(cfg.ram.total_mb, 256);
        assert_eq!(cfg.ram.chunk_mb, 16);
        assert_eq!(cfg.ram.passes, 1);
        assert_eq!(cfg.safety.memory_ceiling, 0.75);
        assert_eq!(cfg.safety.stop_grace_ms, 1000);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_full_toml() {
        let cfg: EngineConfig = toml::from_str(
            r#"
[cpu]
duration_secs = 30
workers = 2
sample_interval_secs = 0.5
backend = "stress-ng"

[ram]
total_mb = 512
chunk_mb = 32
passes = 3

[safety]
memory_ceiling = 0.5
stop_grace_ms = 250

[logging]
level = "debug"
json = true
"#,
        )
        .unwrap();

        assert_eq!(cfg.cpu.workers, Some(2));
        assert_eq!(cfg.cpu.backend, Backend::StressNg);
        assert_eq!(cfg.ram.passes, 3);
        assert_eq!(cfg.safety.memory_ceiling, 0.5);
        assert!(cfg.logging.json);

        let cpu = cfg.cpu_request();
        assert_eq!(
            cpu.target,
            LoadTarget::Cpu {
                duration: Duration::from_secs(30)
            }
        );
        assert_eq!(cpu.workers, Some(2));
        assert_eq!(cpu.sample_interval, Duration::from_millis(500));
        assert_eq!(cpu.backend, Backend::StressNg);

        assert_eq!(
            cfg.ram_request().target,
            LoadTarget::Ram {
                total_bytes: 512 * MIB,
                chunk_bytes: 32 * MIB,
                passes: 3,
            }
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: EngineConfig = toml::from_str("[ram]\ntotal_mb = 64\n").unwrap();
        assert_eq!(cfg.ram.total_mb, 64);
        assert_eq!(cfg.ram.chunk_mb, 16);
        assert_eq!(cfg.cpu, CpuConfig::default());
        assert_eq!(cfg.safety, SafetyConfig::default());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn test_negative_interval_fails_validation() {
        let mut cfg = EngineConfig::default();
        cfg.cpu.sample_interval_secs = -1.0;
        assert!(cfg.cpu_request().validate().is_err());
    }

    #[test]
    fn test_explicit_path_must_load() {
        assert!(EngineConfig::resolve(Some(Path::new("/nonexistent/boardmedic.toml"))).is_err());

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("boardmedic.toml");
        std::fs::write(&path, "[cpu]\nduration_secs = 4\n").unwrap();
        let cfg = EngineConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.cpu.duration_secs, 4);
    }

    #[test]
    fn test_candidates_fall_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[cpu\n").unwrap();
        let system = dir.path().join("system.toml");
        std::fs::write(&system, "[ram]\npasses = 2\n").unwrap();

        let cfg = EngineConfig::load_from_candidates(Some(&broken), &system);
        assert_eq!(cfg.ram.passes, 2);

        let missing = dir.path().join("missing.toml");
        let cfg = EngineConfig::load_from_candidates(None, &missing);
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn test_serializes_to_toml() {
        let text = toml::to_string_pretty(&EngineConfig::default()).unwrap();
        assert!(text.contains("[safety]"));
        assert!(text.contains("backend = \"builtin\""));
        let back: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, EngineConfig::default());
    }
}
