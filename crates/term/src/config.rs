//! Terminal configuration management

use anyhow::{Context, Result, anyhow};
use common::DeviceSelector;
use driver::{TransportSettings, WorkerSettings};
use protocol::{LineCoding, LineState, Parity, StopBits};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermConfig {
    #[serde(default)]
    pub term: TermSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub line: LineSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermSettings {
    pub log_level: String,
}

impl Default for TermSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// `first`, `0xVID:0xPID`, `0xVID:*` or `BUS.ADDR`
    #[serde(default = "DeviceSettings::default_selector")]
    pub selector: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            selector: Self::default_selector(),
        }
    }
}

impl DeviceSettings {
    fn default_selector() -> String {
        "first".to_string()
    }
}

/// Serial line parameters, applied right after open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub data_bits: u8,
    /// Assert RTS after open
    pub rts: bool,
    /// Assert DTR after open
    pub dtr: bool,
}

impl Default for LineSettings {
    fn default() -> Self {
        let coding = LineCoding::default();
        Self {
            baud_rate: coding.baud_rate,
            stop_bits: coding.stop_bits,
            parity: coding.parity,
            data_bits: coding.data_bits,
            rts: true,
            dtr: true,
        }
    }
}

/// Bulk transfer timeouts; unset means the driver default of one second
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default)]
    pub read_ms: Option<u64>,
    #[serde(default)]
    pub write_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub poll_read_timeout_ms: u64,
    pub read_chunk_size: usize,
    pub max_pass_bytes: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let settings = WorkerSettings::default();
        Self {
            poll_interval_ms: settings.poll_interval.as_millis() as u64,
            poll_read_timeout_ms: settings.poll_read_timeout.as_millis() as u64,
            read_chunk_size: settings.read_chunk_size,
            max_pass_bytes: settings.max_pass_bytes,
            queue_capacity: settings.queue_capacity,
        }
    }
}

impl Default for TermConfig {
    fn default() -> Self {
        Self {
            term: TermSettings::default(),
            device: DeviceSettings::default(),
            line: LineSettings::default(),
            timeouts: TimeoutSettings::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl TermConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = [Self::default_path(), PathBuf::from("/etc/acm-term/term.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: TermConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("acm-term").join("term.toml")
        } else {
            PathBuf::from(".config/acm-term/term.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.term.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.term.log_level,
                valid_levels.join(", ")
            ));
        }

        self.selector()?;

        self.line_coding()
            .validate()
            .context("Invalid [line] settings")?;

        self.worker_settings()
            .validate()
            .context("Invalid [worker] settings")?;
        if self.worker.poll_interval_ms == 0 {
            return Err(anyhow!("Invalid poll_interval_ms 0"));
        }

        Ok(())
    }

    pub fn selector(&self) -> Result<DeviceSelector> {
        self.device
            .selector
            .parse()
            .with_context(|| format!("Invalid [device] selector '{}'", self.device.selector))
    }

    pub fn line_coding(&self) -> LineCoding {
        LineCoding {
            baud_rate: self.line.baud_rate,
            stop_bits: self.line.stop_bits,
            parity: self.line.parity,
            data_bits: self.line.data_bits,
        }
    }

    pub fn line_state(&self) -> LineState {
        LineState {
            rts: self.line.rts,
            dtr: self.line.dtr,
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            read_timeout: self.timeouts.read_ms.map(Duration::from_millis),
            write_timeout: self.timeouts.write_ms.map(Duration::from_millis),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            poll_read_timeout: Duration::from_millis(self.worker.poll_read_timeout_ms),
            read_chunk_size: self.worker.read_chunk_size,
            max_pass_bytes: self.worker.max_pass_bytes,
            queue_capacity: self.worker.queue_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TermConfig::default();
        assert_eq!(config.term.log_level, "info");
        assert_eq!(config.device.selector, "first");
        assert_eq!(config.line_coding(), LineCoding::default());
        assert_eq!(config.line_state().value(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_worker_settings_round_trip() {
        let config = TermConfig::default();
        assert_eq!(config.worker_settings(), WorkerSettings::default());
        assert_eq!(config.transport_settings(), TransportSettings::default());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = TermConfig::default();
        config.line.parity = Parity::Even;
        config.line.stop_bits = StopBits::OnePointFive;
        config.timeouts.write_ms = Some(250);

        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("parity = \"E\""));
        assert!(toml_str.contains("stop_bits = \"1.5\""));

        let parsed: TermConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let parsed: TermConfig = toml::from_str("[term]\nlog_level = \"debug\"\n").unwrap();
        assert_eq!(parsed.term.log_level, "debug");
        assert_eq!(parsed.line, LineSettings::default());
        assert_eq!(parsed.worker, WorkerConfig::default());
    }

    #[test]
    fn test_term_section_is_optional() {
        let parsed: TermConfig =
            toml::from_str("[line]\nbaud_rate = 115200\nparity = \"E\"\n").unwrap();
        assert_eq!(parsed.term, TermSettings::default());
        assert_eq!(parsed.line.baud_rate, 115_200);
        assert_eq!(parsed.line.parity, Parity::Even);
        assert!(parsed.validate().is_ok());

        let empty: TermConfig = toml::from_str("").unwrap();
        assert_eq!(empty, TermConfig::default());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = TermConfig::default();
        config.term.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.term.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_selector() {
        let mut config = TermConfig::default();

        config.device.selector = "0x2341:*".to_string();
        assert!(config.validate().is_ok());

        config.device.selector = "1.4".to_string();
        assert!(config.validate().is_ok());

        config.device.selector = "2341:0043".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_line_and_worker() {
        let mut config = TermConfig::default();
        config.line.data_bits = 9;
        assert!(config.validate().is_err());

        let mut config = TermConfig::default();
        config.line.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = TermConfig::default();
        config.worker.queue_capacity = 1;
        assert!(config.validate().is_err());

        let mut config = TermConfig::default();
        config.worker.read_chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = TermConfig::default();
        config.worker.max_pass_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = TermConfig::default();
        config.worker.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("term.toml");

        let mut config = TermConfig::default();
        config.line.baud_rate = 115_200;
        config.device.selector = "0x0483:0x5740".to_string();
        config.save(&path).unwrap();

        let loaded = TermConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term.toml");
        fs::write(&path, "[term]\nlog_level = \"loud\"\n").unwrap();

        assert!(TermConfig::load(Some(path)).is_err());
    }
}
