use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default HTTP port for the control API
pub const DEFAULT_PORT: u16 = 8000;

/// Default config file location: ~/.netshaper/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".netshaper")
        .join("config.yaml")
}

/// Errors for settings file I/O and parsing
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Complete service settings
///
/// Every field has a default so an empty (or missing) file is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the HTTP API binds to
    pub bind_addr: String,
    /// Port the HTTP API binds to
    pub port: u16,
    /// JSON file holding clusters and devices
    pub state_file: PathBuf,
    /// JSON file holding persisted bandwidth rules
    pub rules_file: PathBuf,
    /// Container runtime binary
    pub docker_bin: String,
    /// Name of the shaping endpoint container
    pub router_container: String,
    /// Image used for device containers
    pub client_image: String,
    /// Naming and addressing of device resources
    pub naming: NamingConfig,
    /// Timeout applied to every external command (seconds)
    pub command_timeout_secs: u64,
    /// Sampler tick interval (milliseconds)
    pub sample_interval_ms: u64,
    /// Per-interface sampling deadline (milliseconds)
    pub sample_timeout_ms: u64,
    /// Maximum concurrent create/destroy operations in one sync pass
    pub max_parallel_ops: usize,
    /// First iperf3 port; the shaping endpoint runs the server for a device on
    /// `iperf_base_port + slot`
    pub iperf_base_port: u16,
    /// Supporting containers reported by the liveness panel
    pub status_containers: Vec<String>,
    /// Replay persisted rules at startup
    pub restore_on_start: bool,
}

/// Naming and addressing scheme for device slots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Prefix for every managed container and network
    pub prefix: String,
    /// First two octets of every device subnet, e.g. "10.10"
    pub subnet_base: String,
    /// Lowest usable slot (inclusive)
    pub slot_min: u16,
    /// Highest usable slot (inclusive)
    pub slot_max: u16,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: "qc".to_string(),
            subnet_base: "10.10".to_string(),
            slot_min: 1,
            slot_max: 254,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            state_file: PathBuf::from("netshaper-state.json"),
            rules_file: PathBuf::from("netshaper-rules.json"),
            docker_bin: "docker".to_string(),
            router_container: "router".to_string(),
            client_image: "qc-client:latest".to_string(),
            naming: NamingConfig::default(),
            command_timeout_secs: 30,
            sample_interval_ms: 1000,
            sample_timeout_ms: 800,
            max_parallel_ops: 5,
            iperf_base_port: 5200,
            status_containers: vec!["frontend".to_string(), "influxdb".to_string()],
            restore_on_start: true,
        }
    }
}

impl Settings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    /// Reject settings that would make allocation or sampling meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        let naming = &self.naming;
        if naming.slot_min == 0 || naming.slot_max > 254 || naming.slot_min > naming.slot_max {
            return Err(ConfigError::Invalid(format!(
                "slot range {}..={} must lie within 1..=254",
                naming.slot_min, naming.slot_max
            )));
        }

        let octets: Vec<&str> = naming.subnet_base.split('.').collect();
        if octets.len() != 2 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
            return Err(ConfigError::Invalid(format!(
                "subnet_base '{}' must be two octets, e.g. 10.10",
                naming.subnet_base
            )));
        }

        if naming.prefix.is_empty() {
            return Err(ConfigError::Invalid("naming prefix must not be empty".to_string()));
        }

        if self.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sample_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.max_parallel_ops == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_ops must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// SBIO: Pure parsing (no I/O)
// ============================================================================

/// Parse settings from a YAML string
pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    let settings: Settings =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load settings from disk, falling back to defaults when the file is absent.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_load_settings_file() {
        let content = r#"
port: 9100
router_container: shaper
naming:
  prefix: lab
  slot_max: 16
"#;
        let file = create_temp_file(content);
        let settings = load_settings(file.path()).unwrap();

        assert_eq!(settings.port, 9100);
        assert_eq!(settings.router_container, "shaper");
        assert_eq!(settings.naming.prefix, "lab");
        assert_eq!(settings.naming.slot_max, 16);
        // Untouched fields keep their defaults
        assert_eq!(settings.naming.slot_min, 1);
        assert_eq!(settings.command_timeout_secs, 30);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let settings = load_settings(Path::new("/nonexistent/netshaper.yaml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let settings = parse_settings("   \n").unwrap();
        assert_eq!(settings.port, DEFAULT_PORT);
    }

    #[test]
    fn test_invalid_slot_range() {
        let result = parse_settings("naming:\n  slot_min: 10\n  slot_max: 5\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_subnet_base() {
        let result = parse_settings("naming:\n  subnet_base: \"10.300\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = parse_settings("port: [not a port");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
