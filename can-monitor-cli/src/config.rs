//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use can_monitor_core::MonitorConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from a TOML file)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    pub dbc: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel")]
    pub name: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

fn default_channel() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    250_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: default_channel(),
            bitrate: default_bitrate(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SelectionConfig {
    /// Identifiers to watch, as numbers or `"0x…"` strings
    #[serde(default)]
    pub ids: Vec<CanIdSpec>,
    /// Watch every message of the database
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CanIdSpec {
    Number(u32),
    Text(String),
}

impl CanIdSpec {
    pub fn resolve(&self) -> Result<u32> {
        match self {
            CanIdSpec::Number(id) => Ok(*id),
            CanIdSpec::Text(text) => parse_can_id(text),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    #[serde(default = "default_refresh")]
    pub refresh_ms: u64,
}

fn default_refresh() -> u64 {
    100
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_ms: default_refresh(),
        }
    }
}

impl AppConfig {
    /// All configured identifiers, resolved
    pub fn selected_ids(&self) -> Result<Vec<u32>> {
        self.selection.ids.iter().map(CanIdSpec::resolve).collect()
    }
}

/// Parse a CAN identifier given as `0x1A0`, `1A0h` or decimal `416`
pub fn parse_can_id(text: &str) -> Result<u32> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = text.strip_suffix('h').or_else(|| text.strip_suffix('H')) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse::<u32>()
    };

    let id = parsed.with_context(|| format!("Invalid CAN identifier: {:?}", text))?;
    if id > 0x1FFF_FFFF {
        bail!("CAN identifier {:?} does not fit in 29 bits", text);
    }
    Ok(id)
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .monitor
        .validate()
        .with_context(|| format!("Invalid [monitor] section in {:?}", path))?;
    config
        .selected_ids()
        .with_context(|| format!("Invalid [selection] ids in {:?}", path))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [input]
            dbc = "powertrain.dbc"

            [channel]
            name = "vcan0"
            bitrate = 500000

            [selection]
            ids = ["0x100", 512, "7E8h"]

            [monitor]
            queue_depth = 64
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.input.dbc, Some(PathBuf::from("powertrain.dbc")));
        assert_eq!(config.channel.name, "vcan0");
        assert_eq!(config.channel.bitrate, 500_000);
        assert_eq!(config.selected_ids().unwrap(), vec![0x100, 0x200, 0x7E8]);
        assert_eq!(config.monitor.queue_depth, 64);
        assert_eq!(config.monitor.close_timeout_ms, 2000);
        assert_eq!(config.display.refresh_ms, 100);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.channel.name, "can0");
        assert_eq!(config.channel.bitrate, 250_000);
        assert_eq!(config.monitor, MonitorConfig::default());
        assert!(!config.selection.all);
    }

    #[test]
    fn test_parse_can_id() {
        assert_eq!(parse_can_id("0x100").unwrap(), 0x100);
        assert_eq!(parse_can_id("0X7ff").unwrap(), 0x7FF);
        assert_eq!(parse_can_id("18FEF100h").unwrap(), 0x18FEF100);
        assert_eq!(parse_can_id("256").unwrap(), 256);
        assert!(parse_can_id("0xZZ").is_err());
        assert!(parse_can_id("0x20000000").is_err());
    }

    #[test]
    fn test_load_config_rejects_bad_monitor_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]\nqueue_depth = 0").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
