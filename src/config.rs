use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Root configuration of the bridge, read from a TOML file.
///
/// Every section falls back to its defaults when missing, so an empty file
/// (or no file at all) yields a working setup for the reference hardware.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub serial: SerialSettings,
    pub modbus: ModbusSettings,
    pub files: FileSettings,
    pub polling: PollingSettings,
    pub upgrade: UpgradeSettings,
    pub reset: ResetLineConfig,
    pub transfer: TransferSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA0".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModbusSettings {
    /// Socket address the Modbus/TCP server binds to.
    pub listen: String,
    pub unit_id: u8,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:502".to_string(),
            unit_id: 1,
        }
    }
}

/// Bridge files. Relative paths are taken from `config_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileSettings {
    /// Directory holding `dst<cpuid>.conf`, `dstcommon.conf` and the upgrade files.
    pub config_dir: PathBuf,
    pub upgrade_request: PathBuf,
    pub default_image: PathBuf,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("."),
            upgrade_request: PathBuf::from("upgrade.conf"),
            default_image: PathBuf::from("default_image.bin"),
        }
    }
}

impl FileSettings {
    pub fn upgrade_request_path(&self) -> PathBuf {
        self.config_dir.join(&self.upgrade_request)
    }

    pub fn default_image_path(&self) -> PathBuf {
        self.config_dir.join(&self.default_image)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingSettings {
    pub response_timeout_ms: u64,
    pub wait_step_ms: u64,
    /// Pause after every register map entry.
    pub pacing_ms: u64,
    pub identity_attempts: u32,
    pub identity_timeout_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            response_timeout_ms: 2000,
            wait_step_ms: 500,
            pacing_ms: 1000,
            identity_attempts: 3,
            identity_timeout_ms: 2000,
        }
    }
}

impl PollingSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn wait_step(&self) -> Duration {
        Duration::from_millis(self.wait_step_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }
}

/// Timings of the bootloader handshake, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpgradeSettings {
    pub reset_hold_ms: u64,
    pub reset_settle_ms: u64,
    pub handshake_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub select_delay_ms: u64,
    pub transfer_delay_ms: u64,
    pub boot_timeout_ms: u64,
    pub boot_poll_ms: u64,
    pub version_timeout_ms: u64,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            reset_hold_ms: 1000,
            reset_settle_ms: 2000,
            handshake_interval_ms: 500,
            handshake_timeout_ms: 10_000,
            select_delay_ms: 200,
            transfer_delay_ms: 1000,
            boot_timeout_ms: 20_000,
            boot_poll_ms: 1000,
            version_timeout_ms: 5000,
        }
    }
}

/// How the sensor board reset line is wired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResetLineConfig {
    /// No reset line; upgrades rely on the board being reset by hand.
    None,
    /// Active-low sysfs GPIO pin.
    Gpio { pin: u32 },
    /// Serial DTR line.
    Dtr,
}

impl Default for ResetLineConfig {
    fn default() -> Self {
        // pin 38 on the Raspberry Pi header
        ResetLineConfig::Gpio { pin: 26 }
    }
}

/// External program pushing the firmware image over the serial link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferSettings {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            program: "sb".to_string(),
            args: vec!["--ymodem".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            file: Some(PathBuf::from("/var/log/sensorhub.log")),
        }
    }
}

impl BridgeConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid bridge configuration")
    }

    /// Load the configuration file. `None` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::from_toml(&content)
            .map(Some)
            .with_context(|| format!("Failed to load configuration {}", path.display()))
    }

    /// Path of the register map file dedicated to one board.
    pub fn device_map_path(&self, cpuid: &str) -> PathBuf {
        self.files.config_dir.join(format!("dst{cpuid}.conf"))
    }

    /// Path of the register map file shared by all boards.
    pub fn common_map_path(&self) -> PathBuf {
        self.files.config_dir.join("dstcommon.conf")
    }
}
