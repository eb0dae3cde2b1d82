//! Configuration loading and persistence.
//!
//! Reads the adapter's TOML configuration file, applies `EBUS_ADAPTER_*`
//! environment variable overrides, and validates the fields the protocol
//! engine depends on (chiefly that `own_address` is a valid master).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    AVAILABLE_THRESHOLD, DEFAULT_BAUD_RATE, DEFAULT_MAX_CLIENTS, WATCHDOG_INTERVAL,
};
use crate::ebus::telegram::is_master;

/// Configuration for the eBUS adapter.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Path to the serial device (e.g. `/dev/ttyUSB0`).
    pub serial_port: PathBuf,
    /// Serial baud rate. eBUS hardware is fixed at 2400; overriding this
    /// only makes sense against a USB-serial test harness.
    pub baud_rate: u32,
    /// This adapter's own master address on the bus.
    pub own_address: u8,
    /// TCP port for the raw read/write port.
    pub raw_port: u16,
    /// TCP port for the raw read-only port.
    pub raw_ro_port: u16,
    /// TCP port for the enhanced (tagged, arbitration-capable) protocol.
    pub enhanced_port: u16,
    /// TCP port for the plain-text status port.
    pub status_port: u16,
    /// Maximum concurrently connected clients per listener.
    pub max_clients: usize,
    /// Seconds of bus silence before the watchdog is considered tripped.
    pub watchdog_secs: u64,
    /// Minimum available client send-buffer capacity before the fan-out
    /// queue will deliver an event to that client.
    pub available_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: DEFAULT_BAUD_RATE,
            own_address: 0x31,
            raw_port: 3333,
            raw_ro_port: 3334,
            enhanced_port: 3335,
            status_port: 5555,
            max_clients: DEFAULT_MAX_CLIENTS,
            watchdog_secs: WATCHDOG_INTERVAL.as_secs(),
            available_threshold: AVAILABLE_THRESHOLD,
        }
    }
}

impl Config {
    /// Returns the configuration directory, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `EBUS_ADAPTER_CONFIG_DIR` env var: explicit override
    /// 2. `EBUS_ADAPTER_ENV=test`: repo-local `tmp/ebus-adapter-test`
    /// 3. Default: platform config dir (`~/.config/ebus-adapter` on Linux)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("EBUS_ADAPTER_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::Environment::current().is_test() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/ebus-adapter-test")
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join("ebus-adapter")
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from `config.toml` in the config directory,
    /// falling back to defaults if absent, then applies environment
    /// variable overrides and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing config file cannot be parsed, or if
    /// `own_address` is not a valid master address after overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file(&Self::default_path()?).unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from an explicit path, applying the same
    /// environment overrides and validation as [`Config::load`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read/parsed or the result
    /// fails validation.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(serial_port) = std::env::var("EBUS_ADAPTER_SERIAL_PORT") {
            self.serial_port = PathBuf::from(serial_port);
        }
        if let Ok(baud_rate) = std::env::var("EBUS_ADAPTER_BAUD_RATE") {
            if let Ok(baud) = baud_rate.parse() {
                self.baud_rate = baud;
            }
        }
        if let Ok(own_address) = std::env::var("EBUS_ADAPTER_OWN_ADDRESS") {
            if let Ok(addr) = parse_hex_u8(&own_address) {
                self.own_address = addr;
            }
        }
        if let Ok(raw_port) = std::env::var("EBUS_ADAPTER_RAW_PORT") {
            if let Ok(port) = raw_port.parse() {
                self.raw_port = port;
            }
        }
        if let Ok(raw_ro_port) = std::env::var("EBUS_ADAPTER_RAW_RO_PORT") {
            if let Ok(port) = raw_ro_port.parse() {
                self.raw_ro_port = port;
            }
        }
        if let Ok(enhanced_port) = std::env::var("EBUS_ADAPTER_ENHANCED_PORT") {
            if let Ok(port) = enhanced_port.parse() {
                self.enhanced_port = port;
            }
        }
        if let Ok(status_port) = std::env::var("EBUS_ADAPTER_STATUS_PORT") {
            if let Ok(port) = status_port.parse() {
                self.status_port = port;
            }
        }
        if let Ok(max_clients) = std::env::var("EBUS_ADAPTER_MAX_CLIENTS") {
            if let Ok(max) = max_clients.parse() {
                self.max_clients = max;
            }
        }
        if let Ok(watchdog_secs) = std::env::var("EBUS_ADAPTER_WATCHDOG_SECS") {
            if let Ok(secs) = watchdog_secs.parse() {
                self.watchdog_secs = secs;
            }
        }
    }

    /// Rejects a configuration whose `own_address` is not one of the 25
    /// valid master addresses.
    ///
    /// # Errors
    ///
    /// Returns an error describing the invalid address.
    pub fn validate(&self) -> Result<()> {
        if !is_master(self.own_address) {
            bail!(
                "own_address {:#04x} is not a valid master address (both nibbles must be one of 0,1,3,7,F)",
                self.own_address
            );
        }
        Ok(())
    }

    /// Persists the current configuration to `config.toml` in the config
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()?;
        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn parse_hex_u8(s: &str) -> Result<u8, std::num::ParseIntError> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(trimmed, 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_valid_own_address() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.raw_port, 3333);
        assert_eq!(config.enhanced_port, 3335);
    }

    #[test]
    fn validate_rejects_non_master_address() {
        let mut config = Config::default();
        config.own_address = 0x04;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_hex_u8_accepts_0x_prefix() {
        assert_eq!(parse_hex_u8("0x31").unwrap(), 0x31);
        assert_eq!(parse_hex_u8("31").unwrap(), 0x31);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.own_address, config.own_address);
        assert_eq!(deserialized.raw_port, config.raw_port);
    }
}
