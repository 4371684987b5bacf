// Modem Manager Core - Configuration
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Core options and per-device settings, persisted as local JSON files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::storage::write_private;

/// Directory name used below the XDG base directories.
pub const APP_DIR: &str = "modem-manager-gui";

/// Default location of backend module files.
pub const DEFAULT_MODULES_DIR: &str = "/usr/lib/modem-manager-gui/modules";

/// What to do once a limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitAction {
    #[default]
    Notify,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficUnits {
    #[default]
    Mb,
    Gb,
    Tb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnits {
    #[default]
    Minutes,
    Hours,
}

/// Limit on the bytes transferred during one connection session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficLimit {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_traffic_amount")]
    pub amount: u64,
    #[serde(default)]
    pub units: TrafficUnits,
    #[serde(default = "default_traffic_message")]
    pub message: String,
    #[serde(default)]
    pub action: LimitAction,
}

impl TrafficLimit {
    /// Threshold in bytes.
    pub fn threshold_bytes(&self) -> u64 {
        let unit: u64 = match self.units {
            TrafficUnits::Mb => 1024 * 1024,
            TrafficUnits::Gb => 1024 * 1024 * 1024,
            TrafficUnits::Tb => 1024 * 1024 * 1024 * 1024,
        };
        self.amount.saturating_mul(unit)
    }
}

impl Default for TrafficLimit {
    fn default() -> Self {
        Self {
            enabled: false,
            amount: default_traffic_amount(),
            units: TrafficUnits::default(),
            message: default_traffic_message(),
            action: LimitAction::default(),
        }
    }
}

/// Limit on the duration of one connection session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeLimit {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_time_amount")]
    pub amount: u64,
    #[serde(default)]
    pub units: TimeUnits,
    #[serde(default = "default_time_message")]
    pub message: String,
    #[serde(default)]
    pub action: LimitAction,
}

impl TimeLimit {
    /// Threshold in seconds.
    pub fn threshold_seconds(&self) -> u64 {
        match self.units {
            TimeUnits::Minutes => self.amount.saturating_mul(60),
            TimeUnits::Hours => self.amount.saturating_mul(3600),
        }
    }
}

impl Default for TimeLimit {
    fn default() -> Self {
        Self {
            enabled: false,
            amount: default_time_amount(),
            units: TimeUnits::default(),
            message: default_time_message(),
            action: LimitAction::default(),
        }
    }
}

/// Options consumed by the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreOptions {
    /// Preferred device module short name.
    #[serde(default)]
    pub device_module: Option<String>,
    /// Preferred connection module short name.
    #[serde(default)]
    pub connection_module: Option<String>,
    /// Start missing services the selected modules depend on.
    #[serde(default = "default_true")]
    pub enable_services: bool,
    /// Also enable started services for autostart.
    #[serde(default)]
    pub enable_services_autostart: bool,
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,
    /// Operation timeouts in seconds, passed to the device backend.
    #[serde(default = "default_enable_timeout")]
    pub enable_timeout: u32,
    #[serde(default = "default_send_sms_timeout")]
    pub send_sms_timeout: u32,
    #[serde(default = "default_send_ussd_timeout")]
    pub send_ussd_timeout: u32,
    #[serde(default = "default_scan_timeout")]
    pub scan_networks_timeout: u32,
    #[serde(default)]
    pub traffic_limit: TrafficLimit,
    #[serde(default)]
    pub time_limit: TimeLimit,
}

fn default_true() -> bool { true }
fn default_modules_dir() -> PathBuf { PathBuf::from(DEFAULT_MODULES_DIR) }
fn default_enable_timeout() -> u32 { 20 }
fn default_send_sms_timeout() -> u32 { 35 }
fn default_send_ussd_timeout() -> u32 { 25 }
fn default_scan_timeout() -> u32 { 60 }
fn default_traffic_amount() -> u64 { 150 }
fn default_traffic_message() -> String { "Traffic limit exceeded".to_string() }
fn default_time_amount() -> u64 { 60 }
fn default_time_message() -> String { "Time limit exceeded".to_string() }

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            device_module: None,
            connection_module: None,
            enable_services: true,
            enable_services_autostart: false,
            modules_dir: default_modules_dir(),
            enable_timeout: default_enable_timeout(),
            send_sms_timeout: default_send_sms_timeout(),
            send_ussd_timeout: default_send_ussd_timeout(),
            scan_networks_timeout: default_scan_timeout(),
            traffic_limit: TrafficLimit::default(),
            time_limit: TimeLimit::default(),
        }
    }
}

impl CoreOptions {
    /// Default options file below the user's config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("core.json")
    }

    /// Load options from the default path.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Load options from `path`, falling back to defaults on any error.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(options) => options,
                Err(e) => {
                    warn!("Failed to parse core options: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read core options: {}", e);
                Self::default()
            }
        }
    }

    /// Save options to `path`.
    pub fn save_to(&self, path: &Path) {
        match serde_json::to_string_pretty(self) {
            Ok(content) => {
                if let Err(e) = write_private(path, &content) {
                    warn!("Failed to save core options: {}", e);
                }
            }
            Err(e) => {
                warn!("Failed to serialize core options: {}", e);
            }
        }
    }
}

/// Key/value settings stored per device identifier.
#[derive(Debug)]
pub struct DeviceSettings {
    values: HashMap<String, Value>,
    path: PathBuf,
}

impl DeviceSettings {
    /// Default directory holding one settings file per device.
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("devices")
    }

    /// Open the settings of `device_id` inside `dir`.
    pub fn open(dir: &Path, device_id: &str) -> Self {
        let file_name: String = device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{}.json", file_name));

        let values = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Failed to parse device settings {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Self { values, path }
    }

    fn save(&self) {
        match serde_json::to_string_pretty(&self.values) {
            Ok(content) => {
                if let Err(e) = write_private(&self.path, &content) {
                    warn!("Failed to save device settings: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize device settings: {}", e),
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(Value::as_str).map(str::to_string)
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), Value::from(value));
        self.save();
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_string(), Value::from(value));
        self.save();
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values.get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.values.insert(key.to_string(), Value::from(value));
        self.save();
    }

    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        self.values.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn set_double(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), Value::from(value));
        self.save();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_options_use_defaults() {
        let options: CoreOptions =
            serde_json::from_str(r#"{"device_module":"mm07","traffic_limit":{"enabled":true}}"#)
                .unwrap();
        assert_eq!(options.device_module.as_deref(), Some("mm07"));
        assert!(options.enable_services);
        assert_eq!(options.send_sms_timeout, 35);
        assert!(options.traffic_limit.enabled);
        assert_eq!(options.traffic_limit.amount, 150);
    }

    #[test]
    fn test_limit_thresholds() {
        let mut traffic = TrafficLimit { amount: 2, ..TrafficLimit::default() };
        assert_eq!(traffic.threshold_bytes(), 2 * 1024 * 1024);
        traffic.units = TrafficUnits::Gb;
        assert_eq!(traffic.threshold_bytes(), 2 * 1024 * 1024 * 1024);

        let mut time = TimeLimit { amount: 3, ..TimeLimit::default() };
        assert_eq!(time.threshold_seconds(), 180);
        time.units = TimeUnits::Hours;
        assert_eq!(time.threshold_seconds(), 10800);
    }

    #[test]
    fn test_options_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("core.json");
        let options = CoreOptions {
            connection_module: Some("nm09".to_string()),
            ..CoreOptions::default()
        };
        options.save_to(&path);
        assert_eq!(CoreOptions::load_from(&path), options);
    }

    #[test]
    fn test_corrupt_options_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(CoreOptions::load_from(&path), CoreOptions::default());
    }

    #[test]
    fn test_device_settings_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut settings = DeviceSettings::open(dir.path(), "/org/modem/0");
            settings.set_string("ussd_encoding", "ucs2");
            settings.set_bool("sms_autosend", true);
            settings.set_int("signal_floor", -90);
            settings.set_double("ratio", 0.5);
        }
        let settings = DeviceSettings::open(dir.path(), "/org/modem/0");
        assert_eq!(settings.get_string("ussd_encoding").as_deref(), Some("ucs2"));
        assert!(settings.get_bool("sms_autosend", false));
        assert_eq!(settings.get_int("signal_floor", 0), -90);
        assert_eq!(settings.get_double("ratio", 0.0), 0.5);
        assert_eq!(settings.get_int("missing", 7), 7);
        assert!(dir.path().join("_org_modem_0.json").exists());
    }
}
