// Modem Manager Core - Storage
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Per-device message and traffic stores.
//!
//! The core opens both stores when a device is opened and drops them when it
//! is closed. The JSON implementation keeps one directory per device below the
//! user's data directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::APP_DIR;
use crate::engine::{SmsMessage, TrafficSample};

/// Write `content` to `path` with owner-only permissions, creating parents.
pub(crate) fn write_private(path: &Path, content: &str) -> io::Result<()> {
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    #[cfg(unix)]
    {
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            warn!("Failed to set file permissions: {}", e);
        }
    }
    file.write_all(content.as_bytes())
}

/// Message history of one device.
pub trait MessageStore: Send {
    /// Store a message and return the identifier it was saved under.
    fn add_message(&mut self, message: &SmsMessage) -> Option<u64>;
    fn messages(&mut self) -> Vec<SmsMessage>;
    fn remove_message(&mut self, db_id: u64) -> bool;
}

/// Traffic accounting of one device.
pub trait TrafficStore: Send {
    fn open_session(&mut self, started_at: i64);
    fn add_sample(&mut self, sample: &TrafficSample);
    fn close_session(&mut self);
    fn day_totals(&mut self, day: NaiveDate) -> Option<DayTraffic>;
}

/// Opens the stores of a device.
pub trait StoreProvider: Send + Sync {
    fn open_message_store(&self, persistent_id: &str, internal_id: &str) -> Option<Box<dyn MessageStore>>;
    fn open_traffic_store(&self, persistent_id: &str, internal_id: &str) -> Option<Box<dyn TrafficStore>>;
}

/// Traffic accumulated over one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DayTraffic {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Connected time in seconds.
    pub duration: u64,
    pub sessions: u32,
}

/// Store provider writing JSON files below a root directory.
#[derive(Debug, Clone)]
pub struct JsonStoreProvider {
    root: PathBuf,
}

impl Default for JsonStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonStoreProvider {
    pub fn new() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("devices");
        Self { root }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn device_dir(&self, persistent_id: &str, internal_id: &str) -> PathBuf {
        let key = format!("{}_{}", persistent_id, internal_id);
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(name)
    }
}

impl StoreProvider for JsonStoreProvider {
    fn open_message_store(&self, persistent_id: &str, internal_id: &str) -> Option<Box<dyn MessageStore>> {
        let path = self.device_dir(persistent_id, internal_id).join("messages.json");
        Some(Box::new(JsonMessageStore::new(path)))
    }

    fn open_traffic_store(&self, persistent_id: &str, internal_id: &str) -> Option<Box<dyn TrafficStore>> {
        let path = self.device_dir(persistent_id, internal_id).join("traffic.json");
        Some(Box::new(JsonTrafficStore::new(path)))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MessageFile {
    next_id: u64,
    messages: Vec<SmsMessage>,
}

/// Message store backed by a JSON file.
#[derive(Debug)]
pub struct JsonMessageStore {
    data: MessageFile,
    path: PathBuf,
    loaded: bool,
    dirty: bool,
}

impl JsonMessageStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            data: MessageFile::default(),
            path,
            loaded: false,
            dirty: false,
        }
    }

    fn ensure_loaded(&mut self) {
        if !self.loaded {
            if let Ok(content) = fs::read_to_string(&self.path) {
                match serde_json::from_str(&content) {
                    Ok(data) => self.data = data,
                    Err(e) => warn!("Failed to parse message store: {}", e),
                }
            }
            self.loaded = true;
            self.dirty = false;
        }
    }

    fn save(&mut self) {
        if !self.dirty {
            return;
        }
        match serde_json::to_string_pretty(&self.data) {
            Ok(content) => match write_private(&self.path, &content) {
                Ok(()) => self.dirty = false,
                Err(e) => warn!("Failed to save message store: {}", e),
            },
            Err(e) => warn!("Failed to serialize message store: {}", e),
        }
    }
}

impl MessageStore for JsonMessageStore {
    fn add_message(&mut self, message: &SmsMessage) -> Option<u64> {
        self.ensure_loaded();
        self.data.next_id += 1;
        let id = self.data.next_id;
        let mut stored = message.clone();
        stored.db_id = id;
        self.data.messages.push(stored);
        self.dirty = true;
        self.save();
        Some(id)
    }

    fn messages(&mut self) -> Vec<SmsMessage> {
        self.ensure_loaded();
        self.data.messages.clone()
    }

    fn remove_message(&mut self, db_id: u64) -> bool {
        self.ensure_loaded();
        let before = self.data.messages.len();
        self.data.messages.retain(|m| m.db_id != db_id);
        if self.data.messages.len() != before {
            self.dirty = true;
            self.save();
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrafficFile {
    #[serde(default)]
    days: BTreeMap<NaiveDate, DayTraffic>,
    #[serde(default)]
    session_start: Option<i64>,
}

/// Traffic store backed by a JSON file with per-day totals.
///
/// Samples only mark the store dirty; the file is written when the session
/// closes or the store is dropped.
#[derive(Debug)]
pub struct JsonTrafficStore {
    data: TrafficFile,
    path: PathBuf,
    loaded: bool,
    dirty: bool,
}

impl JsonTrafficStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            data: TrafficFile::default(),
            path,
            loaded: false,
            dirty: false,
        }
    }

    fn ensure_loaded(&mut self) {
        if !self.loaded {
            if let Ok(content) = fs::read_to_string(&self.path) {
                match serde_json::from_str(&content) {
                    Ok(data) => self.data = data,
                    Err(e) => warn!("Failed to parse traffic store: {}", e),
                }
            }
            self.loaded = true;
            self.dirty = false;
        }
    }

    fn save(&mut self) {
        if !self.dirty {
            return;
        }
        match serde_json::to_string_pretty(&self.data) {
            Ok(content) => match write_private(&self.path, &content) {
                Ok(()) => self.dirty = false,
                Err(e) => warn!("Failed to save traffic store: {}", e),
            },
            Err(e) => warn!("Failed to serialize traffic store: {}", e),
        }
    }

    /// Local calendar day of a Unix time.
    fn day_of(timestamp: i64) -> NaiveDate {
        Local
            .timestamp_opt(timestamp, 0)
            .single()
            .map(|t| t.date_naive())
            .unwrap_or_else(|| Local::now().date_naive())
    }
}

impl TrafficStore for JsonTrafficStore {
    fn open_session(&mut self, started_at: i64) {
        self.ensure_loaded();
        self.data.days.entry(Self::day_of(started_at)).or_default().sessions += 1;
        self.data.session_start = Some(started_at);
        self.dirty = true;
        debug!("Traffic session opened at {}", started_at);
    }

    fn add_sample(&mut self, sample: &TrafficSample) {
        self.ensure_loaded();
        let totals = self.data.days.entry(Self::day_of(sample.timestamp)).or_default();
        totals.rx_bytes += sample.delta_rx;
        totals.tx_bytes += sample.delta_tx;
        totals.duration += sample.delta_duration;
        self.dirty = true;
    }

    fn close_session(&mut self) {
        self.ensure_loaded();
        if self.data.session_start.take().is_some() {
            self.dirty = true;
        }
        self.save();
    }

    fn day_totals(&mut self, day: NaiveDate) -> Option<DayTraffic> {
        self.ensure_loaded();
        self.data.days.get(&day).copied()
    }
}

impl Drop for JsonTrafficStore {
    fn drop(&mut self) {
        self.save();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(number: &str, text: &str) -> SmsMessage {
        SmsMessage {
            number: number.to_string(),
            text: text.to_string(),
            idents: vec![1],
            timestamp: 1_700_000_000,
            ..SmsMessage::default()
        }
    }

    #[test]
    fn test_message_store_persists_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = JsonStoreProvider::with_root(dir.path());

        let mut store = provider.open_message_store("modem-1", "/dev/ttyUSB0").unwrap();
        let first = store.add_message(&message("+100", "hello")).unwrap();
        let second = store.add_message(&message("+200", "world")).unwrap();
        assert_ne!(first, second);
        drop(store);

        let mut store = provider.open_message_store("modem-1", "/dev/ttyUSB0").unwrap();
        let messages = store.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].db_id, first);

        assert!(store.remove_message(first));
        assert!(!store.remove_message(first));
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn test_traffic_store_accumulates_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.json");
        {
            let mut store = JsonTrafficStore::new(path.clone());
            store.open_session(Local::now().timestamp());
            let sample = TrafficSample {
                delta_rx: 100,
                delta_tx: 40,
                delta_duration: 2,
                timestamp: Local::now().timestamp(),
                ..TrafficSample::default()
            };
            store.add_sample(&sample);
            store.add_sample(&sample);
            store.close_session();
        }

        let mut store = JsonTrafficStore::new(path);
        let totals = store.day_totals(Local::now().date_naive()).unwrap();
        assert_eq!(totals.rx_bytes, 200);
        assert_eq!(totals.tx_bytes, 80);
        assert_eq!(totals.duration, 4);
        assert_eq!(totals.sessions, 1);
    }

    #[test]
    fn test_late_sample_credits_its_own_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonTrafficStore::new(dir.path().join("traffic.json"));
        let evening = Local.with_ymd_and_hms(2026, 3, 14, 23, 59, 58).unwrap();
        store.open_session(evening.timestamp() - 60);
        store.add_sample(&TrafficSample {
            delta_rx: 500,
            delta_tx: 20,
            delta_duration: 2,
            timestamp: evening.timestamp(),
            ..TrafficSample::default()
        });

        let totals = store.day_totals(evening.date_naive()).unwrap();
        assert_eq!(totals.rx_bytes, 500);
        assert_eq!(totals.sessions, 1);
        assert!(store.day_totals(Local::now().date_naive()).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_written_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b.json");
        write_private(&path, "{}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
