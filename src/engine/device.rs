// Modem Manager Core - Device Model
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Device state, capability masks and the records exchanged with backends.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Number of speed samples kept per device.
pub const SPEED_HISTORY_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceType {
    #[default]
    Gsm,
    Cdma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationStatus {
    Idle,
    Home,
    Searching,
    Denied,
    #[default]
    Unknown,
    Roaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    #[default]
    Unknown,
    Gsm,
    Gprs,
    Edge,
    Umts,
    Hsdpa,
    Hsupa,
    Hspa,
    HspaPlus,
    Cdma1x,
    Evdo,
    Lte,
}

/// Long running operation a device is busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceOperation {
    #[default]
    Idle,
    Enable,
    Unlock,
    SendSms,
    SendUssd,
    Scan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockType {
    #[default]
    None,
    Pin,
    Puk,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UssdEncoding {
    #[default]
    Gsm7,
    Ucs2,
}

impl UssdEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            UssdEncoding::Gsm7 => "gsm7",
            UssdEncoding::Ucs2 => "ucs2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "gsm7" => Some(UssdEncoding::Gsm7),
            "ucs2" => Some(UssdEncoding::Ucs2),
            _ => None,
        }
    }
}

/// Device state queried through the device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStateRequest {
    Enabled,
    Locked,
    Registered,
    Connected,
    Prepared,
}

bitmask! {
    pub struct LocationCaps: u32 {
        const CELL_ID = 1 << 1;
        const GPS = 1 << 2;
    }
}

bitmask! {
    pub struct SmsCaps: u32 {
        const RECEIVE = 1 << 1;
        const SEND = 1 << 2;
    }
}

bitmask! {
    pub struct UssdCaps: u32 {
        const SEND = 1 << 1;
    }
}

bitmask! {
    pub struct ScanCaps: u32 {
        const OBSERVE = 1 << 1;
    }
}

bitmask! {
    pub struct ContactsCaps: u32 {
        const EXPORT = 1 << 1;
        const EDIT = 1 << 2;
        const MULTIPLE = 1 << 3;
    }
}

/// Kind of capability a backend extended at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Location,
    Sms,
    Ussd,
    Scan,
    Contacts,
}

/// Received or stored SMS message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SmsMessage {
    pub number: String,
    #[serde(default)]
    pub service_number: String,
    /// Backend indexes of the parts folded into this message.
    #[serde(default)]
    pub idents: Vec<u32>,
    pub text: String,
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub folder: u32,
    /// Unix time in seconds.
    pub timestamp: i64,
    /// Identifier assigned by the message store, 0 when unsaved.
    #[serde(default)]
    pub db_id: u64,
}

impl SmsMessage {
    /// Backend index of the first part.
    pub fn first_ident(&self) -> u32 {
        self.idents.first().copied().unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Contact {
    pub id: u32,
    pub name: String,
    pub number: String,
    pub email: String,
    pub group: String,
    pub name2: String,
    pub number2: String,
    pub hidden: bool,
    pub storage: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkAvailability {
    #[default]
    Unknown,
    Available,
    Current,
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessTechnology {
    Gsm,
    GsmCompact,
    Umts,
    Edge,
    Hsdpa,
    Hsupa,
    Hspa,
    HspaPlus,
    Lte,
    #[default]
    Unknown,
}

/// Network found by an operator scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScannedNetwork {
    pub status: NetworkAvailability,
    pub access_tech: AccessTechnology,
    pub operator_code: u32,
    pub operator_long: String,
    pub operator_short: String,
}

/// Persisted connection profile managed by the connection backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionProfile {
    pub uuid: String,
    pub name: String,
    pub number: String,
    pub username: String,
    pub password: String,
    pub apn: String,
    pub network_id: u32,
    pub kind: u32,
    pub home_only: bool,
    pub dns1: Option<String>,
    pub dns2: Option<String>,
}

/// Speed measured between two statistics replies, in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpeedSample {
    pub rx: f32,
    pub tx: f32,
}

/// Bounded history of speed samples. The oldest sample is dropped first.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedHistory {
    samples: VecDeque<SpeedSample>,
}

impl Default for SpeedHistory {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(SPEED_HISTORY_LEN),
        }
    }
}

impl SpeedHistory {
    pub fn push(&mut self, sample: SpeedSample) {
        if self.samples.len() >= SPEED_HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<SpeedSample> {
        self.samples.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpeedSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Counter update written to the traffic store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficSample {
    pub full_rx: u64,
    pub full_tx: u64,
    pub full_time: u64,
    pub delta_rx: u64,
    pub delta_tx: u64,
    pub delta_duration: u64,
    /// Unix time the counters were read.
    pub timestamp: i64,
}

/// Traffic figures reported with `NetStatus` events.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrafficSnapshot {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub session_time: u64,
    pub rx_speed: f32,
    pub tx_speed: f32,
}

/// Modem as seen by the core.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Device {
    pub id: u32,
    pub enabled: bool,
    pub blocked: bool,
    pub registered: bool,
    pub prepared: bool,
    pub operation: DeviceOperation,
    pub lock_type: LockType,
    pub conn_transition: bool,

    pub manufacturer: String,
    pub model: String,
    pub version: String,
    pub port: String,
    pub internal_id: String,
    pub persistent_id: String,
    pub object_path: String,
    pub sysfs_path: String,
    pub device_type: DeviceType,
    pub imei: String,
    pub imsi: String,

    pub operator_code: u32,
    pub operator_name: String,
    pub reg_status: RegistrationStatus,
    pub mode: NetworkMode,
    pub signal_level: u32,

    pub location_caps: LocationCaps,
    pub location_3gpp: [u32; 4],
    pub location_gps: [f32; 4],
    pub sms_caps: SmsCaps,
    pub ussd_caps: UssdCaps,
    pub ussd_encoding: UssdEncoding,
    pub scan_caps: ScanCaps,
    pub contacts_caps: ContactsCaps,
    pub contacts: Vec<Contact>,

    pub connected: bool,
    pub interface: String,
    pub session_start: i64,
    pub session_time: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub speed_check_time: i64,
    pub speed: SpeedHistory,
}

impl Device {
    /// Account new interface counters.
    ///
    /// Returns the sample to persist when a previous measurement exists.
    pub fn count_traffic(&mut self, rx: u64, tx: u64, now: i64) -> Option<TrafficSample> {
        if !self.connected {
            return None;
        }

        let mut sample = None;
        if rx >= self.rx_bytes && tx >= self.tx_bytes {
            if self.speed_check_time != 0 {
                let timeframe = (now - self.speed_check_time).max(0) as u64;
                let delta_rx = rx - self.rx_bytes;
                let delta_tx = tx - self.tx_bytes;
                self.session_time += timeframe;
                if timeframe > 0 {
                    let seconds = timeframe as f32;
                    self.speed.push(SpeedSample {
                        rx: delta_rx as f32 * 8.0 / (seconds * 1024.0),
                        tx: delta_tx as f32 * 8.0 / (seconds * 1024.0),
                    });
                }
                sample = Some(TrafficSample {
                    full_rx: rx,
                    full_tx: tx,
                    full_time: self.session_time,
                    delta_rx,
                    delta_tx,
                    delta_duration: timeframe,
                    timestamp: now,
                });
            }
        }
        // Counters also move backwards when the interface is recreated.
        self.rx_bytes = rx;
        self.tx_bytes = tx;
        self.speed_check_time = now;
        sample
    }

    /// Clear counters at the start or end of a session.
    pub fn reset_traffic(&mut self, now: i64) {
        self.speed.clear();
        self.rx_bytes = 0;
        self.tx_bytes = 0;
        self.session_time = 0;
        self.speed_check_time = now;
    }

    pub fn traffic_snapshot(&self) -> TrafficSnapshot {
        let latest = self.speed.latest().unwrap_or_default();
        TrafficSnapshot {
            interface: self.interface.clone(),
            rx_bytes: self.rx_bytes,
            tx_bytes: self.tx_bytes,
            session_time: self.session_time,
            rx_speed: latest.rx,
            tx_speed: latest.tx,
        }
    }
}
