// Modem Manager Core - Backends
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Interfaces implemented by device and connection backends.
//!
//! A backend publishes the operations it implements as a bit set. The core
//! checks the set before every call and refuses to bind a backend lacking a
//! required operation.

use super::device::{Contact, ConnectionProfile, Device, DeviceOperation, DeviceStateRequest, SmsMessage, UssdEncoding};
use super::events::EventSink;
use crate::error::{CoreError, Result};

bitmask! {
    pub struct DeviceOperations: u32 {
        const OPEN = 1 << 0;
        const CLOSE = 1 << 1;
        const LAST_ERROR = 1 << 2;
        const INTERRUPT = 1 << 3;
        const SET_TIMEOUT = 1 << 4;
        const DEVICES_ENUM = 1 << 5;
        const DEVICE_OPEN = 1 << 6;
        const DEVICE_CLOSE = 1 << 7;
        const DEVICE_STATE = 1 << 8;
        const UPDATE_STATE = 1 << 9;
        const INFORMATION = 1 << 10;
        const ENABLE = 1 << 11;
        const UNLOCK = 1 << 12;
        const SMS_ENUM = 1 << 13;
        const SMS_GET = 1 << 14;
        const SMS_DELETE = 1 << 15;
        const SMS_SEND = 1 << 16;
        const USSD_CANCEL = 1 << 17;
        const USSD_STATE = 1 << 18;
        const USSD_SEND = 1 << 19;
        const NETWORKS_SCAN = 1 << 20;
        const CONTACTS_ENUM = 1 << 21;
        const CONTACTS_ADD = 1 << 22;
        const CONTACTS_DELETE = 1 << 23;
    }
}

impl DeviceOperations {
    /// Operations every device backend must implement.
    pub const REQUIRED: Self = Self::from_bits(
        Self::OPEN.bits()
            | Self::CLOSE.bits()
            | Self::LAST_ERROR.bits()
            | Self::DEVICES_ENUM.bits()
            | Self::DEVICE_OPEN.bits()
            | Self::DEVICE_CLOSE.bits()
            | Self::DEVICE_STATE.bits()
            | Self::INFORMATION.bits(),
    );
}

bitmask! {
    pub struct ConnectionOperations: u32 {
        const OPEN = 1 << 0;
        const CLOSE = 1 << 1;
        const LAST_ERROR = 1 << 2;
        const DEVICE_OPEN = 1 << 3;
        const DEVICE_CLOSE = 1 << 4;
        const STATUS = 1 << 5;
        const TIMESTAMP = 1 << 6;
        const ENUM = 1 << 7;
        const ADD = 1 << 8;
        const UPDATE = 1 << 9;
        const REMOVE = 1 << 10;
        const CONNECT = 1 << 11;
        const DISCONNECT = 1 << 12;
        const ACTIVE_UUID = 1 << 13;
    }
}

impl ConnectionOperations {
    /// Operations every connection backend must implement.
    pub const REQUIRED: Self = Self::from_bits(
        Self::OPEN.bits()
            | Self::CLOSE.bits()
            | Self::LAST_ERROR.bits()
            | Self::DEVICE_OPEN.bits()
            | Self::DEVICE_CLOSE.bits()
            | Self::STATUS.bits()
            | Self::CONNECT.bits()
            | Self::DISCONNECT.bits(),
    );
}

bitmask! {
    pub struct ConnectionCaps: u32 {
        /// Profiles can be listed and edited.
        const MANAGEMENT = 1 << 1;
        /// Connection status is tracked by the backend itself.
        const MONITORING = 1 << 2;
    }
}

/// Connection state of the open device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub interface: String,
}

/// Long running operations a device backend can be told to give up on.
pub const TIMEOUT_OPERATIONS: [DeviceOperation; 4] = [
    DeviceOperation::Enable,
    DeviceOperation::SendSms,
    DeviceOperation::SendUssd,
    DeviceOperation::Scan,
];

fn unsupported<T>(op: &'static str) -> Result<T> {
    Err(CoreError::Unsupported(op))
}

/// Device management backend.
///
/// Optional operations default to `Unsupported`.
pub trait DeviceBackend: Send {
    fn operations(&self) -> DeviceOperations;

    fn open(&mut self, events: EventSink) -> Result<()>;
    fn close(&mut self);
    fn last_error(&self) -> Option<String>;

    fn interrupt(&mut self) -> Result<()> {
        unsupported("interrupt")
    }

    /// Timeout in seconds of a long running operation.
    fn set_timeout(&mut self, _operation: DeviceOperation, _seconds: u32) -> Result<()> {
        unsupported("set_timeout")
    }

    fn devices_enum(&mut self) -> Result<Vec<Device>>;
    fn device_open(&mut self, device: &Device) -> Result<()>;
    fn device_close(&mut self) -> Result<()>;
    fn device_state(&mut self, request: DeviceStateRequest) -> Result<bool>;

    /// Poll device state. Called once per worker tick.
    fn update_state(&mut self) -> Result<()> {
        unsupported("update_state")
    }

    /// Fill identification and capability fields of `device`.
    fn information(&mut self, device: &mut Device) -> Result<()>;

    fn enable(&mut self, _enabled: bool) -> Result<()> {
        unsupported("enable")
    }

    fn unlock(&mut self, _pin: &str) -> Result<()> {
        unsupported("unlock")
    }

    fn sms_enum(&mut self) -> Result<Vec<SmsMessage>> {
        unsupported("sms_enum")
    }

    fn sms_get(&mut self, _index: u32) -> Result<SmsMessage> {
        unsupported("sms_get")
    }

    fn sms_delete(&mut self, _index: u32) -> Result<()> {
        unsupported("sms_delete")
    }

    fn sms_send(&mut self, _number: &str, _text: &str, _validity: i32, _report: bool) -> Result<()> {
        unsupported("sms_send")
    }

    fn ussd_cancel_session(&mut self) -> Result<()> {
        unsupported("ussd_cancel_session")
    }

    fn ussd_state(&mut self) -> Result<UssdSessionState> {
        unsupported("ussd_state")
    }

    fn ussd_send(&mut self, _request: &str, _kind: UssdRequestKind, _encoding: UssdEncoding) -> Result<()> {
        unsupported("ussd_send")
    }

    fn networks_scan(&mut self) -> Result<()> {
        unsupported("networks_scan")
    }

    fn contacts_enum(&mut self) -> Result<Vec<Contact>> {
        unsupported("contacts_enum")
    }

    /// Store `contact` and return the identifier given to it.
    fn contacts_add(&mut self, _contact: &Contact) -> Result<u32> {
        unsupported("contacts_add")
    }

    fn contacts_delete(&mut self, _id: u32) -> Result<()> {
        unsupported("contacts_delete")
    }
}

/// Connection management backend.
pub trait ConnectionBackend: Send {
    fn operations(&self) -> ConnectionOperations;

    fn capabilities(&self) -> ConnectionCaps {
        ConnectionCaps::EMPTY
    }

    fn open(&mut self, events: EventSink) -> Result<()>;
    fn close(&mut self);
    fn last_error(&self) -> Option<String>;

    fn device_open(&mut self, device: &Device) -> Result<()>;
    fn device_close(&mut self) -> Result<()>;
    fn status(&mut self) -> Result<ConnectionStatus>;

    /// Unix time the current connection was established.
    fn timestamp(&mut self) -> Result<i64> {
        unsupported("connection_timestamp")
    }

    fn enum_profiles(&mut self) -> Result<Vec<ConnectionProfile>> {
        unsupported("connection_enum")
    }

    /// Store a new profile and return it with its assigned uuid.
    fn add_profile(&mut self, _profile: &ConnectionProfile) -> Result<ConnectionProfile> {
        unsupported("connection_add")
    }

    fn update_profile(&mut self, _profile: &ConnectionProfile) -> Result<()> {
        unsupported("connection_update")
    }

    fn remove_profile(&mut self, _uuid: &str) -> Result<()> {
        unsupported("connection_remove")
    }

    fn connect(&mut self, profile: &ConnectionProfile) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;

    fn active_uuid(&mut self) -> Result<Option<String>> {
        unsupported("connection_active_uuid")
    }
}

/// State of the USSD session on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UssdSessionState {
    #[default]
    Unknown,
    Idle,
    Active,
    UserResponse,
}

/// What a USSD string is, given the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UssdRequestKind {
    Invalid,
    /// Starts a new session.
    Request,
    /// Answers a question of the network.
    Response,
}

/// Bound backend of either kind.
pub enum Backend {
    Device(Box<dyn DeviceBackend>),
    Connection(Box<dyn ConnectionBackend>),
}

impl Backend {
    pub fn kind_label(&self) -> &'static str {
        match self {
            Backend::Device(_) => "device",
            Backend::Connection(_) => "connection",
        }
    }

    /// Operations the backend lacks from its required set.
    pub fn missing_required(&self) -> u32 {
        match self {
            Backend::Device(b) => DeviceOperations::REQUIRED.bits() & !b.operations().bits(),
            Backend::Connection(b) => ConnectionOperations::REQUIRED.bits() & !b.operations().bits(),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Backend::{}", self.kind_label())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_required_sets() {
        assert!(DeviceOperations::REQUIRED.contains(DeviceOperations::DEVICE_OPEN));
        assert!(!DeviceOperations::REQUIRED.contains(DeviceOperations::SMS_SEND));
        assert!(ConnectionOperations::REQUIRED.contains(ConnectionOperations::CONNECT));
        assert!(!ConnectionOperations::REQUIRED.contains(ConnectionOperations::ENUM));
    }

    #[test]
    fn test_missing_required() {
        let journal = SharedJournal::default();
        let full = Backend::Device(Box::new(FakeDevice::new(journal.clone())));
        assert_eq!(full.missing_required(), 0);

        let mut partial = FakeDevice::new(journal.clone());
        partial.ops = DeviceOperations::OPEN | DeviceOperations::CLOSE;
        let partial = Backend::Device(Box::new(partial));
        assert_ne!(partial.missing_required(), 0);

        let mut conn = FakeConnection::new(journal);
        conn.ops = ConnectionOperations::REQUIRED;
        assert_eq!(Backend::Connection(Box::new(conn)).missing_required(), 0);
    }

    #[test]
    fn test_optional_operations_default_to_unsupported() {
        let journal = SharedJournal::default();
        let mut device = FakeDevice::new(journal);
        assert!(matches!(device.networks_scan(), Err(CoreError::Unsupported("networks_scan"))));
        assert!(matches!(device.interrupt(), Err(CoreError::Unsupported("interrupt"))));
    }
}
